//! Candidate proposal.
//!
//! Turns the current step's logits into the candidate pool and lays the pool
//! out both as Cartesian paths and as tree nodes:
//!
//! ```text
//! base logits ──argmax──► root ─┐
//! head 0 logits ──top-k0──► c0 ─┼─► pool [root | c0 | c1 | ...]
//! head 1 logits ──top-k1──► c1 ─┘        │
//!                                        ├─ cartesian ─► paths  [num_paths, depth]
//!                                        └─ tree_indices ─► tree [node_count]
//! ```
//!
//! Heads are proposed independently of each other, so a path may combine
//! tokens that no single head would have chained.

use candle_core::{DType, Device, IndexOp, Tensor, D};

use super::topology::TreeTopology;
use crate::error::{Error, Result};

/// Candidate tokens for one decoding step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    /// `[root, head 0 top-k..., head 1 top-k..., ...]`.
    pool: Vec<u32>,
    /// Row-major `[num_paths, depth]`.
    path_tokens: Vec<u32>,
    /// One token per tree node.
    tree_tokens: Vec<u32>,
    depth: usize,
}

impl Candidates {
    /// Greedy root token shared by every path.
    pub fn root(&self) -> u32 {
        self.pool[0]
    }

    /// Flattened candidate pool.
    pub fn pool(&self) -> &[u32] {
        &self.pool
    }

    /// Tokens along path `path`, root first.
    pub fn path(&self, path: usize) -> &[u32] {
        &self.path_tokens[path * self.depth..(path + 1) * self.depth]
    }

    /// Number of candidate paths.
    pub fn num_paths(&self) -> usize {
        self.path_tokens.len() / self.depth
    }

    /// Path length (root included).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Row-major `[num_paths, depth]` path tokens.
    pub fn path_tokens(&self) -> &[u32] {
        &self.path_tokens
    }

    /// Tokens in tree-node order, fed verbatim to the verification pass.
    pub fn tree_tokens(&self) -> &[u32] {
        &self.tree_tokens
    }

    /// Path tokens as a `[num_paths, depth]` u32 tensor.
    pub fn paths_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.path_tokens.clone(),
            (self.num_paths(), self.depth),
            device,
        )?)
    }
}

/// Builds [`Candidates`] from base and Medusa head logits.
#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    top_k: Vec<usize>,
}

impl CandidateGenerator {
    /// Create a generator taking `top_k[h]` candidates from head `h`.
    pub fn new(top_k: Vec<usize>) -> Result<Self> {
        if let Some(head) = top_k.iter().position(|&k| k == 0) {
            return Err(Error::Config(format!("top-k of head {head} must be at least 1")));
        }
        Ok(Self { top_k })
    }

    /// Per-head top-k values.
    pub fn top_k(&self) -> &[usize] {
        &self.top_k
    }

    /// Propose candidates from the last position of the given logits.
    ///
    /// # Arguments
    ///
    /// * `head_logits` - Medusa head logits `[num_heads, seq_len, vocab_size]`
    /// * `base_logits` - Base model logits `[seq_len, vocab_size]`
    /// * `topology` - Tree built from `[1, top_k...]`
    pub fn generate(
        &self,
        head_logits: &Tensor,
        base_logits: &Tensor,
        topology: &TreeTopology,
    ) -> Result<Candidates> {
        let factors = topology.branch_spec().factors();
        if factors[0] != 1 || factors[1..] != self.top_k[..] {
            return Err(Error::Config(format!(
                "topology {factors:?} was not built from top-k {:?}",
                self.top_k
            )));
        }

        let (seq_len, _) = base_logits
            .dims2()
            .map_err(|_| Error::shape("base logits", "[seq_len, vocab]", base_logits.dims()))?;
        if seq_len == 0 {
            return Err(Error::shape("base logits", "at least one position", base_logits.dims()));
        }
        let root = base_logits.i(seq_len - 1)?.argmax(D::Minus1)?.to_scalar::<u32>()?;

        let mut pool = Vec::with_capacity(topology.pool_size());
        pool.push(root);
        if !self.top_k.is_empty() {
            let (num_heads, head_seq_len, _) = head_logits.dims3().map_err(|_| {
                Error::shape("head logits", "[heads, seq_len, vocab]", head_logits.dims())
            })?;
            if num_heads < self.top_k.len() {
                return Err(Error::Config(format!(
                    "{} heads configured but the model produced {num_heads}",
                    self.top_k.len()
                )));
            }
            if head_seq_len == 0 {
                return Err(Error::shape("head logits", "at least one position", head_logits.dims()));
            }
            for (head, &k) in self.top_k.iter().enumerate() {
                let logits = head_logits.i((head, head_seq_len - 1))?;
                pool.extend(top_k_indices(&logits, k)?);
            }
        }

        let depth = factors.len();
        let num_paths = topology.num_paths();

        // Last head varies fastest, matching the retrieve_indices order.
        let mut path_tokens = Vec::with_capacity(num_paths * depth);
        for path in 0..num_paths {
            let mut stride = num_paths;
            let mut slot_start = 0;
            for &factor in factors {
                stride /= factor;
                path_tokens.push(pool[slot_start + (path / stride) % factor]);
                slot_start += factor;
            }
        }

        let tree_tokens = topology.tree_indices().iter().map(|&slot| pool[slot]).collect();

        Ok(Candidates {
            pool,
            path_tokens,
            tree_tokens,
            depth,
        })
    }
}

/// Indices of the `k` largest entries of a 1D logits tensor, best first.
/// Equal logits keep the lower token id first.
fn top_k_indices(logits: &Tensor, k: usize) -> Result<Vec<u32>> {
    let values: Vec<f32> = logits.to_dtype(DType::F32)?.to_vec1()?;
    if k > values.len() {
        return Err(Error::Config(format!(
            "top-k {k} exceeds vocabulary size {}",
            values.len()
        )));
    }

    let mut indexed: Vec<(usize, f32)> = values.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    Ok(indexed.into_iter().take(k).map(|(i, _)| i as u32).collect())
}
