//! Tree verification.
//!
//! Every tree node is fed to the base model in a single forward pass. Node
//! `i` sits at position `committed_len + depth(i)` and attends to the
//! committed prefix, its ancestors and itself, so its logits equal those a
//! plain sequential pass over its root-to-node path would produce.

use candle_core::Tensor;
use tracing::{debug, warn};

use super::candidates::Candidates;
use super::topology::TreeBuffers;
use crate::core::kv_cache::KvCache;
use crate::error::{Error, Result};
use crate::model::MedusaModel;

/// Logits produced by verifying one candidate tree.
#[derive(Debug, Clone)]
pub struct Verification {
    /// Base logits per tree node `[node_count, vocab]`.
    pub node_logits: Tensor,
    /// Head logits per tree node `[num_heads, node_count, vocab]`.
    pub node_head_logits: Tensor,
    /// Base logits regrouped by path `[num_paths, depth, vocab]`. Entry
    /// `(p, i)` is the distribution after path `p`'s tokens `0..=i`.
    pub path_logits: Tensor,
}

/// Runs the tree-shaped forward pass.
#[derive(Debug, Default)]
pub struct TreeVerifier {
    warned_no_cache: bool,
}

impl TreeVerifier {
    /// Create a verifier for one generation run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `candidates` against `model`, staging one cache row per node.
    pub fn verify<M: MedusaModel + ?Sized>(
        &mut self,
        model: &M,
        candidates: &Candidates,
        buffers: &TreeBuffers,
        cache: &mut KvCache,
    ) -> Result<Verification> {
        if !model.uses_kv_cache() && !self.warned_no_cache {
            warn!("model does not use the kv cache; every step recomputes the full prefix");
            self.warned_no_cache = true;
        }

        let tokens = candidates.tree_tokens();
        let node_count = tokens.len();
        let bias = buffers.attention_bias();
        if bias.dims() != [node_count, node_count] {
            return Err(Error::shape(
                "tree attention bias",
                format!("[{node_count}, {node_count}]"),
                bias.dims(),
            ));
        }

        let committed = cache.committed_len();
        let positions = buffers.position_ids(committed)?;
        let input = model.prepare_inputs(tokens, &positions, bias, cache)?;
        let output = model.forward(&input, cache)?;

        let (rows, vocab) = output
            .logits
            .dims2()
            .map_err(|_| Error::shape("tree logits", "[nodes, vocab]", output.logits.dims()))?;
        if rows != node_count {
            return Err(Error::shape(
                "tree logits",
                format!("[{node_count}, vocab]"),
                output.logits.dims(),
            ));
        }

        let path_logits = output
            .logits
            .index_select(buffers.retrieve_indices(), 0)?
            .reshape((buffers.num_paths(), buffers.depth(), vocab))?;

        debug!(committed, node_count, "verified candidate tree");

        Ok(Verification {
            node_logits: output.logits,
            node_head_logits: output.head_logits,
            path_logits,
        })
    }
}
