//! Candidate tree topology.
//!
//! A [`BranchSpec`] lists one branch factor per tree depth. The topology it
//! describes is a full tree: every node at depth `i` has `b[i + 1]` children.
//! All of the tree is stored as flat index buffers keyed by node id, with node
//! ids assigned breadth-first and parent-major inside each depth.
//!
//! ## Example
//!
//! ```text
//! BranchSpec [1, 2, 2]             node ids            pool slots
//!
//!            root                      0                    0
//!          /      \                 /     \              /     \
//!        a0        a1              1       2            1       2
//!       /  \      /  \            / \     / \          / \     / \
//!     b0   b1   b0   b1          3   4   5   6        3   4   3   4
//! ```
//!
//! The candidate pool is `[root, a0, a1, b0, b1]`; `tree_indices` maps every
//! node to its pool slot, `retrieve_indices` lists the four root-to-leaf paths
//! `[0,1,3] [0,1,4] [0,2,5] [0,2,6]`, and the ancestry mask lets node 5 see
//! only nodes 0, 2 and itself.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Branch factor per tree depth.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchSpec {
    factors: Vec<usize>,
}

impl BranchSpec {
    /// Create a branch spec, rejecting empty specs, zero factors and trees
    /// whose size does not fit in `usize`.
    pub fn new(factors: Vec<usize>) -> Result<Self> {
        if factors.is_empty() {
            return Err(Error::Config("branch spec must not be empty".into()));
        }
        if let Some(depth) = factors.iter().position(|&f| f == 0) {
            return Err(Error::Config(format!(
                "branch factor at depth {depth} must be positive"
            )));
        }

        let mut prod = 1usize;
        let mut nodes = 0usize;
        for &factor in &factors {
            prod = prod
                .checked_mul(factor)
                .ok_or_else(|| Error::Config(format!("branch spec {factors:?} overflows")))?;
            nodes = nodes
                .checked_add(prod)
                .ok_or_else(|| Error::Config(format!("branch spec {factors:?} overflows")))?;
        }

        Ok(Self { factors })
    }

    /// Branch spec for a generation run: a width-1 root level (the base
    /// model's greedy token) followed by one level per Medusa head.
    pub fn from_top_k(top_k: &[usize]) -> Result<Self> {
        let mut factors = Vec::with_capacity(top_k.len() + 1);
        factors.push(1);
        factors.extend_from_slice(top_k);
        Self::new(factors)
    }

    /// Branch factors, one per depth.
    pub fn factors(&self) -> &[usize] {
        &self.factors
    }

    /// Number of depth levels.
    pub fn depth(&self) -> usize {
        self.factors.len()
    }

    /// Number of root-to-leaf paths (product of all factors).
    pub fn num_paths(&self) -> usize {
        self.factors.iter().product()
    }

    /// Total number of tree nodes.
    pub fn node_count(&self) -> usize {
        self.factors
            .iter()
            .scan(1usize, |prod, &f| {
                *prod *= f;
                Some(*prod)
            })
            .sum()
    }

    /// Number of candidate pool slots (sum of all factors).
    pub fn pool_size(&self) -> usize {
        self.factors.iter().sum()
    }
}

/// Flat description of the candidate tree.
///
/// Built once per generation run and shared read-only by every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeTopology {
    branch_spec: BranchSpec,
    /// Node id -> candidate pool slot.
    tree_indices: Vec<usize>,
    /// Row-major `[node_count, node_count]`; `[i][j]` is set iff `j` is `i`
    /// or one of its ancestors.
    ancestry: Vec<bool>,
    /// Node id -> depth.
    depths: Vec<usize>,
    /// Row-major `[num_paths, depth]` node ids.
    retrieve_indices: Vec<usize>,
    /// Row-major `[pool_size, num_paths]`, path-major grouping of node ids.
    list_indices: Vec<usize>,
    /// First node id of every depth.
    depth_starts: Vec<usize>,
}

impl TreeTopology {
    /// Build every buffer for `spec`.
    pub fn new(spec: &BranchSpec) -> Self {
        let b = spec.factors();
        let levels = b.len();

        let mut cumprod = Vec::with_capacity(levels);
        let mut cumsum = Vec::with_capacity(levels);
        let (mut prod, mut sum) = (1usize, 0usize);
        for &factor in b {
            prod *= factor;
            sum += factor;
            cumprod.push(prod);
            cumsum.push(sum);
        }
        let node_count: usize = cumprod.iter().sum();
        let num_paths = cumprod[levels - 1];

        let mut depth_starts = Vec::with_capacity(levels);
        let mut start = 0;
        for &count in &cumprod {
            depth_starts.push(start);
            start += count;
        }
        let parents_at = |depth: usize| if depth == 0 { 1 } else { cumprod[depth - 1] };

        let mut tree_indices = Vec::with_capacity(node_count);
        for depth in 0..levels {
            let pool_start = cumsum[depth] - b[depth];
            for _ in 0..parents_at(depth) {
                tree_indices.extend(pool_start..pool_start + b[depth]);
            }
        }

        let depths: Vec<usize> = cumprod
            .iter()
            .enumerate()
            .flat_map(|(depth, &count)| std::iter::repeat_n(depth, count))
            .collect();

        // Depths are processed in order, so a parent's row is already closed
        // over its own ancestors when the child copies it.
        let mut ancestry = vec![false; node_count * node_count];
        for node in 0..node_count {
            ancestry[node * node_count + node] = true;
        }
        for depth in 1..levels {
            for local in 0..cumprod[depth] {
                let child = depth_starts[depth] + local;
                let parent = depth_starts[depth - 1] + local / b[depth];
                for col in 0..child {
                    if ancestry[parent * node_count + col] {
                        ancestry[child * node_count + col] = true;
                    }
                }
            }
        }

        let mut retrieve_indices = Vec::with_capacity(num_paths * levels);
        for path in 0..num_paths {
            for depth in 0..levels {
                let stride = num_paths / cumprod[depth];
                retrieve_indices.push(depth_starts[depth] + path / stride);
            }
        }

        let pool_size = cumsum[levels - 1];
        let mut list_indices = vec![0usize; pool_size * num_paths];
        for depth in 0..levels {
            let parents = parents_at(depth);
            let row_start = cumsum[depth] - b[depth];
            for child in 0..b[depth] {
                for path in 0..num_paths {
                    list_indices[(row_start + child) * num_paths + path] =
                        depth_starts[depth] + (path % parents) * b[depth] + child;
                }
            }
        }

        debug_assert_eq!(
            (0..levels).map(|d| b[d] * parents_at(d)).sum::<usize>(),
            node_count
        );

        Self {
            branch_spec: spec.clone(),
            tree_indices,
            ancestry,
            depths,
            retrieve_indices,
            list_indices,
            depth_starts,
        }
    }

    /// The branch spec this topology was built from.
    pub fn branch_spec(&self) -> &BranchSpec {
        &self.branch_spec
    }

    /// Total number of tree nodes (N).
    pub fn node_count(&self) -> usize {
        self.tree_indices.len()
    }

    /// Number of root-to-leaf paths.
    pub fn num_paths(&self) -> usize {
        self.retrieve_indices.len() / self.depth()
    }

    /// Number of depth levels, which is also the length of every path.
    pub fn depth(&self) -> usize {
        self.branch_spec.depth()
    }

    /// Number of candidate pool slots the tree draws from.
    pub fn pool_size(&self) -> usize {
        self.branch_spec.pool_size()
    }

    /// Node id -> candidate pool slot.
    pub fn tree_indices(&self) -> &[usize] {
        &self.tree_indices
    }

    /// Depth of every node, in node-id order.
    pub fn depths(&self) -> &[usize] {
        &self.depths
    }

    /// Depth of a single node.
    pub fn depth_of(&self, node: usize) -> usize {
        self.depths[node]
    }

    /// First node id at `depth`.
    pub fn depth_start(&self, depth: usize) -> usize {
        self.depth_starts[depth]
    }

    /// Parent of `node`, or `None` for nodes at depth 0.
    pub fn parent_of(&self, node: usize) -> Option<usize> {
        let depth = self.depths[node];
        if depth == 0 {
            return None;
        }
        let local = node - self.depth_starts[depth];
        let factor = self.branch_spec.factors()[depth];
        Some(self.depth_starts[depth - 1] + local / factor)
    }

    /// Whether `key` is `query` itself or one of its ancestors.
    pub fn is_visible(&self, query: usize, key: usize) -> bool {
        self.ancestry[query * self.node_count() + key]
    }

    /// Ancestry mask row of `node`.
    pub fn ancestry_row(&self, node: usize) -> &[bool] {
        let n = self.node_count();
        &self.ancestry[node * n..(node + 1) * n]
    }

    /// Node ids along path `path`, root first.
    pub fn path(&self, path: usize) -> &[usize] {
        let depth = self.depth();
        &self.retrieve_indices[path * depth..(path + 1) * depth]
    }

    /// Row-major `[num_paths, depth]` path table.
    pub fn retrieve_indices(&self) -> &[usize] {
        &self.retrieve_indices
    }

    /// Experimental path-major grouping of node ids, row-major
    /// `[pool_size, num_paths]`. Row `r` lists, for every path slot, the node
    /// that holds pool candidate `r` under that slot's parent. Not used by the
    /// step loop.
    pub fn list_indices(&self) -> &[usize] {
        &self.list_indices
    }
}

/// Device-resident buffers derived from a [`TreeTopology`].
#[derive(Debug, Clone)]
pub struct TreeBuffers {
    /// Additive attention bias `[N, N]`: 0 where visible, -inf elsewhere.
    attention_bias: Tensor,
    /// `[num_paths * depth]` node ids, u32.
    retrieve_indices: Tensor,
    depths: Vec<u32>,
    num_paths: usize,
    depth: usize,
    device: Device,
}

impl TreeBuffers {
    /// Place the topology's buffers on `device`.
    pub fn new(topology: &TreeTopology, dtype: DType, device: &Device) -> Result<Self> {
        let n = topology.node_count();
        let bias: Vec<f32> = topology
            .ancestry
            .iter()
            .map(|&visible| if visible { 0.0 } else { f32::NEG_INFINITY })
            .collect();
        let attention_bias = Tensor::from_vec(bias, (n, n), device)?.to_dtype(dtype)?;

        let retrieve: Vec<u32> = topology.retrieve_indices.iter().map(|&i| i as u32).collect();
        let retrieve_indices = Tensor::from_vec(retrieve, topology.retrieve_indices.len(), device)?;

        Ok(Self {
            attention_bias,
            retrieve_indices,
            depths: topology.depths.iter().map(|&d| d as u32).collect(),
            num_paths: topology.num_paths(),
            depth: topology.depth(),
            device: device.clone(),
        })
    }

    /// Tree attention bias `[N, N]`.
    pub fn attention_bias(&self) -> &Tensor {
        &self.attention_bias
    }

    /// Flattened path table, u32 `[num_paths * depth]`.
    pub fn retrieve_indices(&self) -> &Tensor {
        &self.retrieve_indices
    }

    /// Position ids of the tree nodes when the committed prefix is `offset`
    /// tokens long.
    pub fn position_ids(&self, offset: usize) -> Result<Tensor> {
        let positions: Vec<u32> = self.depths.iter().map(|&d| d + offset as u32).collect();
        let len = positions.len();
        Ok(Tensor::from_vec(positions, len, &self.device)?)
    }

    /// Number of paths.
    pub fn num_paths(&self) -> usize {
        self.num_paths
    }

    /// Path length.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Device holding the buffers.
    pub fn device(&self) -> &Device {
        &self.device
    }
}
