//! Score filters applied to base-model logits before any token is chosen.
//!
//! Filters see the token history the logits condition on. Inside a candidate
//! tree that history differs per path and position, so [`FilterChain`]
//! replays it for every verified distribution.

use candle_core::{IndexOp, Tensor};

use crate::error::Result;
use crate::speculative::Candidates;

/// Adjusts one distribution of scores.
pub trait ScoreFilter {
    /// Return adjusted `scores` `[vocab]` for the next token after `history`
    /// (prompt included).
    fn adjust(&mut self, history: &[u32], scores: &Tensor) -> Result<Tensor>;
}

/// Filters applied in insertion order.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn ScoreFilter>>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

impl FilterChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter.
    pub fn push(&mut self, filter: impl ScoreFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    /// Number of filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every filter over `scores` `[vocab]`.
    pub fn apply(&mut self, history: &[u32], scores: &Tensor) -> Result<Tensor> {
        let mut scores = scores.clone();
        for filter in &mut self.filters {
            scores = filter.adjust(history, &scores)?;
        }
        Ok(scores)
    }

    /// Run every filter over a `[1, vocab]` row.
    pub fn apply_row(&mut self, history: &[u32], row: &Tensor) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(row.clone());
        }
        Ok(self.apply(history, &row.squeeze(0)?)?.unsqueeze(0)?)
    }

    /// Run every filter over verified path logits `[num_paths, depth, vocab]`.
    ///
    /// Entry `(p, i)` is filtered with `committed` followed by path `p`'s
    /// tokens `0..=i` as history.
    pub fn apply_paths(
        &mut self,
        committed: &[u32],
        candidates: &Candidates,
        path_logits: &Tensor,
    ) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(path_logits.clone());
        }

        let (num_paths, depth, _) = path_logits.dims3()?;
        let mut history = committed.to_vec();
        let mut paths = Vec::with_capacity(num_paths);
        for path in 0..num_paths {
            let tokens = candidates.path(path);
            let mut rows = Vec::with_capacity(depth);
            for (position, &token) in tokens.iter().enumerate().take(depth) {
                history.truncate(committed.len() + position);
                history.push(token);
                rows.push(self.apply(&history, &path_logits.i((path, position))?)?);
            }
            paths.push(Tensor::stack(&rows, 0)?);
            history.truncate(committed.len());
        }
        Ok(Tensor::stack(&paths, 0)?)
    }
}
