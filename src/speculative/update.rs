//! Post-verification state update.
//!
//! After the best path is chosen, its accepted prefix is appended to the
//! sequence and its staged cache rows are committed; the siblings stay past
//! the committed marker and are overwritten by the next step. The logits at
//! the last accepted node seed the next step's candidates.

use candle_core::{IndexOp, Tensor, D};

use super::candidates::Candidates;
use super::posterior::AcceptanceResult;
use super::topology::TreeTopology;
use super::verifier::Verification;
use crate::core::kv_cache::KvCache;
use crate::core::sequence::SequenceState;
use crate::error::{Error, Result};

/// Logits the next step proposes from.
#[derive(Debug, Clone)]
pub struct StepSeed {
    /// Base logits `[1, vocab]`.
    pub base_logits: Tensor,
    /// Head logits `[num_heads, 1, vocab]`.
    pub head_logits: Tensor,
}

/// Outcome of one update.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    /// Tokens appended to the sequence this step.
    pub appended: Vec<u32>,
    /// Chosen path id.
    pub best_path: usize,
    /// Proposed tokens accepted after the root.
    pub accept_length: usize,
    /// Seed for the next step.
    pub seed: StepSeed,
}

/// Commits one step's accepted tokens.
#[derive(Debug, Clone)]
pub struct InferenceStateUpdater {
    use_base_logits: bool,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl InferenceStateUpdater {
    /// Create an updater.
    ///
    /// With `use_base_logits`, the base model's prediction after the last
    /// accepted token is appended as a bonus token every step.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an EOS id is given without a pad id.
    pub fn new(use_base_logits: bool, eos_token_id: Option<u32>, pad_token_id: Option<u32>) -> Result<Self> {
        if eos_token_id.is_some() && pad_token_id.is_none() {
            return Err(Error::Config(
                "an eos token id requires a pad token id".into(),
            ));
        }
        Ok(Self {
            use_base_logits,
            eos_token_id,
            pad_token_id,
        })
    }

    /// Whether a bonus token is appended every step.
    pub fn use_base_logits(&self) -> bool {
        self.use_base_logits
    }

    /// Apply `acceptance` to `state` and `cache`.
    pub fn update(
        &self,
        state: &mut SequenceState,
        cache: &mut KvCache,
        acceptance: &AcceptanceResult,
        candidates: &Candidates,
        verification: &Verification,
        topology: &TreeTopology,
    ) -> Result<StepUpdate> {
        let best = acceptance.best_path;
        let accept = acceptance.accept_length;
        if best >= candidates.num_paths() || accept >= candidates.depth() {
            return Err(Error::Config(format!(
                "acceptance (path {best}, length {accept}) outside a tree of {} paths of depth {}",
                candidates.num_paths(),
                candidates.depth()
            )));
        }

        let accepted = &candidates.path(best)[..=accept];

        // A pending root is already part of the output.
        let skip = match state.take_pending_root() {
            Some(root) if root == accepted[0] => 1,
            Some(root) => {
                return Err(Error::Model(format!(
                    "pending root {root} differs from verified root {}",
                    accepted[0]
                )));
            }
            None => 0,
        };
        let mut appended = accepted[skip..].to_vec();

        let last_logits = verification.path_logits.i((best, accept))?;
        if self.use_base_logits {
            let bonus = last_logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            appended.push(bonus);
            state.set_pending_root(bonus);
        }

        if state.is_finished() && self.eos_token_id.is_some() {
            if let Some(pad) = self.pad_token_id {
                appended.iter_mut().for_each(|token| *token = pad);
            }
        }
        for &token in &appended {
            state.append_token(token);
        }

        let nodes = &topology.path(best)[..=accept];
        cache.commit(nodes)?;

        let last_node = nodes[accept];
        let seed = StepSeed {
            base_logits: last_logits.unsqueeze(0)?,
            head_logits: verification.node_head_logits.narrow(1, last_node, 1)?,
        };

        Ok(StepUpdate {
            appended,
            best_path: best,
            accept_length: accept,
            seed,
        })
    }
}
