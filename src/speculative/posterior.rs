//! Accept/reject evaluation of verified candidate paths.
//!
//! Given the verified per-path logits `[num_paths, depth, vocab]` and the
//! proposed path tokens `[num_paths, depth]`, position `i` of path `p` is
//! accepted when the verified distribution after tokens `0..=i` agrees with
//! proposed token `i + 1`. Acceptance always stops at the first rejected
//! position.
//!
//! Two rules are supported:
//!
//! - **Greedy** (`temperature == 0`): agreement means the proposed token is
//!   the argmax. This reproduces plain greedy decoding exactly.
//! - **Typical acceptance** (`temperature > 0`): the proposed token must carry
//!   more probability than an entropy-dependent threshold
//!   `min(posterior_threshold, exp(-entropy) * posterior_alpha)`.

use candle_core::{DType, Tensor, D};

use super::candidates::Candidates;
use crate::error::{Error, Result};

/// Added inside the entropy logarithm so zero-probability tokens stay finite.
pub const ENTROPY_EPSILON: f32 = 1e-5;

/// Outcome of evaluating one step's candidate paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptanceResult {
    /// Chosen path id.
    pub best_path: usize,
    /// Number of proposed tokens accepted after the root, in `[0, depth - 1]`.
    pub accept_length: usize,
    /// Accept length of every path.
    pub path_accept_lengths: Vec<usize>,
}

/// Stateless posterior decision function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorEvaluator {
    temperature: f32,
    posterior_threshold: f32,
    posterior_alpha: f32,
}

impl PosteriorEvaluator {
    /// Create an evaluator. A temperature of 0 selects greedy acceptance.
    pub fn new(temperature: f32, posterior_threshold: f32, posterior_alpha: f32) -> Result<Self> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be finite and non-negative, got {temperature}"
            )));
        }
        if !posterior_threshold.is_finite() || posterior_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "posterior threshold must be positive, got {posterior_threshold}"
            )));
        }
        if !posterior_alpha.is_finite() || posterior_alpha < 0.0 {
            return Err(Error::Config(format!(
                "posterior alpha must be non-negative, got {posterior_alpha}"
            )));
        }
        Ok(Self {
            temperature,
            posterior_threshold,
            posterior_alpha,
        })
    }

    /// Greedy evaluator.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            posterior_threshold: 0.09,
            posterior_alpha: 0.3,
        }
    }

    /// Whether this evaluator uses the greedy rule.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Evaluate `path_logits` `[num_paths, depth, vocab]` against the proposed
    /// candidates.
    pub fn evaluate(&self, path_logits: &Tensor, candidates: &Candidates) -> Result<AcceptanceResult> {
        let (num_paths, depth, _) = path_logits
            .dims3()
            .map_err(|_| Error::shape("path logits", "[paths, depth, vocab]", path_logits.dims()))?;
        if num_paths != candidates.num_paths() || depth != candidates.depth() {
            return Err(Error::shape(
                "path logits",
                format!("[{}, {}, vocab]", candidates.num_paths(), candidates.depth()),
                path_logits.dims(),
            ));
        }

        if depth == 1 {
            return Ok(AcceptanceResult {
                best_path: 0,
                accept_length: 0,
                path_accept_lengths: vec![0; num_paths],
            });
        }

        // Logits at position i judge proposed token i + 1; the last position
        // only seeds the next step.
        let judged = path_logits.narrow(1, 0, depth - 1)?.to_dtype(DType::F32)?.contiguous()?;

        if self.is_greedy() {
            self.evaluate_greedy(&judged, candidates)
        } else {
            self.evaluate_typical(&judged, candidates)
        }
    }

    fn evaluate_greedy(&self, judged: &Tensor, candidates: &Candidates) -> Result<AcceptanceResult> {
        let predicted: Vec<Vec<u32>> = judged.argmax(D::Minus1)?.to_vec2()?;

        let path_accept_lengths: Vec<usize> = predicted
            .iter()
            .enumerate()
            .map(|(path, row)| {
                let proposed = &candidates.path(path)[1..];
                accepted_prefix(row.iter().zip(proposed).map(|(p, c)| p == c))
            })
            .collect();

        // Lowest path id wins ties.
        let (best_path, accept_length) = path_accept_lengths
            .iter()
            .enumerate()
            .fold((0, 0), |best, (path, &len)| if len > best.1 { (path, len) } else { best });

        Ok(AcceptanceResult {
            best_path,
            accept_length,
            path_accept_lengths,
        })
    }

    fn evaluate_typical(&self, judged: &Tensor, candidates: &Candidates) -> Result<AcceptanceResult> {
        let (num_paths, judged_len, _) = judged.dims3()?;

        let probs = candle_nn::ops::softmax_last_dim(&(judged / self.temperature as f64)?)?;

        let proposed: Vec<u32> = (0..num_paths)
            .flat_map(|path| candidates.path(path)[1..].to_vec())
            .collect();
        let index = Tensor::from_vec(proposed, (num_paths, judged_len, 1), judged.device())?;
        let candidate_probs: Vec<Vec<f32>> = probs.gather(&index, D::Minus1)?.squeeze(D::Minus1)?.to_vec2()?;

        let entropy: Vec<Vec<f32>> = (&probs * (&probs + ENTROPY_EPSILON as f64)?.log()?)?
            .sum(D::Minus1)?
            .neg()?
            .to_vec2()?;

        let path_accept_lengths: Vec<usize> = candidate_probs
            .iter()
            .zip(&entropy)
            .map(|(probs, entropies)| {
                accepted_prefix(probs.iter().zip(entropies).map(|(&p, &h)| {
                    p > acceptance_threshold(h, self.posterior_threshold, self.posterior_alpha)
                }))
            })
            .collect();

        let accept_length = path_accept_lengths.iter().copied().max().unwrap_or(0);
        if accept_length == 0 {
            return Ok(AcceptanceResult {
                best_path: 0,
                accept_length: 0,
                path_accept_lengths,
            });
        }

        // Among the longest paths, keep the most likely accepted prefix.
        let mut best_path = 0;
        let mut best_likelihood = f32::NEG_INFINITY;
        for (path, &len) in path_accept_lengths.iter().enumerate() {
            if len != accept_length {
                continue;
            }
            let likelihood: f32 = candidate_probs[path][..accept_length].iter().map(|p| p.ln()).sum();
            if likelihood > best_likelihood {
                best_likelihood = likelihood;
                best_path = path;
            }
        }

        Ok(AcceptanceResult {
            best_path,
            accept_length,
            path_accept_lengths,
        })
    }
}

/// Typical-acceptance threshold for a position whose verified distribution has
/// the given entropy.
pub fn acceptance_threshold(entropy: f32, posterior_threshold: f32, posterior_alpha: f32) -> f32 {
    posterior_threshold.min((-entropy).exp() * posterior_alpha)
}

/// Length of the leading run of `true` values.
fn accepted_prefix(mask: impl Iterator<Item = bool>) -> usize {
    mask.take_while(|&accepted| accepted).count()
}
