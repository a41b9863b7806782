//! Medusa decoding configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::topology::BranchSpec;
use crate::error::{Error, Result};

/// Default floor of the typical-acceptance threshold.
pub const DEFAULT_POSTERIOR_THRESHOLD: f32 = 0.09;

/// Default entropy scaling of the typical-acceptance threshold.
pub const DEFAULT_POSTERIOR_ALPHA: f32 = 0.3;

/// Configuration for Medusa decoding.
///
/// The candidate tree has one level per entry of `medusa_top_k` below the
/// root, so `[4, 3]` verifies `1 + 4 + 12 = 17` nodes along `12` paths per
/// step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedusaConfig {
    /// Candidates taken from each Medusa head, head 0 first.
    pub medusa_top_k: Vec<usize>,

    /// Acceptance temperature. 0 selects greedy acceptance, which reproduces
    /// plain greedy decoding exactly.
    pub temperature: f32,

    /// Upper bound of the typical-acceptance threshold.
    pub posterior_threshold: f32,

    /// Scale of `exp(-entropy)` in the typical-acceptance threshold.
    pub posterior_alpha: f32,

    /// Append the base model's prediction after the last accepted token as a
    /// bonus token every step.
    pub use_base_logits: bool,

    /// End-of-sequence token id.
    pub eos_token_id: Option<u32>,

    /// Token written in place of output once a sequence has finished.
    /// Required whenever `eos_token_id` is set.
    pub pad_token_id: Option<u32>,

    /// Largest tree (number of paths) the engine accepts.
    pub max_num_paths: usize,

    /// Maximum number of generated tokens.
    pub max_new_tokens: usize,
}

impl Default for MedusaConfig {
    fn default() -> Self {
        Self {
            medusa_top_k: vec![4, 3, 2],
            temperature: 0.0,
            posterior_threshold: DEFAULT_POSTERIOR_THRESHOLD,
            posterior_alpha: DEFAULT_POSTERIOR_ALPHA,
            use_base_logits: false,
            eos_token_id: None,
            pad_token_id: None,
            max_num_paths: 256,
            max_new_tokens: 128,
        }
    }
}

impl MedusaConfig {
    /// Create a config with the given per-head top-k.
    pub fn new(medusa_top_k: Vec<usize>) -> Self {
        Self {
            medusa_top_k,
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the acceptance temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the typical-acceptance threshold and alpha.
    pub fn posterior(mut self, threshold: f32, alpha: f32) -> Self {
        self.posterior_threshold = threshold;
        self.posterior_alpha = alpha;
        self
    }

    /// Enable or disable the bonus token.
    pub fn use_base_logits(mut self, enabled: bool) -> Self {
        self.use_base_logits = enabled;
        self
    }

    /// Set the EOS and pad token ids.
    pub fn eos(mut self, eos_token_id: u32, pad_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self.pad_token_id = Some(pad_token_id);
        self
    }

    /// Set the maximum number of generated tokens.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the tree size cap.
    pub fn max_num_paths(mut self, max_num_paths: usize) -> Self {
        self.max_num_paths = max_num_paths;
        self
    }

    /// Tree shape for this config: `[1, medusa_top_k...]`.
    pub fn branch_spec(&self) -> Result<BranchSpec> {
        BranchSpec::from_top_k(&self.medusa_top_k)
    }

    /// Check every field, including the tree size cap.
    pub fn validate(&self) -> Result<()> {
        let spec = self.branch_spec()?;
        if spec.num_paths() > self.max_num_paths {
            return Err(Error::Config(format!(
                "top-k {:?} gives {} paths, above the cap of {}",
                self.medusa_top_k,
                spec.num_paths(),
                self.max_num_paths
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if !self.posterior_threshold.is_finite() || self.posterior_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "posterior threshold must be positive, got {}",
                self.posterior_threshold
            )));
        }
        if !self.posterior_alpha.is_finite() || self.posterior_alpha < 0.0 {
            return Err(Error::Config(format!(
                "posterior alpha must be non-negative, got {}",
                self.posterior_alpha
            )));
        }
        if self.eos_token_id.is_some() && self.pad_token_id.is_none() {
            return Err(Error::Config("an eos token id requires a pad token id".into()));
        }
        Ok(())
    }
}
