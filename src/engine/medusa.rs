//! Medusa decoding engine.
//!
//! Drives one sequence from prompt to stop condition:
//!
//! ```text
//! prompt ──► prefill (causal) ──► seed logits
//!                                     │
//!      ┌──────────────────────────────┘
//!      ▼
//!  candidates ──► verify tree ──► score filters ──► evaluate ──► update ──┐
//!      ▲                                                                   │
//!      └──────────────────── seed logits (until EOS / max tokens) ─────────┘
//! ```
//!
//! [`MedusaEngine::generate_greedy`] decodes one token per forward pass over
//! the same model. With greedy acceptance both produce the same tokens.

use candle_core::{DType, Tensor, D};
use tracing::{debug, info};

use super::filter::{FilterChain, ScoreFilter};
use crate::core::kv_cache::KvCache;
use crate::core::sequence::{FinishReason, SequenceState};
use crate::error::{Error, Result};
use crate::model::{causal_bias, position_range, MedusaModel};
use crate::speculative::{
    CandidateGenerator, InferenceStateUpdater, MedusaConfig, PosteriorEvaluator, StepSeed,
    TreeBuffers, TreeTopology, TreeVerifier,
};

/// Acceptance statistics of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcceptanceStats {
    /// Decoding steps (forward passes after prefill).
    pub steps: usize,
    /// Proposed tokens accepted beyond the root, summed over steps.
    pub accepted_tokens: usize,
    /// Tokens appended to the sequence, before stop truncation.
    pub generated_tokens: usize,
}

impl AcceptanceStats {
    fn record(&mut self, accept_length: usize, appended: usize) {
        self.steps += 1;
        self.accepted_tokens += accept_length;
        self.generated_tokens += appended;
    }

    /// Mean accept length per step.
    pub fn mean_accept_length(&self) -> f64 {
        if self.steps == 0 {
            return 0.0;
        }
        self.accepted_tokens as f64 / self.steps as f64
    }

    /// Tokens generated per forward pass.
    pub fn tokens_per_step(&self) -> f64 {
        if self.steps == 0 {
            return 0.0;
        }
        self.generated_tokens as f64 / self.steps as f64
    }
}

/// Output from a generation run.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt token IDs.
    pub prompt_tokens: Vec<u32>,
    /// Generated token IDs.
    pub output_tokens: Vec<u32>,
    /// Reason for finishing.
    pub finish_reason: Option<FinishReason>,
    /// Acceptance statistics.
    pub stats: AcceptanceStats,
}

impl GenerationOutput {
    fn from_state(state: SequenceState, stats: AcceptanceStats) -> Self {
        Self {
            prompt_tokens: state.prompt_token_ids().to_vec(),
            output_tokens: state.output_token_ids().to_vec(),
            finish_reason: state.finish_reason(),
            stats,
        }
    }

    /// Total number of tokens (prompt + output).
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens.len() + self.output_tokens.len()
    }
}

/// Medusa decoding engine.
///
/// The candidate tree is built once from the config and reused by every run.
#[derive(Debug)]
pub struct MedusaEngine {
    config: MedusaConfig,
    topology: TreeTopology,
    generator: CandidateGenerator,
    evaluator: PosteriorEvaluator,
    updater: InferenceStateUpdater,
    filters: FilterChain,
}

impl MedusaEngine {
    /// Create an engine, validating `config` and building the tree.
    pub fn new(config: MedusaConfig) -> Result<Self> {
        config.validate()?;

        let topology = TreeTopology::new(&config.branch_spec()?);
        let generator = CandidateGenerator::new(config.medusa_top_k.clone())?;
        let evaluator = PosteriorEvaluator::new(
            config.temperature,
            config.posterior_threshold,
            config.posterior_alpha,
        )?;
        let updater = InferenceStateUpdater::new(
            config.use_base_logits,
            config.eos_token_id,
            config.pad_token_id,
        )?;

        Ok(Self {
            config,
            topology,
            generator,
            evaluator,
            updater,
            filters: FilterChain::new(),
        })
    }

    /// Add a score filter applied after every filter added before it.
    pub fn with_filter(mut self, filter: impl ScoreFilter + 'static) -> Self {
        self.filters.push(filter);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &MedusaConfig {
        &self.config
    }

    /// Get the candidate tree.
    pub fn topology(&self) -> &TreeTopology {
        &self.topology
    }

    /// Generate with Medusa tree decoding.
    pub fn generate<M: MedusaModel + ?Sized>(
        &mut self,
        model: &M,
        prompt: &[u32],
    ) -> Result<GenerationOutput> {
        let num_heads = self.config.medusa_top_k.len();
        if model.num_medusa_heads() < num_heads {
            return Err(Error::Config(format!(
                "top-k lists {num_heads} heads but the model has {}",
                model.num_medusa_heads()
            )));
        }

        let node_count = self.topology.node_count();
        let mut cache = self.create_cache(model, prompt, node_count + 1)?;
        let dtype = cache.config().dtype;
        let buffers = TreeBuffers::new(&self.topology, dtype, model.device())?;
        let mut verifier = TreeVerifier::new();
        let mut state = SequenceState::new(prompt.to_vec());
        let mut stats = AcceptanceStats::default();

        info!(
            prompt_len = prompt.len(),
            nodes = node_count,
            paths = self.topology.num_paths(),
            greedy = self.evaluator.is_greedy(),
            "starting medusa generation"
        );

        let prefill = self.prefill(model, prompt, &mut cache, dtype)?;
        let mut seed = StepSeed {
            base_logits: self.filters.apply_row(prompt, &prefill.base_logits)?,
            head_logits: prefill.head_logits,
        };

        let eos = self.config.eos_token_id;
        let max_new_tokens = self.config.max_new_tokens;
        while state.check_stop(eos, max_new_tokens).is_none() {
            let candidates =
                self.generator
                    .generate(&seed.head_logits, &seed.base_logits, &self.topology)?;
            let mut verification = verifier.verify(model, &candidates, &buffers, &mut cache)?;

            if !self.filters.is_empty() {
                let history = state.committed_token_ids();
                verification.path_logits =
                    self.filters
                        .apply_paths(&history, &candidates, &verification.path_logits)?;
            }

            let acceptance = self.evaluator.evaluate(&verification.path_logits, &candidates)?;
            let update = self.updater.update(
                &mut state,
                &mut cache,
                &acceptance,
                &candidates,
                &verification,
                &self.topology,
            )?;
            stats.record(update.accept_length, update.appended.len());

            debug!(
                step = stats.steps,
                best_path = update.best_path,
                accept_length = update.accept_length,
                appended = ?update.appended,
                "medusa step"
            );
            seed = update.seed;
        }

        info!(
            output_len = state.output_len(),
            steps = stats.steps,
            mean_accept_length = stats.mean_accept_length(),
            finish_reason = state.finish_reason().map(|r| r.as_str()),
            "medusa generation finished"
        );
        Ok(GenerationOutput::from_state(state, stats))
    }

    /// Generate one token per forward pass with plain greedy decoding.
    pub fn generate_greedy<M: MedusaModel + ?Sized>(
        &mut self,
        model: &M,
        prompt: &[u32],
    ) -> Result<GenerationOutput> {
        let mut cache = self.create_cache(model, prompt, 1)?;
        let dtype = cache.config().dtype;
        let mut state = SequenceState::new(prompt.to_vec());
        let mut stats = AcceptanceStats::default();

        let eos = self.config.eos_token_id;
        let max_new_tokens = self.config.max_new_tokens;
        if state.check_stop(eos, max_new_tokens).is_some() {
            return Ok(GenerationOutput::from_state(state, stats));
        }

        let prefill = self.prefill(model, prompt, &mut cache, dtype)?;
        let mut logits = self.filters.apply_row(prompt, &prefill.base_logits)?;
        let bias = Tensor::zeros((1, 1), dtype, model.device())?;

        loop {
            let token = logits.squeeze(0)?.argmax(D::Minus1)?.to_scalar::<u32>()?;
            state.append_token(token);
            stats.record(0, 1);
            if state.check_stop(eos, max_new_tokens).is_some() {
                break;
            }

            let positions = position_range(cache.committed_len(), 1, model.device())?;
            let input = model.prepare_inputs(&[token], &positions, &bias, &cache)?;
            let output = model.forward(&input, &mut cache)?;
            cache.commit_staged()?;
            logits = self.filters.apply_row(&state.all_token_ids(), &output.logits)?;
        }

        debug!(output_len = state.output_len(), "greedy generation finished");
        Ok(GenerationOutput::from_state(state, stats))
    }

    /// Cache sized for the prompt, the token budget and `extra` staged rows.
    fn create_cache<M: MedusaModel + ?Sized>(
        &self,
        model: &M,
        prompt: &[u32],
        extra: usize,
    ) -> Result<KvCache> {
        if prompt.is_empty() {
            return Err(Error::Config("prompt must not be empty".into()));
        }

        let config = model.kv_cache_config();
        let needed = prompt.len() + self.config.max_new_tokens + extra;
        if needed > config.capacity {
            return Err(Error::CacheOverflow {
                requested: needed,
                capacity: config.capacity,
            });
        }
        KvCache::new(config.with_capacity(needed), model.device())
    }

    /// Run the prompt causally, commit its rows and return the last
    /// position's logits.
    fn prefill<M: MedusaModel + ?Sized>(
        &self,
        model: &M,
        prompt: &[u32],
        cache: &mut KvCache,
        dtype: DType,
    ) -> Result<StepSeed> {
        let len = prompt.len();
        let positions = position_range(0, len, model.device())?;
        let bias = causal_bias(len, dtype, model.device())?;

        let input = model.prepare_inputs(prompt, &positions, &bias, cache)?;
        let output = model.forward(&input, cache)?;
        cache.commit_staged()?;

        Ok(StepSeed {
            base_logits: output.logits.narrow(0, len - 1, 1)?,
            head_logits: output.head_logits.narrow(1, len - 1, 1)?,
        })
    }
}
