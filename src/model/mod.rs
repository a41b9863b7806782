//! Model interface consumed by the decoding engine.
//!
//! The engine never looks inside a model. It hands a [`MedusaModel`] a batch
//! of tokens with explicit position ids and an additive attention bias, and
//! reads back base logits plus one set of logits per Medusa head. The model
//! is expected to stage its new keys and values in the [`KvCache`] it is
//! given; the engine decides which staged rows are kept.
//!
//! This module also contains [`TinyMedusaLm`], a small seeded transformer
//! with Medusa heads used by the binary and the tests.

pub mod attention;
pub mod head;
pub mod rope;
pub mod tiny;

use candle_core::{DType, Device, Tensor};

use crate::core::kv_cache::{KvCache, KvCacheConfig};
use crate::error::Result;

pub use attention::TreeAttention;
pub use head::MedusaHead;
pub use rope::RotaryEmbedding;
pub use tiny::TinyMedusaLm;

/// Inputs of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardInput {
    /// Token ids, u32 `[seq_len]`.
    pub tokens: Tensor,
    /// Absolute position of every token, u32 `[seq_len]`.
    pub position_ids: Tensor,
    /// Additive bias `[seq_len, committed_len + seq_len]`: 0 where a query may
    /// attend, -inf elsewhere.
    pub attention_bias: Tensor,
}

/// Outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Base model logits `[seq_len, vocab_size]`.
    pub logits: Tensor,
    /// Medusa head logits `[num_heads, seq_len, vocab_size]`.
    pub head_logits: Tensor,
}

/// A base model with Medusa heads.
pub trait MedusaModel {
    /// Device the model runs on.
    fn device(&self) -> &Device;

    /// Number of Medusa heads the model carries.
    fn num_medusa_heads(&self) -> usize;

    /// Cache layout the model expects. The engine overrides the capacity.
    fn kv_cache_config(&self) -> KvCacheConfig;

    /// Whether the forward pass reads and stages rows in the cache.
    fn uses_kv_cache(&self) -> bool {
        true
    }

    /// Build the forward inputs for `tokens`.
    ///
    /// `bias` covers only the new tokens (`[seq_len, seq_len]`); the default
    /// implementation lets every new token see the whole committed prefix.
    fn prepare_inputs(
        &self,
        tokens: &[u32],
        position_ids: &Tensor,
        bias: &Tensor,
        cache: &KvCache,
    ) -> Result<ForwardInput> {
        let seq_len = tokens.len();
        let committed = cache.committed_len();

        let attention_bias = if committed == 0 {
            bias.clone()
        } else {
            let prefix = Tensor::zeros((seq_len, committed), bias.dtype(), bias.device())?;
            Tensor::cat(&[&prefix, bias], 1)?
        };

        Ok(ForwardInput {
            tokens: Tensor::from_vec(tokens.to_vec(), seq_len, self.device())?,
            position_ids: position_ids.clone(),
            attention_bias,
        })
    }

    /// Run the base model and every Medusa head over `input`.
    fn forward(&self, input: &ForwardInput, cache: &mut KvCache) -> Result<ForwardOutput>;
}

/// Causal bias `[seq_len, seq_len]` for a run of new tokens.
///
/// ```text
/// [0, -inf, -inf]
/// [0,    0, -inf]
/// [0,    0,    0]
/// ```
pub fn causal_bias(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|query| {
            (0..seq_len).map(move |key| if key > query { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Consecutive position ids `start..start + len`, u32.
pub fn position_range(start: usize, len: usize, device: &Device) -> Result<Tensor> {
    let positions: Vec<u32> = (start..start + len).map(|p| p as u32).collect();
    Ok(Tensor::from_vec(positions, len, device)?)
}
