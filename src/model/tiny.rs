//! Tiny seeded transformer with Medusa heads.
//!
//! Weights are drawn from a seeded [`StdRng`], so two models built from the
//! same [`ModelConfig`] are identical. The model is far too small to say
//! anything useful; it exists to drive the decoding engine end to end with
//! real attention, RoPE and cache traffic.

use candle_core::{DType, Device, Module, Shape, Tensor};
use candle_nn::{Embedding, Linear};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::attention::TreeAttention;
use super::head::MedusaHead;
use super::{ForwardInput, ForwardOutput, MedusaModel};
use crate::config::ModelConfig;
use crate::core::kv_cache::{KvCache, KvCacheConfig, LayerKvCache};
use crate::error::{Error, Result};

/// Seeded uniform weight initialiser.
pub(crate) struct SeededInit {
    rng: StdRng,
    dtype: DType,
    device: Device,
}

impl SeededInit {
    pub(crate) fn new(seed: u64, dtype: DType, device: &Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dtype,
            device: device.clone(),
        }
    }

    pub(crate) fn dtype(&self) -> DType {
        self.dtype
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    /// Tensor with entries uniform in `[-scale, scale]`.
    pub(crate) fn tensor(&mut self, shape: impl Into<Shape>, scale: f32) -> Result<Tensor> {
        let shape = shape.into();
        let dist = Uniform::new_inclusive(-scale, scale);
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| dist.sample(&mut self.rng))
            .collect();
        Ok(Tensor::from_vec(data, shape, &self.device)?.to_dtype(self.dtype)?)
    }

    /// Linear layer with fan-in scaled weights.
    pub(crate) fn linear(&mut self, in_dim: usize, out_dim: usize, bias: bool) -> Result<Linear> {
        let scale = 1.0 / (in_dim as f32).sqrt();
        let weight = self.tensor((out_dim, in_dim), scale)?;
        let bias = if bias {
            Some(self.tensor(out_dim, scale)?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }
}

/// Pre-norm decoder block.
#[derive(Debug, Clone)]
struct DecoderBlock {
    input_norm: Tensor,
    self_attn: TreeAttention,
    post_attention_norm: Tensor,
    up_proj: Linear,
    down_proj: Linear,
    eps: f32,
}

impl DecoderBlock {
    fn new_random(config: &ModelConfig, init: &mut SeededInit) -> Result<Self> {
        let ones = Tensor::ones(config.hidden_size, init.dtype(), init.device())?;
        Ok(Self {
            input_norm: ones.clone(),
            self_attn: TreeAttention::new_random(
                config.hidden_size,
                config.num_attention_heads,
                config.num_key_value_heads,
                config.head_dim(),
                config.max_position_embeddings,
                config.rope_theta,
                init,
            )?,
            post_attention_norm: ones,
            up_proj: init.linear(config.hidden_size, config.intermediate_size, false)?,
            down_proj: init.linear(config.intermediate_size, config.hidden_size, false)?,
            eps: config.rms_norm_eps as f32,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        position_ids: &Tensor,
        attention_bias: &Tensor,
        cache: &mut LayerKvCache,
    ) -> Result<Tensor> {
        let normed = candle_nn::ops::rms_norm(x, &self.input_norm, self.eps)?;
        let attn = self.self_attn.forward(&normed, position_ids, attention_bias, cache)?;
        let x = (x + attn)?;

        let normed = candle_nn::ops::rms_norm(&x, &self.post_attention_norm, self.eps)?;
        let mlp = self
            .down_proj
            .forward(&candle_nn::ops::silu(&self.up_proj.forward(&normed)?)?)?;
        Ok((x + mlp)?)
    }
}

/// Seeded decoder-only language model with Medusa heads.
#[derive(Debug, Clone)]
pub struct TinyMedusaLm {
    config: ModelConfig,
    embed_tokens: Embedding,
    layers: Vec<DecoderBlock>,
    norm: Tensor,
    lm_head: Linear,
    medusa_heads: Vec<MedusaHead>,
    dtype: DType,
    device: Device,
}

impl TinyMedusaLm {
    /// Build a model from `config` with weights drawn from `config.seed`.
    pub fn new(config: ModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut init = SeededInit::new(config.seed, dtype, device);

        let embed_tokens = Embedding::new(
            init.tensor((config.vocab_size, config.hidden_size), 1.0)?,
            config.hidden_size,
        );
        let layers = (0..config.num_hidden_layers)
            .map(|_| DecoderBlock::new_random(&config, &mut init))
            .collect::<Result<Vec<_>>>()?;
        let norm = Tensor::ones(config.hidden_size, dtype, device)?;
        let lm_head = init.linear(config.hidden_size, config.vocab_size, false)?;
        let medusa_heads = (0..config.num_medusa_heads)
            .map(|_| {
                MedusaHead::new_random(
                    config.hidden_size,
                    config.vocab_size,
                    config.medusa_num_layers,
                    &mut init,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            medusa_heads,
            dtype,
            device: device.clone(),
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl MedusaModel for TinyMedusaLm {
    fn device(&self) -> &Device {
        &self.device
    }

    fn num_medusa_heads(&self) -> usize {
        self.medusa_heads.len()
    }

    fn kv_cache_config(&self) -> KvCacheConfig {
        KvCacheConfig::new(
            self.config.num_hidden_layers,
            self.config.num_key_value_heads,
            self.config.head_dim(),
            self.config.max_position_embeddings,
        )
        .with_dtype(self.dtype)
    }

    fn forward(&self, input: &ForwardInput, cache: &mut KvCache) -> Result<ForwardOutput> {
        let seq_len = input.tokens.dim(0)?;
        let mut hidden = self.embed_tokens.forward(&input.tokens)?;

        for (idx, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache
                .layer_mut(idx)
                .ok_or_else(|| Error::Model(format!("kv cache has no layer {idx}")))?;
            hidden = layer.forward(&hidden, &input.position_ids, &input.attention_bias, layer_cache)?;
        }

        let hidden = candle_nn::ops::rms_norm(&hidden, &self.norm, self.config.rms_norm_eps as f32)?;
        let logits = self.lm_head.forward(&hidden)?;

        let head_logits = if self.medusa_heads.is_empty() {
            Tensor::zeros((0, seq_len, self.config.vocab_size), self.dtype, &self.device)?
        } else {
            let per_head = self
                .medusa_heads
                .iter()
                .map(|head| head.forward(&hidden))
                .collect::<Result<Vec<_>>>()?;
            Tensor::stack(&per_head, 0)?
        };

        Ok(ForwardOutput {
            logits,
            head_logits,
        })
    }
}
