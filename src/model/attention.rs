//! Multi-head attention over the committed-marker KV cache.
//!
//! New keys and values are staged right after the committed prefix, then every
//! query attends over `committed + new` rows under the caller's additive bias.
//! The bias alone decides visibility, so the same layer serves causal prefill,
//! single-token decoding and tree verification.

use candle_core::{Module, Tensor, D};
use candle_nn::Linear;

use super::rope::RotaryEmbedding;
use super::tiny::SeededInit;
use crate::core::kv_cache::LayerKvCache;
use crate::error::{Error, Result};

/// Grouped-query attention with RoPE and an explicit attention bias.
#[derive(Debug, Clone)]
pub struct TreeAttention {
    /// Query projection [hidden_size] -> [num_heads * head_dim].
    q_proj: Linear,
    /// Key projection [hidden_size] -> [num_kv_heads * head_dim].
    k_proj: Linear,
    /// Value projection [hidden_size] -> [num_kv_heads * head_dim].
    v_proj: Linear,
    /// Output projection [num_heads * head_dim] -> [hidden_size].
    o_proj: Linear,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl TreeAttention {
    /// Creates an attention layer with seeded random weights.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_random(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        init: &mut SeededInit,
    ) -> Result<Self> {
        let q_proj = init.linear(hidden_size, num_heads * head_dim, false)?;
        let k_proj = init.linear(hidden_size, num_kv_heads * head_dim, false)?;
        let v_proj = init.linear(hidden_size, num_kv_heads * head_dim, false)?;
        let o_proj = init.linear(num_heads * head_dim, hidden_size, false)?;

        let rotary_emb =
            RotaryEmbedding::new(head_dim, max_seq_len, rope_theta, init.dtype(), init.device())?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Returns the number of query heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Returns the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Returns the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Forward pass through the attention layer.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [seq_len, hidden_size]
    /// * `position_ids` - u32 [seq_len]
    /// * `attention_bias` - [seq_len, committed_len + seq_len]
    /// * `cache` - This layer's cache; the new rows are staged in it
    ///
    /// # Returns
    ///
    /// Output tensor [seq_len, hidden_size]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        position_ids: &Tensor,
        attention_bias: &Tensor,
        cache: &mut LayerKvCache,
    ) -> Result<Tensor> {
        let (seq_len, _) = hidden_states.dims2()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [seq_len, heads, head_dim]
        let q = q.reshape((seq_len, self.num_heads, self.head_dim))?;
        let k = k.reshape((seq_len, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((seq_len, self.num_kv_heads, self.head_dim))?;

        let (q, k) = self.rotary_emb.apply(&q, &k, position_ids)?;

        let (k, v) = cache.stage(&k, &v)?;
        let kv_len = k.dim(0)?;
        if attention_bias.dims() != [seq_len, kv_len] {
            return Err(Error::shape(
                "attention bias",
                format!("[{seq_len}, {kv_len}]"),
                attention_bias.dims(),
            ));
        }

        let k = self.repeat_kv(&k)?;
        let v = self.repeat_kv(&v)?;

        // [heads, seq, head_dim]
        let q = q.transpose(0, 1)?.contiguous()?;
        let k = k.transpose(0, 1)?.contiguous()?;
        let v = v.transpose(0, 1)?.contiguous()?;

        // [heads, seq_len, kv_len]
        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let scores = scores.broadcast_add(attention_bias)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let output = weights.matmul(&v)?; // [heads, seq_len, head_dim]
        let output = output
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, self.num_heads * self.head_dim))?;

        Ok(self.o_proj.forward(&output)?)
    }

    /// [kv_len, num_kv_heads, head_dim] -> [kv_len, num_heads, head_dim]
    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }

        let (kv_len, num_kv_heads, head_dim) = x.dims3()?;
        Ok(x
            .unsqueeze(2)?
            .expand((kv_len, num_kv_heads, n_rep, head_dim))?
            .reshape((kv_len, self.num_heads, head_dim))?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::core::kv_cache::KvCacheConfig;
    use crate::model::causal_bias;

    fn test_device() -> Device {
        Device::Cpu
    }

    fn test_attention(init: &mut SeededInit) -> TreeAttention {
        TreeAttention::new_random(
            16,      // hidden_size
            4,       // num_heads
            2,       // num_kv_heads
            4,       // head_dim
            64,      // max_seq_len
            10000.0, // rope_theta
            init,
        )
        .unwrap()
    }

    #[test]
    fn test_forward_shape_and_staging() {
        let device = test_device();
        let mut init = SeededInit::new(7, DType::F32, &device);
        let attn = test_attention(&mut init);
        let mut cache = LayerKvCache::new(&KvCacheConfig::new(1, 2, 4, 32), &device).unwrap();

        let x = init.tensor((5, 16), 1.0).unwrap();
        let positions = Tensor::new(&[0u32, 1, 2, 3, 4], &device).unwrap();
        let bias = causal_bias(5, DType::F32, &device).unwrap();

        let out = attn.forward(&x, &positions, &bias, &mut cache).unwrap();
        assert_eq!(out.dims(), &[5, 16]);
        assert_eq!(cache.staged_len(), 5);
        assert_eq!(cache.committed_len(), 0);
    }

    #[test]
    fn test_bias_shape_checked() {
        let device = test_device();
        let mut init = SeededInit::new(7, DType::F32, &device);
        let attn = test_attention(&mut init);
        let mut cache = LayerKvCache::new(&KvCacheConfig::new(1, 2, 4, 32), &device).unwrap();

        let x = init.tensor((2, 16), 1.0).unwrap();
        let positions = Tensor::new(&[0u32, 1], &device).unwrap();
        let bias = causal_bias(3, DType::F32, &device).unwrap();

        assert!(matches!(
            attn.forward(&x, &positions, &bias, &mut cache),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn test_repeat_kv() {
        let device = test_device();
        let mut init = SeededInit::new(7, DType::F32, &device);
        let attn = test_attention(&mut init);

        let x = init.tensor((3, 2, 4), 1.0).unwrap();
        assert_eq!(attn.repeat_kv(&x).unwrap().dims(), &[3, 4, 4]);
    }
}
