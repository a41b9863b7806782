//! Rotary Position Embeddings (RoPE) driven by explicit position ids.
//!
//! Tree verification feeds siblings that share a position, so rotations are
//! looked up per token instead of taken from a contiguous range.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Result, Tensor};

/// Rotary Position Embedding.
///
/// Key insight: `dot(rotate(q, pos_q), rotate(k, pos_k))` depends on
/// `pos_q - pos_k`, naturally capturing relative position.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Precomputed cosine values [max_seq_len, head_dim].
    cos_cache: Tensor,
    /// Precomputed sine values [max_seq_len, head_dim].
    sin_cache: Tensor,
    /// Head dimension (must be even for rotation pairs).
    dim: usize,
}

impl RotaryEmbedding {
    /// Creates a new RotaryEmbedding with precomputed cos/sin caches.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (must be even)
    /// * `max_seq_len` - Maximum position supported
    /// * `theta` - Base frequency (typically 10000)
    /// * `dtype` - Data type for the cache tensors
    /// * `device` - Device to create tensors on
    ///
    /// # Panics
    ///
    /// Panics if `dim` is not even (rotation requires pairs).
    pub fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        assert!(dim.is_multiple_of(2), "RoPE dimension must be even");

        let half_dim = dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?; // [dim/2]

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2] -> [max_seq_len, dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos_cache: freqs.cos()?.to_dtype(dtype)?,
            sin_cache: freqs.sin()?.to_dtype(dtype)?,
            dim,
        })
    }

    /// Returns the head dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Largest supported position plus one.
    pub fn max_seq_len(&self) -> usize {
        self.cos_cache.dims()[0]
    }

    /// Applies rotary embedding to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor [seq_len, num_heads, head_dim]
    /// * `k` - Key tensor [seq_len, num_kv_heads, head_dim]
    /// * `position_ids` - u32 [seq_len], one absolute position per token
    pub fn apply(&self, q: &Tensor, k: &Tensor, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        // [seq_len, 1, dim] for broadcasting over heads
        let cos = self.cos_cache.index_select(position_ids, 0)?.unsqueeze(1)?;
        let sin = self.sin_cache.index_select(position_ids, 0)?.unsqueeze(1)?;

        Ok((
            Self::apply_rotation(q, &cos, &sin)?,
            Self::apply_rotation(k, &cos, &sin)?,
        ))
    }

    /// `x * cos + rotate_half(x) * sin`
    fn apply_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x_cos = x.broadcast_mul(cos)?;
        let x_sin = Self::rotate_half(x)?.broadcast_mul(sin)?;
        x_cos.add(&x_sin)
    }

    /// `[x1, x2] -> [-x2, x1]` over the last dimension.
    fn rotate_half(x: &Tensor) -> Result<Tensor> {
        let last = x.rank() - 1;
        let half = x.dims()[last] / 2;

        let x1 = x.narrow(last, 0, half)?;
        let x2 = x.narrow(last, half, half)?;
        Tensor::cat(&[&x2.neg()?, &x1], last)
    }
}
