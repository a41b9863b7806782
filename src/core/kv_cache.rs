//! KV cache with a committed-length marker.
//!
//! Every layer owns a preallocated key and value buffer of shape
//! `[capacity, num_kv_heads, head_dim]`. Rows `0..committed_len` belong to the
//! accepted sequence. A forward pass stages its new rows right after the
//! committed tail; nothing past the marker is ever treated as history.
//!
//! ## Tree steps
//!
//! ```text
//!            committed            staged (one row per tree node)
//! rows: [ p0 p1 p2 p3 p4 | n0 n1 n2 n3 n4 n5 n6 ]
//!                          ▲      ▲        ▲
//!                          └── accepted path: nodes 0, 2, 5
//!
//! commit([0, 2, 5]):
//! rows: [ p0 p1 p2 p3 p4 n0 n2 n5 | (stale, overwritten next step) ]
//! ```
//!
//! Rejected branches are discarded by moving the marker, so a commit costs
//! only the accepted rows.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Configuration for KV cache.
#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of KV heads.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Maximum number of rows (committed plus staged).
    pub capacity: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl KvCacheConfig {
    /// Create a new KV cache configuration.
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize, capacity: usize) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            capacity,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Memory size in bytes for one layer's cache (K or V).
    pub fn layer_cache_size_bytes(&self) -> usize {
        self.capacity * self.num_kv_heads * self.head_dim * self.dtype.size_in_bytes()
    }

    /// Total memory size in bytes (all layers, K and V).
    pub fn total_cache_size_bytes(&self) -> usize {
        self.layer_cache_size_bytes() * self.num_layers * 2
    }
}

/// KV cache for a single transformer layer.
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    /// Key cache: [capacity, num_kv_heads, head_dim]
    key_cache: Tensor,
    /// Value cache: [capacity, num_kv_heads, head_dim]
    value_cache: Tensor,
    committed_len: usize,
    staged_len: usize,
    capacity: usize,
}

impl LayerKvCache {
    /// Create a new, empty layer cache.
    pub fn new(config: &KvCacheConfig, device: &Device) -> Result<Self> {
        let shape = (config.capacity, config.num_kv_heads, config.head_dim);
        Ok(Self {
            key_cache: Tensor::zeros(shape, config.dtype, device)?,
            value_cache: Tensor::zeros(shape, config.dtype, device)?,
            committed_len: 0,
            staged_len: 0,
            capacity: config.capacity,
        })
    }

    /// Get the key cache tensor.
    pub fn key_cache(&self) -> &Tensor {
        &self.key_cache
    }

    /// Get the value cache tensor.
    pub fn value_cache(&self) -> &Tensor {
        &self.value_cache
    }

    /// Number of rows belonging to the accepted sequence.
    pub fn committed_len(&self) -> usize {
        self.committed_len
    }

    /// Number of rows written by the last forward pass and not yet committed.
    pub fn staged_len(&self) -> usize {
        self.staged_len
    }

    /// Maximum number of rows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write `keys`/`values` `[n, num_kv_heads, head_dim]` right after the
    /// committed tail, replacing any previously staged rows.
    ///
    /// # Returns
    ///
    /// Keys and values for rows `0..committed_len + n`, i.e. the committed
    /// history followed by the new rows.
    pub fn stage(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = keys.dim(0)?;
        if values.dim(0)? != n {
            return Err(Error::shape("staged values", format!("{n} rows"), values.dims()));
        }
        let requested = self.committed_len + n;
        if requested > self.capacity {
            return Err(Error::CacheOverflow {
                requested,
                capacity: self.capacity,
            });
        }

        self.key_cache = self.key_cache.slice_scatter0(keys, self.committed_len)?;
        self.value_cache = self.value_cache.slice_scatter0(values, self.committed_len)?;
        self.staged_len = n;

        Ok((
            self.key_cache.narrow(0, 0, requested)?,
            self.value_cache.narrow(0, 0, requested)?,
        ))
    }

    /// Commit the staged rows at `offsets` (relative to the start of the
    /// staged block) in the given order and drop the rest.
    pub fn commit(&mut self, offsets: &[usize]) -> Result<()> {
        if let Some(&offset) = offsets.iter().find(|&&o| o >= self.staged_len) {
            return Err(Error::InvalidCommit {
                offset,
                staged: self.staged_len,
            });
        }

        // Rows already sitting in place need no copy.
        let in_place = offsets.iter().enumerate().all(|(i, &o)| i == o);
        if !in_place {
            let rows: Vec<u32> = offsets
                .iter()
                .map(|&o| (self.committed_len + o) as u32)
                .collect();
            let index = Tensor::from_vec(rows, offsets.len(), self.key_cache.device())?;

            let keys = self.key_cache.index_select(&index, 0)?;
            let values = self.value_cache.index_select(&index, 0)?;
            self.key_cache = self.key_cache.slice_scatter0(&keys, self.committed_len)?;
            self.value_cache = self.value_cache.slice_scatter0(&values, self.committed_len)?;
        }

        self.committed_len += offsets.len();
        self.staged_len = 0;
        Ok(())
    }

    /// Commit every staged row in order.
    pub fn commit_staged(&mut self) -> Result<()> {
        let offsets: Vec<usize> = (0..self.staged_len).collect();
        self.commit(&offsets)
    }

    /// Roll the committed marker back to at most `len` rows.
    pub fn truncate(&mut self, len: usize) {
        self.committed_len = self.committed_len.min(len);
        self.staged_len = 0;
    }

    /// Forget every row.
    pub fn reset(&mut self) {
        self.committed_len = 0;
        self.staged_len = 0;
    }
}

/// Full KV cache for all transformer layers.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per-layer caches.
    layers: Vec<LayerKvCache>,
    /// Configuration.
    config: KvCacheConfig,
    /// Device.
    device: Device,
}

impl KvCache {
    /// Create a new KV cache for all layers.
    pub fn new(config: KvCacheConfig, device: &Device) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| LayerKvCache::new(&config, device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            config,
            device: device.clone(),
        })
    }

    /// Get the cache for a specific layer.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerKvCache> {
        self.layers.get(layer_idx)
    }

    /// Get mutable access to a layer's cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Option<&mut LayerKvCache> {
        self.layers.get_mut(layer_idx)
    }

    /// Get the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Get the configuration.
    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Get the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Committed length shared by all layers.
    pub fn committed_len(&self) -> usize {
        self.layers.first().map_or(0, LayerKvCache::committed_len)
    }

    /// Commit the same staged offsets in every layer.
    pub fn commit(&mut self, offsets: &[usize]) -> Result<()> {
        self.layers.iter_mut().try_for_each(|layer| layer.commit(offsets))
    }

    /// Commit every staged row in every layer.
    pub fn commit_staged(&mut self) -> Result<()> {
        self.layers.iter_mut().try_for_each(LayerKvCache::commit_staged)
    }

    /// Roll every layer back to at most `len` committed rows.
    pub fn truncate(&mut self, len: usize) {
        self.layers.iter_mut().for_each(|layer| layer.truncate(len));
    }

    /// Reset every layer to empty, e.g. before a baseline run.
    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(LayerKvCache::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KvCacheConfig {
        KvCacheConfig::new(
            2,  // num_layers
            2,  // num_kv_heads
            4,  // head_dim
            16, // capacity
        )
    }

    fn rows(values: &[f32], device: &Device) -> Tensor {
        let n = values.len();
        Tensor::from_vec(values.to_vec(), (n, 1, 1), device).unwrap()
    }

    #[test]
    fn test_kv_cache_config() {
        let config = test_config();

        // 16 * 2 * 4 * 4 bytes = 512 bytes per layer cache
        assert_eq!(config.layer_cache_size_bytes(), 512);
        // 2 layers * 2 (K+V) * 512
        assert_eq!(config.total_cache_size_bytes(), 2048);
    }

    #[test]
    fn test_stage_returns_history_and_new_rows() {
        let device = Device::Cpu;
        let config = KvCacheConfig::new(1, 1, 1, 8);
        let mut layer = LayerKvCache::new(&config, &device).unwrap();

        let (k, _) = layer.stage(&rows(&[1.0, 2.0], &device), &rows(&[1.0, 2.0], &device)).unwrap();
        assert_eq!(k.dims(), &[2, 1, 1]);
        layer.commit_staged().unwrap();
        assert_eq!(layer.committed_len(), 2);

        let (k, _) = layer.stage(&rows(&[3.0], &device), &rows(&[3.0], &device)).unwrap();
        let k: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(k, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_commit_gathers_selected_rows() {
        let device = Device::Cpu;
        let config = KvCacheConfig::new(1, 1, 1, 8);
        let mut layer = LayerKvCache::new(&config, &device).unwrap();

        let staged = rows(&[10.0, 11.0, 12.0, 13.0], &device);
        layer.stage(&staged, &staged).unwrap();
        layer.commit(&[0, 2, 3]).unwrap();

        assert_eq!(layer.committed_len(), 3);
        assert_eq!(layer.staged_len(), 0);
        let k: Vec<f32> = layer
            .key_cache()
            .narrow(0, 0, 3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(k, vec![10.0, 12.0, 13.0]);
    }

    #[test]
    fn test_commit_rejects_unstaged_offset() {
        let device = Device::Cpu;
        let config = KvCacheConfig::new(1, 1, 1, 8);
        let mut layer = LayerKvCache::new(&config, &device).unwrap();

        let staged = rows(&[1.0, 2.0], &device);
        layer.stage(&staged, &staged).unwrap();
        assert!(matches!(
            layer.commit(&[0, 5]),
            Err(Error::InvalidCommit { offset: 5, staged: 2 })
        ));
    }

    #[test]
    fn test_stage_overflow() {
        let device = Device::Cpu;
        let config = KvCacheConfig::new(1, 1, 1, 2);
        let mut layer = LayerKvCache::new(&config, &device).unwrap();

        let staged = rows(&[1.0, 2.0, 3.0], &device);
        assert!(matches!(
            layer.stage(&staged, &staged),
            Err(Error::CacheOverflow { requested: 3, capacity: 2 })
        ));
    }

    #[test]
    fn test_reset_and_truncate() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(KvCacheConfig::new(2, 1, 1, 8), &device).unwrap();

        for layer in 0..cache.num_layers() {
            let staged = rows(&[1.0, 2.0, 3.0], &device);
            cache.layer_mut(layer).unwrap().stage(&staged, &staged).unwrap();
        }
        cache.commit_staged().unwrap();
        assert_eq!(cache.committed_len(), 3);

        cache.truncate(1);
        assert_eq!(cache.committed_len(), 1);

        cache.reset();
        assert_eq!(cache.committed_len(), 0);
    }
}
