//! Core state shared by the decoding steps.
//!
//! - KvCache with a committed-length marker
//! - SequenceState for prompt/output tracking and stop conditions

pub mod kv_cache;
pub mod sequence;

pub use kv_cache::{KvCache, KvCacheConfig, LayerKvCache};
pub use sequence::{FinishReason, SequenceState};
