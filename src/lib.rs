//! nano-medusa: Medusa-style tree speculative decoding on candle.
//!
//! Medusa heads predict several future tokens at once; the base model checks
//! all of their combinations in one forward pass shaped as a tree:
//! - Candidate tree topology with flat index buffers
//! - Tree attention over a KV cache with a committed-length marker
//! - Greedy and typical acceptance of verified paths
//! - A greedy baseline that Medusa decoding reproduces exactly

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod model;
pub mod speculative;

pub use config::ModelConfig;
pub use crate::core::{FinishReason, KvCache, KvCacheConfig, SequenceState};
pub use engine::{AcceptanceStats, FilterChain, GenerationOutput, MedusaEngine, ScoreFilter};
pub use error::{Error, Result};
pub use model::{ForwardInput, ForwardOutput, MedusaModel, TinyMedusaLm};
pub use speculative::{
    BranchSpec, CandidateGenerator, Candidates, InferenceStateUpdater, MedusaConfig,
    PosteriorEvaluator, TreeTopology, TreeVerifier,
};
