//! Generation engine.
//!
//! This module contains:
//! - MedusaEngine for driving Medusa tree decoding and the greedy baseline
//! - ScoreFilter and FilterChain for logits post-processing

pub mod filter;
pub mod medusa;

pub use filter::{FilterChain, ScoreFilter};
pub use medusa::{AcceptanceStats, GenerationOutput, MedusaEngine};
