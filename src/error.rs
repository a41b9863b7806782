//! Error types for nano-medusa.

use thiserror::Error;

/// Result type alias for nano-medusa operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-medusa.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (branch spec, token ids, tree size, sampling values).
    #[error("configuration error: {0}")]
    Config(String),

    /// A tensor did not have the shape a component expects.
    #[error("shape mismatch for {what}: expected {expected}, got {actual:?}")]
    Shape {
        what: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    /// Staging more rows than the KV cache can hold.
    #[error("kv cache overflow: {requested} rows requested, capacity {capacity}")]
    CacheOverflow { requested: usize, capacity: usize },

    /// Committing a row that was not staged by the last forward pass.
    #[error("cannot commit staged row {offset}: only {staged} rows are staged")]
    InvalidCommit { offset: usize, staged: usize },

    /// Failure reported by a model implementation.
    #[error("model error: {0}")]
    Model(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(what: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::Shape {
            what,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}
