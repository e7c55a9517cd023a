//! Error Types
//!
//! Every fallible operation in the engine returns [`Result`], an alias over
//! [`EngineError`]. Errors are raised where they are detected and propagate
//! unchanged through forward, backward and `fit`; nothing retries.
//!
//! ## Taxonomy
//!
//! - **ShapeMismatch**: a tensor's rank or shape fails a precondition
//!   (Dense given 4D input, loss given mismatched targets, ...)
//! - **InvalidConfiguration**: a bad hyperparameter, padding string or axis
//! - **UnsupportedLayerType**: an operation that the layer variant has no rule
//!   for (optimizer update on Flatten, backward on Input)
//! - **Io** / **Serialization**: checkpoint reading and writing

/// Errors produced by the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unsupported layer type: {0}")]
    UnsupportedLayerType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Build a `ShapeMismatch` describing an expected and an actual shape
    pub fn shape(context: &str, expected: impl std::fmt::Debug, got: impl std::fmt::Debug) -> Self {
        EngineError::ShapeMismatch(format!("{}: expected {:?}, got {:?}", context, expected, got))
    }
}
