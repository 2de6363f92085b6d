//! Construction and loading errors

use thiserror::Error;

/// Errors raised while validating a configuration or building a model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MmditError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Conditioning dropout is enabled but nothing can be substituted
    #[error("class_dropout_prob is {prob} but no unconditional embeddings were supplied")]
    MissingUnconditional { prob: f64 },

    #[error("Unconditional {what} has shape {actual:?}, expected {expected}")]
    UnconditionalShape {
        what: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("Pooling derives the class vector from the context; it needs vector conditioning with input_dim {expected}, found {found}")]
    PoolingMismatch { expected: usize, found: String },
}

/// Errors raised while reading a checkpoint or unconditional tensors
#[derive(Error, Debug)]
pub enum MmditLoadError {
    #[error("Load error: {0}")]
    Load(#[from] burn_mmdit_convert::LoadError),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Config(#[from] MmditError),
}
