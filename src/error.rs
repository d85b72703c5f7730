// --- File: src/error.rs ---

//! Crate-wide error type.
//!
//! Each concern that talks to the outside world (config files, weight files)
//! keeps its own error enum; `FewShotError` wraps them so the episodic core
//! and the runners can propagate everything with `?`.

use crate::config::ConfigError;
use crate::serialization::SerializationError;
use thiserror::Error;

/// Errors raised by the episodic core, the models and the runners.
#[derive(Error, Debug)]
pub enum FewShotError {
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Parameter '{0}' is not registered in the parameter store")]
    MissingParameter(String),

    #[error("Invalid episode layout: {0}")]
    InvalidEpisode(String),

    #[error("Label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },

    #[error("Linear system is singular (pivot {pivot:e} at row {row})")]
    SingularMatrix { row: usize, pivot: f32 },

    #[error("Not enough data: {0}")]
    NotEnoughData(String),

    #[error("Operation '{0}' is not supported by this model")]
    Unsupported(String),

    #[error("Training diverged: {0}")]
    NonFinite(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FewShotError>;

impl FewShotError {
    /// Shorthand for a [`FewShotError::ShapeMismatch`].
    pub fn shape(context: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
