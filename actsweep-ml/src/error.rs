//! Error types for the actsweep-ml crate.

use actsweep_core::LabError;
use thiserror::Error;

/// Top-level error type for model, data and training operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error(transparent)]
    Lab(#[from] LabError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MlError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// The underlying core error, if any.
    pub fn as_lab(&self) -> Option<&LabError> {
        match self {
            Self::Lab(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MlError>;
