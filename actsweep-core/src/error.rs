//! Error types for the actsweep core library.
//!
//! Every variant is fatal for the run that raised it: these describe a
//! misconfiguration or a damaged artifact, never a transient condition.

use std::path::PathBuf;

/// Top-level error type for the actsweep core library.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("Unknown hyperparameter key: {key}")]
    UnknownKey { key: String },

    #[error("Hyperparameter '{field}' out of range: {value}")]
    InvalidHyperparameter { field: &'static str, value: f64 },

    #[error("Unsupported dataset: {name}")]
    UnsupportedDataset { name: String },

    #[error("Invalid structure for {architecture} with '{activation}': {reason}")]
    InvalidStructure {
        architecture: String,
        activation: String,
        reason: String,
    },

    #[error("Empty dataset: the {split} batch source yielded no batches")]
    EmptyDataset { split: String },

    #[error("Corrupt checkpoint {}: {reason}", .path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Checkpoint {} does not belong to this run: {reason}", .path.display())]
    CheckpointMismatch { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LabError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn empty_dataset(split: impl Into<String>) -> Self {
        Self::EmptyDataset {
            split: split.into(),
        }
    }
}

/// Convenience alias used across the core crate.
pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failing_input() {
        let err = LabError::UnknownKey {
            key: "grid:99".into(),
        };
        assert!(err.to_string().contains("grid:99"));

        let err = LabError::corrupt("/tmp/run_mid.ckpt", "checksum mismatch");
        let msg = err.to_string();
        assert!(msg.contains("run_mid.ckpt"));
        assert!(msg.contains("checksum mismatch"));

        let err = LabError::empty_dataset("validation");
        assert!(err.to_string().contains("validation"));
    }
}
