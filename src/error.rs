//! Error types for the chexprep system

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chexprep operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source directory of label files does not exist
    #[error("Dataset not found: {}", .0.display())]
    DatasetNotFound(PathBuf),

    /// A label file could not be interpreted as a table
    #[error("Malformed table '{}': {reason}", .path.display())]
    MalformedTable {
        /// Offending file
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// A required column is absent after renaming
    #[error("Missing column '{column}' in '{}'", .path.display())]
    MissingColumn {
        /// Offending file
        path: PathBuf,
        /// Canonical column name that was expected
        column: String,
    },

    /// Too few rows to produce a non-empty partition
    #[error("Cannot split {rows} rows with test fraction {fraction}: kept side would be empty")]
    InsufficientRows {
        /// Rows available
        rows: usize,
        /// Requested held-out fraction
        fraction: f64,
    },

    /// Checkpoint file could not be read in the expected layout
    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(String),

    /// Two parameter names collapsed to the same remapped name
    #[error("Remapping '{first}' and '{second}' both produce '{target}'")]
    DuplicateKey {
        /// First source key
        first: String,
        /// Second source key
        second: String,
        /// Shared remapped key
        target: String,
    },

    /// Remapped state dict does not fit the model parameter tree
    #[error("State dict mismatch: {0}")]
    StateDictMismatch(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// SafeTensors parsing error
    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid rename pattern
    #[error("Invalid rename pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for chexprep operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a malformed table error
    pub fn malformed_table(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedTable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a checkpoint format error
    pub fn checkpoint_format(msg: impl Into<String>) -> Self {
        Self::CheckpointFormat(msg.into())
    }

    /// Create a state dict mismatch error
    pub fn state_dict_mismatch(msg: impl Into<String>) -> Self {
        Self::StateDictMismatch(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
