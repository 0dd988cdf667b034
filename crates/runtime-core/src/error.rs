//! Error types for checkpoint consolidation

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for checkpoint reading, merging and writing
#[derive(Error, Debug)]
pub enum Error {
    // Input errors
    #[error("Checkpoint folder not found: {path}")]
    CheckpointFolderNotFound { path: String },

    #[error("Checkpoint metadata not found: {path}")]
    MetadataNotFound { path: String },

    #[error("Checkpoint metadata unreadable: {path} - {reason}")]
    MetadataCorrupted { path: String, reason: String },

    #[error("Tensor missing from checkpoint metadata: {fqn}")]
    MissingTensor { fqn: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    // Memory errors
    #[error("Checkpoint too large: needs {required_bytes} bytes, limit is {limit_bytes} bytes")]
    CheckpointTooLarge {
        required_bytes: u64,
        limit_bytes: u64,
    },

    #[error("Failed to allocate {bytes} bytes for tensor {fqn}")]
    AllocationFailed { fqn: String, bytes: u64 },

    // Output errors
    #[error("Output file already exists: {path}")]
    OutputExists { path: String },

    // Tensor errors
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DTypeMismatch { expected: String, actual: String },

    #[error("Shape mismatch for {fqn}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        fqn: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if the error was caused by the checkpoint contents
    /// rather than by the environment or the caller
    pub fn is_corrupt_input(&self) -> bool {
        matches!(
            self,
            Error::MetadataCorrupted { .. }
                | Error::MissingTensor { .. }
                | Error::CheckpointCorrupted { .. }
        )
    }

    /// Returns true if the error came from a memory bound
    pub fn is_memory_exhausted(&self) -> bool {
        matches!(
            self,
            Error::CheckpointTooLarge { .. } | Error::AllocationFailed { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
