//! Error types for the MVCC column store

use thiserror::Error;

/// Result type for column store operations
pub type Result<T> = std::result::Result<T, MvccError>;

/// Column store error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MvccError {
    /// A version, column, tablet or key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied a value or argument the operation cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocation failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Recognised but unimplemented feature
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Operation is not valid in the current state of the object
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MvccError {
    fn from(e: serde_json::Error) -> Self {
        MvccError::Serialization(e.to_string())
    }
}

impl MvccError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, MvccError::OutOfMemory(_))
    }

    /// Check if error is a lookup miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, MvccError::NotFound(_))
    }

    /// Get error code for FFI
    pub fn code(&self) -> i32 {
        match self {
            MvccError::NotFound(_) => 1,
            MvccError::InvalidArgument(_) => 2,
            MvccError::OutOfMemory(_) => 3,
            MvccError::NotSupported(_) => 4,
            MvccError::IllegalState(_) => 5,
            MvccError::InvalidConfig(_) => 6,
            MvccError::Serialization(_) => 7,
        }
    }
}
