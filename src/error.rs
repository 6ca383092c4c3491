//! Error types for volume engine operations

use std::sync::Arc;
use thiserror::Error;

/// Main error type for volume operations
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Slice {z} is not populated")]
    NotPopulated { z: usize },

    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Loading aborted")]
    Aborted,

    #[error("Capacity exceeded: more than {limit} provisional labels required")]
    Capacity { limit: usize },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Shared(Arc<VolumeError>),
}

impl VolumeError {
    /// Whether the error is a local precondition violation rather than a
    /// failure of the remote source or of a computation.
    pub fn is_validation(&self) -> bool {
        match self {
            VolumeError::Validation(_)
            | VolumeError::InvalidDimensions(_)
            | VolumeError::OutOfBounds(_)
            | VolumeError::NotPopulated { .. } => true,
            VolumeError::Shared(inner) => inner.is_validation(),
            _ => false,
        }
    }
}

/// Specialized Result type for volume operations
pub type Result<T> = std::result::Result<T, VolumeError>;

impl From<serde_json::Error> for VolumeError {
    fn from(err: serde_json::Error) -> Self {
        VolumeError::Serialization(err.to_string())
    }
}

impl From<Arc<VolumeError>> for VolumeError {
    fn from(err: Arc<VolumeError>) -> Self {
        VolumeError::Shared(err)
    }
}
