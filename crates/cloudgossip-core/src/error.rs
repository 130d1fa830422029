//! Error types for CloudGossip core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, CoreError>;

/// CloudGossip core error types
#[derive(Debug, Error)]
pub enum CoreError {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Entry content does not match its advertised metadata
    #[error("content mismatch for key {key}: {detail}")]
    ContentMismatch { key: String, detail: String },

    /// Empty entry key
    #[error("empty entry key")]
    EmptyKey,
}
