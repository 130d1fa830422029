//! Store errors

use cloudgossip_core::CoreError;
use thiserror::Error;

/// Store layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("invalid entry: {0}")]
    Entry(#[from] CoreError),
    #[error("no entry for key: {0}")]
    MissingKey(String),
    #[error("cloud error: {0}")]
    Cloud(String),
}
