//! Daemon errors

use cloudgossip_net::NetError;
use cloudgossip_store::StoreError;
use thiserror::Error;

/// Engine and protocol errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol already started")]
    AlreadyStarted,
    #[error("protocol never started")]
    NotStarted,
    #[error("protocol already terminated")]
    AlreadyTerminated,
    #[error("configuration is frozen after start")]
    ConfigFrozen,
    #[error("no peer available")]
    NoPeerAvailable,
    #[error("exchange aborted: {0}")]
    ExchangeAborted(String),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown persistence provider: {0}")]
    UnknownProvider(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
