//! Network errors

use thiserror::Error;

use crate::framing::FrameError;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("client id already registered: {0}")]
    ClientIdInUse(u32),
    #[error("client {0} already has an outstanding accept")]
    AcceptInProgress(u32),
    #[error("connection rejected by remote for client id {0}")]
    ConnectionRejected(u32),
    #[error("handshake violation: {0}")]
    HandshakeViolation(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },
    #[error("multiplexer terminated")]
    Terminated,
}
