//! A multiplexed connection to one remote client
//!
//! Connections are strict request/response: each protocol phase sends one
//! message and waits for exactly one in return. `receive` reports a timeout
//! as `Ok(None)` so protocols can tell "peer silent" apart from
//! "peer errored".

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::error::NetError;
use crate::framing::{FrameCodec, WireMessage};

#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    peer: SocketAddr,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            peer,
        }
    }

    /// Address of the remote endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one message and flush it.
    pub async fn send(&mut self, message: &WireMessage) -> Result<(), NetError> {
        let frame = message.to_frame()?;
        trace!(peer = %self.peer, frame_type = ?frame.frame_type, "sending frame");
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Wait up to `timeout` for the next message. A timeout yields
    /// `Ok(None)`; a closed stream is an error.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<WireMessage>, NetError> {
        let next = match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(next) => next,
            Err(_) => {
                trace!(peer = %self.peer, "receive timed out");
                return Ok(None);
            }
        };
        match next {
            Some(frame) => Ok(Some(WireMessage::from_frame(&frame?)?)),
            None => Err(NetError::ConnectionClosed),
        }
    }

    /// Shut down the write half, signalling end of exchange.
    pub async fn close(mut self) -> Result<(), NetError> {
        self.framed.close().await?;
        Ok(())
    }
}
