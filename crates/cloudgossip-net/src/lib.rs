//! CloudGossip network layer
//!
//! This crate lets multiple protocol instances share one listening port and
//! one UDP socket per node. Inbound traffic is routed to protocol instances
//! by an integer client id.
//!
//! # Modules
//!
//! - [`framing`]: Length-prefixed wire codec and the protocol messages
//! - [`mux`]: The connection multiplexer and per-client handles
//! - [`connection`]: A single multiplexed connection (send / receive)
//! - [`error`]: Error types

pub mod connection;
pub mod error;
pub mod framing;
pub mod mux;

pub use connection::Connection;
pub use error::NetError;
pub use framing::{Frame, FrameCodec, FrameType, WireMessage};
pub use mux::{Datagram, Multiplexer, MuxClient, MAX_DATAGRAM_SIZE};
