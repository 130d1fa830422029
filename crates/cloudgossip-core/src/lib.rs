//! CloudGossip Core Library
//!
//! This crate provides the data model shared by every CloudGossip component:
//! node descriptors, store entry metadata, the store comparison result, the
//! opaque diff-negotiation payloads, and the peer-selection traits consumed
//! by the epidemic protocols.
//!
//! # Modules
//!
//! - [`types`]: Node descriptors and the replicated-store data model
//! - [`selector`]: Peer selection (`PeerSelector`, `View`, random selectors)
//! - [`error`]: Error types

pub mod error;
pub mod selector;
pub mod types;

pub use error::{CoreError, Result};
pub use selector::{PeerSelector, RandomSelector, StaticSelector, View};
pub use types::*;
