//! CloudGossip replicated store
//!
//! A [`Store`](store::Store) is a local key/value data set with per-entry
//! metadata, a pluggable persistence backend, and a pluggable diff strategy.
//! It exposes the comparison and differential-sync primitives the epidemic
//! protocols are built on.
//!
//! # Modules
//!
//! - [`store`]: The store itself (compare, diff negotiation, merge)
//! - [`persist`]: Persistence backends (in-memory, sled)
//! - [`diff`]: Diff strategies (default whole-entry transfer)
//! - [`cloud`]: Cloud object-storage collaborator and adapter

pub mod cloud;
pub mod diff;
pub mod error;
pub mod persist;
pub mod store;

pub use error::StoreError;
pub use store::{Store, StoreUpdate};
