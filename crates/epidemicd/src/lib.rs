//! epidemicd - CloudGossip epidemic dissemination daemon
//!
//! Runs two epidemic protocols over one shared replicated store:
//! anti-entropy (periodic full push-pull reconciliation, client id 0) and
//! rumor mongering (push-only spread of recent changes, client id 1).

pub mod antientropy;
pub mod config;
pub mod engine;
pub mod error;
pub mod providers;
pub mod rumor;
pub mod server;
