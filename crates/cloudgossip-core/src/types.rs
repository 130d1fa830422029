//! Core data model for the CloudGossip epidemic protocols
//!
//! Node descriptors are immutable snapshots exchanged by value. Store entry
//! metadata travels on the wire next to entry content, so every type here
//! derives serde and serializes via postcard.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CoreError;

/// Current wall-clock time as milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Network endpoint of a peer (address + port). Equality and hashing follow
/// the pair, so two descriptors for the same socket compare equal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerAddr(pub SocketAddr);

impl PeerAddr {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a cloud endpoint (e.g. `sled:./data/cloud` or a
/// bucket URI). The protocols never look inside it; provider resolution
/// happens at process startup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CloudRef(pub String);

impl std::fmt::Display for CloudRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cloud:{}", self.0)
    }
}

/// A gossip target: either a real peer or a cloud placeholder.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Node {
    Peer(PeerAddr),
    Cloud(CloudRef),
}

impl Node {
    pub fn is_cloud(&self) -> bool {
        matches!(self, Node::Cloud(_))
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Peer(p) => p.fmt(f),
            Node::Cloud(c) => c.fmt(f),
        }
    }
}

/// Lowercase hex BLAKE3 digest of entry content.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(blake3::hash(content).as_bytes())
}

/// Per-entry metadata: modification timestamp, content descriptors and
/// free-form user tags. The content hash is always normalized to lowercase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Last modification, milliseconds since the unix epoch
    pub modified_ms: u64,
    /// Content length in bytes
    pub content_length: u64,
    /// Lowercase hex digest of the content
    pub content_hash: String,
    /// Content type (may be empty)
    pub content_type: String,
    /// User metadata, order irrelevant
    pub user_metadata: HashMap<String, String>,
}

impl EntryMetadata {
    pub fn new(
        modified_ms: u64,
        content_length: u64,
        content_hash: impl Into<String>,
        content_type: impl Into<String>,
        user_metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            modified_ms,
            content_length,
            content_hash: content_hash.into().to_lowercase(),
            content_type: content_type.into(),
            user_metadata,
        }
    }

    /// Metadata for freshly written content, stamped with the current time.
    pub fn for_content(
        content: &[u8],
        content_type: impl Into<String>,
        user_metadata: HashMap<String, String>,
    ) -> Self {
        Self::new(
            now_millis(),
            content.len() as u64,
            content_hash(content),
            content_type,
            user_metadata,
        )
    }
}

/// A keyed entry with its metadata and full content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub metadata: EntryMetadata,
    pub content: Bytes,
}

impl StoreEntry {
    pub fn new(key: impl Into<String>, metadata: EntryMetadata, content: Bytes) -> Self {
        Self {
            key: key.into(),
            metadata,
            content,
        }
    }

    /// Check the transfer invariants: non-empty key, content length matching
    /// the advertised length, content hash matching the advertised digest.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.key.is_empty() {
            return Err(CoreError::EmptyKey);
        }
        if self.content.len() as u64 != self.metadata.content_length {
            return Err(CoreError::ContentMismatch {
                key: self.key.clone(),
                detail: format!(
                    "length {} != advertised {}",
                    self.content.len(),
                    self.metadata.content_length
                ),
            });
        }
        let digest = content_hash(&self.content);
        if digest != self.metadata.content_hash {
            return Err(CoreError::ContentMismatch {
                key: self.key.clone(),
                detail: format!("hash {} != advertised {}", digest, self.metadata.content_hash),
            });
        }
        Ok(())
    }
}

/// Result of comparing a local metadata mapping against a remote one.
///
/// The four sets are disjoint and partition the union of the two key sets
/// minus the keys that are identical on both sides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompareResult {
    /// Keys whose content is fresher locally, plus keys only known locally
    pub fresher_on_local: Vec<String>,
    /// Keys whose content is fresher on the remote side, plus keys unknown locally
    pub fresher_on_remote: Vec<String>,
    /// Same content, newer metadata timestamp locally
    pub metadata_changed_on_local: Vec<String>,
    /// Same content, newer metadata timestamp remotely
    pub metadata_changed_on_remote: Vec<String>,
}

impl CompareResult {
    pub fn is_empty(&self) -> bool {
        self.fresher_on_local.is_empty()
            && self.fresher_on_remote.is_empty()
            && self.metadata_changed_on_local.is_empty()
            && self.metadata_changed_on_remote.is_empty()
    }
}

/// Opaque negotiation payload advertising what a sender can diff against.
/// The default strategy carries only the key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryDiffData {
    pub key: String,
    pub payload: Vec<u8>,
}

impl EntryDiffData {
    pub fn key_only(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: Vec::new(),
        }
    }
}

/// Opaque diff payload keyed by entry key. The default strategy carries the
/// entire serialized entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryDiff {
    pub key: String,
    pub payload: Vec<u8>,
}
