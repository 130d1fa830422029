//! Diff strategies
//!
//! The three-step negotiation (diff data -> diff -> patch) is delegated to a
//! strategy so delta compression can be added later without touching the
//! protocols. The payloads are opaque to everything but the strategy that
//! produced them.

use cloudgossip_core::{EntryDiff, EntryDiffData, StoreEntry};

use crate::error::StoreError;

pub trait DiffStrategy: Send + Sync {
    /// Advertise what the holder of `entry` can diff against.
    fn produce_diff_data(&self, key: &str, entry: &StoreEntry)
        -> Result<EntryDiffData, StoreError>;

    /// Build a diff of `entry` against the remote side's advertisement.
    fn produce_diff(
        &self,
        entry: &StoreEntry,
        diff_data: &EntryDiffData,
    ) -> Result<EntryDiff, StoreError>;

    /// Apply a diff on top of the current local entry (if any), yielding the
    /// entry to merge.
    fn patch(
        &self,
        current: Option<StoreEntry>,
        diff: &EntryDiff,
    ) -> Result<StoreEntry, StoreError>;
}

/// Default strategy: no delta compression. Diff data carries only the key,
/// the diff carries the entire serialized entry, patching replaces the local
/// entry wholesale.
#[derive(Default)]
pub struct WholeEntryStrategy;

impl WholeEntryStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl DiffStrategy for WholeEntryStrategy {
    fn produce_diff_data(
        &self,
        key: &str,
        _entry: &StoreEntry,
    ) -> Result<EntryDiffData, StoreError> {
        Ok(EntryDiffData::key_only(key))
    }

    fn produce_diff(
        &self,
        entry: &StoreEntry,
        diff_data: &EntryDiffData,
    ) -> Result<EntryDiff, StoreError> {
        Ok(EntryDiff {
            key: diff_data.key.clone(),
            payload: postcard::to_allocvec(entry)?,
        })
    }

    fn patch(
        &self,
        _current: Option<StoreEntry>,
        diff: &EntryDiff,
    ) -> Result<StoreEntry, StoreError> {
        Ok(postcard::from_bytes(&diff.payload)?)
    }
}
