//! The replicated store
//!
//! Freshness is a timestamp-plus-hash heuristic, not a causal comparison:
//! concurrent conflicting writes resolve to whichever timestamp is
//! numerically larger. Batch operations skip failing keys instead of
//! aborting, and subscribers are notified once per applied batch.

use bytes::Bytes;
use cloudgossip_core::{now_millis, CompareResult, EntryDiff, EntryDiffData, EntryMetadata, StoreEntry};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::diff::DiffStrategy;
use crate::error::StoreError;
use crate::persist::PersistenceBackend;

/// Default window for listing active entries: 24 hours.
const DEFAULT_LIST_WINDOW: Duration = Duration::from_secs(3600 * 24);

/// Batched update notification.
#[derive(Clone, Debug)]
pub struct StoreUpdate {
    pub keys: Vec<String>,
}

/// A local key/value data set with per-entry metadata, pluggable persistence
/// and a pluggable diff strategy.
pub struct Store {
    backend: Arc<dyn PersistenceBackend>,
    diff: Arc<dyn DiffStrategy>,
    updates: broadcast::Sender<StoreUpdate>,
    /// Listing window; zero disables windowing.
    list_window: RwLock<Duration>,
}

impl Store {
    pub fn new(backend: Arc<dyn PersistenceBackend>, diff: Arc<dyn DiffStrategy>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            backend,
            diff,
            updates,
            list_window: RwLock::new(DEFAULT_LIST_WINDOW),
        }
    }

    /// Sets the window used to filter active entries. Entries count as
    /// active when modified within `now - window .. now`. A zero window
    /// lists everything.
    pub fn set_list_window(&self, window: Duration) {
        *self.list_window.write() = window;
    }

    pub fn list_window(&self) -> Duration {
        *self.list_window.read()
    }

    /// Subscribe to batched update notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    fn notify_updates(&self, keys: Vec<String>) {
        if keys.is_empty() {
            warn!("trying to notify an empty key list");
            return;
        }
        info!(count = keys.len(), "notifying subscribers of updated keys");
        let _ = self.updates.send(StoreUpdate { keys });
    }

    /// Keys of all active entries, respecting the list window.
    pub fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let window = *self.list_window.read();
        if window.is_zero() {
            self.backend.list(None)
        } else {
            let horizon = now_millis().saturating_sub(window.as_millis() as u64);
            self.backend.list(Some(horizon))
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.backend.contains(key)
    }

    pub fn entry(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        self.backend.read(key)
    }

    pub fn entry_metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        self.backend.read_metadata(key)
    }

    /// Metadata for all active entries.
    pub fn entries_metadata(&self) -> Result<HashMap<String, EntryMetadata>, StoreError> {
        let keys = self.list_keys()?;
        trace!(count = keys.len(), "collecting metadata");
        Ok(self.entries_metadata_for(&keys))
    }

    /// Metadata for the given keys; keys that fail to load are skipped.
    pub fn entries_metadata_for(&self, keys: &[String]) -> HashMap<String, EntryMetadata> {
        let mut map = HashMap::new();
        for key in keys {
            match self.backend.read_metadata(key) {
                Ok(Some(meta)) => {
                    map.insert(key.clone(), meta);
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "error retrieving metadata"),
            }
        }
        map
    }

    /// Full entries for the given keys; keys that fail to load are skipped.
    pub fn entries_for(&self, keys: &[String]) -> Vec<StoreEntry> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.backend.read(key) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => warn!(key = %key, "entry disappeared while reading"),
                Err(e) => warn!(key = %key, error = %e, "error reading entry"),
            }
        }
        entries
    }

    /// Local write: build fresh metadata for `content` and persist it.
    pub fn put_entry(
        &self,
        key: &str,
        content: Bytes,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let meta = EntryMetadata::for_content(&content, content_type, user_metadata);
        let entry = StoreEntry::new(key, meta, content);
        entry.validate()?;
        self.backend.write(&entry)?;
        self.notify_updates(vec![key.to_string()]);
        Ok(())
    }

    /// Merge incoming entries, applying each one only when its timestamp is
    /// strictly newer than the local entry (or the key is new). Applied keys
    /// are returned and subscribers are notified once for the whole batch.
    pub fn update_entries(&self, entries: Vec<StoreEntry>) -> Result<Vec<String>, StoreError> {
        let mut applied = Vec::new();
        for entry in entries {
            if let Err(e) = entry.validate() {
                warn!(key = %entry.key, error = %e, "invalid entry, skipping update");
                continue;
            }
            let local_ms = match self.backend.read_metadata(&entry.key) {
                Ok(meta) => meta.map(|m| m.modified_ms).unwrap_or(0),
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "error retrieving metadata, skipping update");
                    continue;
                }
            };
            if local_ms < entry.metadata.modified_ms {
                info!(key = %entry.key, "putting entry");
                match self.backend.write(&entry) {
                    Ok(()) => applied.push(entry.key),
                    Err(e) => warn!(key = %entry.key, error = %e, "error updating entry, skipping"),
                }
            }
        }
        if !applied.is_empty() {
            self.notify_updates(applied.clone());
        }
        Ok(applied)
    }

    /// Merge incoming metadata for existing entries. The stored content
    /// length and hash are preserved; a pure metadata update is never
    /// trusted to describe content. Missing keys are skipped.
    pub fn update_metadatas(&self, metadatas: &HashMap<String, EntryMetadata>) {
        for (key, meta) in metadatas {
            if let Err(e) = self.update_metadata(key, meta) {
                info!(key = %key, error = %e, "error updating metadata, skipping");
            }
        }
    }

    fn update_metadata(&self, key: &str, meta: &EntryMetadata) -> Result<(), StoreError> {
        let old = self
            .backend
            .read_metadata(key)?
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))?;

        let merged = EntryMetadata::new(
            meta.modified_ms,
            old.content_length,
            old.content_hash.clone(),
            meta.content_type.clone(),
            meta.user_metadata.clone(),
        );
        self.backend.write_metadata(key, &merged)?;
        info!(key = %key, "updated metadata");

        if merged.content_type != old.content_type || merged.user_metadata != old.user_metadata {
            trace!(key = %key, "metadata changed, notifying subscribers");
            self.notify_updates(vec![key.to_string()]);
        }
        Ok(())
    }

    /// Replace only the user metadata of an existing entry.
    pub fn update_user_metadata(
        &self,
        key: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let old = self
            .backend
            .read_metadata(key)?
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))?;
        let merged = EntryMetadata::new(
            old.modified_ms,
            old.content_length,
            old.content_hash,
            old.content_type,
            user_metadata,
        );
        self.backend.write_metadata(key, &merged)
    }

    /// Classify the remote metadata mapping against the local store.
    ///
    /// For each remote key: unknown locally means fresher on remote;
    /// otherwise the side with the smaller timestamp is stale, and the key
    /// counts as "fresher" there only when the content hashes differ, or as
    /// "metadata changed" when the hashes match but the timestamps do not.
    /// Keys known locally but absent remotely are always fresher on local.
    pub fn compare(
        &self,
        remote: &HashMap<String, EntryMetadata>,
    ) -> Result<CompareResult, StoreError> {
        let mut result = CompareResult::default();

        for (key, remote_meta) in remote {
            let local_meta = match self.backend.read_metadata(key) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(key = %key, error = %e, "error comparing entry, skipping");
                    continue;
                }
            };
            let local_meta = match local_meta {
                Some(meta) => meta,
                None => {
                    // Unknown key, it must be new
                    result.fresher_on_remote.push(key.clone());
                    continue;
                }
            };

            let local_ms = local_meta.modified_ms;
            let remote_ms = remote_meta.modified_ms;
            if local_ms < remote_ms {
                if local_meta.content_hash != remote_meta.content_hash {
                    result.fresher_on_remote.push(key.clone());
                } else if local_ms != remote_ms {
                    result.metadata_changed_on_remote.push(key.clone());
                }
            } else if local_meta.content_hash != remote_meta.content_hash {
                result.fresher_on_local.push(key.clone());
            } else if local_ms != remote_ms {
                result.metadata_changed_on_local.push(key.clone());
            }
        }

        let mut local_only: HashSet<String> = self.list_keys()?.into_iter().collect();
        for key in remote.keys() {
            local_only.remove(key);
        }
        result.fresher_on_local.extend(local_only);

        Ok(result)
    }

    /// Produce diff data for the given keys; failing keys are skipped.
    pub fn produce_diff_data(&self, keys: &[String]) -> Vec<EntryDiffData> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = match self.backend.read(key) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    warn!(key = %key, "no entry to produce diff data for");
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "error producing diff data");
                    continue;
                }
            };
            match self.diff.produce_diff_data(key, &entry) {
                Ok(data) => out.push(data),
                Err(e) => warn!(key = %key, error = %e, "error producing diff data"),
            }
        }
        out
    }

    /// Turn remote diff data into diffs of the local entries.
    pub fn diff_entries(&self, diff_data: &[EntryDiffData]) -> Vec<EntryDiff> {
        let mut out = Vec::with_capacity(diff_data.len());
        for data in diff_data {
            let entry = match self.backend.read(&data.key) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    warn!(key = %data.key, "no entry to diff");
                    continue;
                }
                Err(e) => {
                    warn!(key = %data.key, error = %e, "error diffing entry");
                    continue;
                }
            };
            match self.diff.produce_diff(&entry, data) {
                Ok(diff) => out.push(diff),
                Err(e) => warn!(key = %data.key, error = %e, "error diffing entry"),
            }
        }
        out
    }

    /// Apply remote diffs: patch each one against the current local entry
    /// and merge the results through [`Store::update_entries`].
    pub fn patch_entries(&self, diffs: &[EntryDiff]) -> Result<Vec<String>, StoreError> {
        let mut entries = Vec::with_capacity(diffs.len());
        for diff in diffs {
            let current = match self.backend.read(&diff.key) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %diff.key, error = %e, "error reading entry for patch");
                    continue;
                }
            };
            match self.diff.patch(current, diff) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key = %diff.key, error = %e, "error patching entry"),
            }
        }
        debug!(count = entries.len(), "patched entries ready to merge");
        self.update_entries(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::WholeEntryStrategy;
    use crate::persist::MemoryBackend;
    use cloudgossip_core::content_hash;

    fn test_store() -> Store {
        let store = Store::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(WholeEntryStrategy::new()),
        );
        store.set_list_window(Duration::ZERO);
        store
    }

    fn entry_at(key: &str, content: &[u8], modified_ms: u64) -> StoreEntry {
        let content = Bytes::copy_from_slice(content);
        let mut meta = EntryMetadata::for_content(&content, "text/plain", HashMap::new());
        meta.modified_ms = modified_ms;
        StoreEntry::new(key, meta, content)
    }

    #[test]
    fn compare_partitions_disjointly() {
        let store = test_store();
        store
            .update_entries(vec![
                entry_at("both-stale", b"old", 100),
                entry_at("both-fresh", b"new", 900),
                entry_at("meta-local", b"same", 500),
                entry_at("meta-remote", b"same", 100),
                entry_at("local-only", b"mine", 300),
            ])
            .unwrap();

        let mut remote = HashMap::new();
        remote.insert("both-stale".to_string(), entry_at("both-stale", b"fresh", 200).metadata);
        remote.insert("both-fresh".to_string(), entry_at("both-fresh", b"old", 200).metadata);
        remote.insert("meta-local".to_string(), entry_at("meta-local", b"same", 100).metadata);
        remote.insert("meta-remote".to_string(), entry_at("meta-remote", b"same", 500).metadata);
        remote.insert("remote-only".to_string(), entry_at("remote-only", b"theirs", 400).metadata);

        let cmp = store.compare(&remote).unwrap();

        // All four buckets are disjoint and cover exactly the differing keys.
        let mut seen = HashSet::new();
        for key in cmp
            .fresher_on_local
            .iter()
            .chain(&cmp.fresher_on_remote)
            .chain(&cmp.metadata_changed_on_local)
            .chain(&cmp.metadata_changed_on_remote)
        {
            assert!(seen.insert(key.clone()), "key {key} classified twice");
        }
        assert!(cmp.fresher_on_remote.contains(&"both-stale".to_string()));
        assert!(cmp.fresher_on_remote.contains(&"remote-only".to_string()));
        assert!(cmp.fresher_on_local.contains(&"both-fresh".to_string()));
        assert!(cmp.fresher_on_local.contains(&"local-only".to_string()));
        assert_eq!(cmp.metadata_changed_on_local, vec!["meta-local".to_string()]);
        assert_eq!(cmp.metadata_changed_on_remote, vec!["meta-remote".to_string()]);
    }

    #[test]
    fn compare_equal_timestamps_conflicting_hashes_stay_local() {
        // Hash inequality is checked before timestamp equality, so a true
        // write conflict with equal timestamps classifies as fresher on
        // local (the local >= remote branch).
        let store = test_store();
        store.update_entries(vec![entry_at("x", b"mine", 500)]).unwrap();

        let mut remote = HashMap::new();
        remote.insert("x".to_string(), entry_at("x", b"theirs", 500).metadata);

        let cmp = store.compare(&remote).unwrap();
        assert_eq!(cmp.fresher_on_local, vec!["x".to_string()]);
        assert!(cmp.fresher_on_remote.is_empty());
    }

    #[test]
    fn compare_identical_stores_is_empty() {
        let store = test_store();
        store.update_entries(vec![entry_at("x", b"v", 100)]).unwrap();
        let remote = store.entries_metadata().unwrap();
        assert!(store.compare(&remote).unwrap().is_empty());

        let empty = test_store();
        assert!(empty.compare(&HashMap::new()).unwrap().is_empty());
    }

    #[test]
    fn update_is_idempotent_and_monotonic() {
        let store = test_store();
        let e = entry_at("x", b"payload", 500);

        let applied = store.update_entries(vec![e.clone()]).unwrap();
        assert_eq!(applied, vec!["x".to_string()]);
        let first = store.entry("x").unwrap().unwrap();

        // Same entry again: timestamp is not strictly newer, nothing applies.
        let applied = store.update_entries(vec![e.clone()]).unwrap();
        assert!(applied.is_empty());
        assert_eq!(store.entry("x").unwrap().unwrap(), first);

        // Older entry never overwrites.
        let applied = store.update_entries(vec![entry_at("x", b"stale", 400)]).unwrap();
        assert!(applied.is_empty());
        assert_eq!(store.entry("x").unwrap().unwrap().metadata.modified_ms, 500);

        // Strictly newer entry lands with its own timestamp.
        store.update_entries(vec![entry_at("x", b"newer", 600)]).unwrap();
        assert_eq!(store.entry("x").unwrap().unwrap().metadata.modified_ms, 600);
    }

    #[test]
    fn update_rejects_corrupted_entries() {
        let store = test_store();
        let mut e = entry_at("x", b"payload", 500);
        e.metadata.content_length += 1;
        let applied = store.update_entries(vec![e]).unwrap();
        assert!(applied.is_empty());
        assert!(!store.contains("x").unwrap());
    }

    #[test]
    fn diff_negotiation_round_trip() {
        let a = test_store();
        let b = test_store();
        a.update_entries(vec![
            entry_at("one", b"first", 100),
            entry_at("two", b"second", 200),
        ])
        .unwrap();

        let keys = vec!["one".to_string(), "two".to_string()];
        let diff_data = b.produce_diff_data(&keys); // b has nothing to advertise
        assert!(diff_data.is_empty());

        let diff_data: Vec<_> = keys
            .iter()
            .map(|k| EntryDiffData::key_only(k.clone()))
            .collect();
        let diffs = a.diff_entries(&diff_data);
        assert_eq!(diffs.len(), 2);

        let applied = b.patch_entries(&diffs).unwrap();
        assert_eq!(applied.len(), 2);
        for key in &keys {
            let ea = a.entry(key).unwrap().unwrap();
            let eb = b.entry(key).unwrap().unwrap();
            assert_eq!(ea.content, eb.content);
            assert_eq!(ea.metadata.content_hash, eb.metadata.content_hash);
            assert_eq!(eb.metadata.content_hash, content_hash(&eb.content));
        }
    }

    #[test]
    fn metadata_update_preserves_length_and_hash() {
        let store = test_store();
        store.update_entries(vec![entry_at("x", b"payload", 500)]).unwrap();
        let old = store.entry_metadata("x").unwrap().unwrap();

        let mut user = HashMap::new();
        user.insert("tag".to_string(), "v".to_string());
        let mut incoming = EntryMetadata::new(900, 12345, "deadbeef", "text/html", user.clone());
        let mut map = HashMap::new();
        map.insert("x".to_string(), incoming.clone());
        store.update_metadatas(&map);

        let merged = store.entry_metadata("x").unwrap().unwrap();
        assert_eq!(merged.modified_ms, 900);
        assert_eq!(merged.content_type, "text/html");
        assert_eq!(merged.user_metadata, user);
        // length and hash are never trusted from a metadata update
        assert_eq!(merged.content_length, old.content_length);
        assert_eq!(merged.content_hash, old.content_hash);

        // Unknown keys are skipped without failing the batch.
        incoming.modified_ms = 1000;
        let mut map = HashMap::new();
        map.insert("ghost".to_string(), incoming);
        store.update_metadatas(&map);
        assert!(!store.contains("ghost").unwrap());
    }

    #[tokio::test]
    async fn batched_update_notification() {
        let store = test_store();
        let mut rx = store.subscribe();

        store
            .update_entries(vec![entry_at("a", b"1", 100), entry_at("b", b"2", 100)])
            .unwrap();

        let update = rx.recv().await.unwrap();
        let mut keys = update.keys;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(rx.try_recv().is_err(), "expected exactly one notification");
    }

    #[tokio::test]
    async fn metadata_notification_only_on_visible_change() {
        let store = test_store();
        store.update_entries(vec![entry_at("x", b"v", 100)]).unwrap();
        let old = store.entry_metadata("x").unwrap().unwrap();
        let mut rx = store.subscribe();

        // Only the timestamp moves: no notification.
        let mut bumped = old.clone();
        bumped.modified_ms = 200;
        let mut map = HashMap::new();
        map.insert("x".to_string(), bumped);
        store.update_metadatas(&map);
        assert!(rx.try_recv().is_err());

        // Content type changes: subscribers hear about it.
        let mut changed = old;
        changed.modified_ms = 300;
        changed.content_type = "application/json".to_string();
        let mut map = HashMap::new();
        map.insert("x".to_string(), changed);
        store.update_metadatas(&map);
        assert_eq!(rx.try_recv().unwrap().keys, vec!["x".to_string()]);
    }

    #[test]
    fn user_metadata_replacement_keeps_everything_else() {
        let store = test_store();
        store.update_entries(vec![entry_at("x", b"payload", 500)]).unwrap();
        let before = store.entry_metadata("x").unwrap().unwrap();

        let mut user = HashMap::new();
        user.insert("owner".to_string(), "node-1".to_string());
        store.update_user_metadata("x", user.clone()).unwrap();

        let after = store.entry_metadata("x").unwrap().unwrap();
        assert_eq!(after.user_metadata, user);
        assert_eq!(after.modified_ms, before.modified_ms);
        assert_eq!(after.content_hash, before.content_hash);

        assert!(matches!(
            store.update_user_metadata("ghost", HashMap::new()),
            Err(StoreError::MissingKey(_))
        ));
    }

    #[test]
    fn entries_for_skips_unknown_keys() {
        let store = test_store();
        store.update_entries(vec![entry_at("x", b"1", 100)]).unwrap();
        let entries = store.entries_for(&["x".to_string(), "ghost".to_string()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "x");
    }

    #[test]
    fn list_window_filters_old_entries() {
        let store = test_store();
        let now = now_millis();
        store
            .update_entries(vec![
                entry_at("fresh", b"1", now),
                entry_at("ancient", b"2", 1000),
            ])
            .unwrap();

        store.set_list_window(Duration::from_secs(3600));
        assert_eq!(store.list_keys().unwrap(), vec!["fresh".to_string()]);

        store.set_list_window(Duration::ZERO);
        assert_eq!(store.list_keys().unwrap().len(), 2);
    }
}
