//! Feedback-counter rumor mongering
//!
//! Push-only propagation of recently changed keys. Each news key carries a
//! counter incremented every time a contacted peer already had it; once the
//! counter reaches the persistence threshold the rumor has gone cold and is
//! dropped. News is seeded from the store's update notifications and from
//! keys received during inbound exchanges, so rumors keep radiating outward.

use cloudgossip_core::{Node, PeerSelector};
use cloudgossip_net::{Connection, MuxClient, WireMessage};
use cloudgossip_store::{Store, StoreUpdate};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{CycleOutcome, EpidemicProtocol};
use crate::error::EngineError;

/// Multiplexer client id reserved for rumor mongering.
pub const RUMOR_CLIENT_ID: u32 = 1;

/// Default persistence threshold: a rumor survives this many "they already
/// had it" answers before going cold.
pub const DEFAULT_THRESHOLD: u32 = 3;

const PASSIVE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RumorMongering {
    store: Arc<Store>,
    selector: Arc<dyn PeerSelector>,
    client: MuxClient,
    threshold: u32,
    /// News key -> propagation counter.
    news: Mutex<HashMap<String, u32>>,
    updates: Mutex<broadcast::Receiver<StoreUpdate>>,
}

impl RumorMongering {
    pub fn new(
        store: Arc<Store>,
        selector: Arc<dyn PeerSelector>,
        client: MuxClient,
        threshold: u32,
    ) -> Self {
        let updates = Mutex::new(store.subscribe());
        Self {
            store,
            selector,
            client,
            threshold,
            news: Mutex::new(HashMap::new()),
            updates,
        }
    }

    pub fn news_len(&self) -> usize {
        self.news.lock().len()
    }

    /// Pull pending store-update notifications into the news map.
    fn drain_updates(&self) {
        let mut rx = self.updates.lock();
        loop {
            match rx.try_recv() {
                Ok(update) => {
                    let mut news = self.news.lock();
                    for key in update.keys {
                        news.insert(key, 0);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "dropped store update notifications");
                }
                Err(_) => break,
            }
        }
    }

    fn seed(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut news = self.news.lock();
        for key in keys {
            news.insert(key.clone(), 0);
        }
    }

    /// Feedback: bump the counter of every rumor the peer already had and
    /// drop the ones that reached the threshold.
    fn apply_feedback(&self, sent: &[String], still_missing: &HashSet<&String>) {
        let mut news = self.news.lock();
        for key in sent {
            if still_missing.contains(key) {
                continue;
            }
            if let Some(counter) = news.get_mut(key) {
                *counter += 1;
                if *counter >= self.threshold {
                    debug!(key = %key, "rumor went cold");
                    news.remove(key);
                }
            }
        }
    }

    async fn push_to_peer(
        &self,
        peer: cloudgossip_core::PeerAddr,
        news_keys: Vec<String>,
        budget: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + budget;
        let mut conn = self
            .client
            .create_connection(peer, deadline.saturating_duration_since(Instant::now()))
            .await?;

        let metadata = self.store.entries_metadata_for(&news_keys);
        conn.send(&WireMessage::Metadata(metadata)).await?;

        let missing = match conn
            .receive(deadline.saturating_duration_since(Instant::now()))
            .await?
        {
            Some(WireMessage::DiffData(Some(data))) => data,
            Some(WireMessage::DiffData(None)) => {
                return Err(EngineError::ExchangeAborted(
                    "peer could not compare news".into(),
                ))
            }
            Some(other) => {
                warn!(?other, "message out of phase");
                return Err(EngineError::ExchangeAborted("message out of phase".into()));
            }
            None => {
                return Err(EngineError::ExchangeAborted(
                    "timed out waiting for peer".into(),
                ))
            }
        };
        conn.send(&WireMessage::Diffs(self.store.diff_entries(&missing)))
            .await?;

        let missing_keys: HashSet<&String> = missing.iter().map(|d| &d.key).collect();
        self.apply_feedback(&news_keys, &missing_keys);
        info!(peer = %peer, rumors = news_keys.len(), new_to_peer = missing.len(), "rumor push complete");
        Ok(())
    }

    async fn serve_push(&self, mut conn: Connection) -> Result<(), EngineError> {
        let remote_meta = match conn.receive(PASSIVE_RECEIVE_TIMEOUT).await? {
            Some(WireMessage::Metadata(map)) => map,
            Some(other) => {
                warn!(?other, "message out of phase");
                return Err(EngineError::ExchangeAborted("message out of phase".into()));
            }
            None => {
                return Err(EngineError::ExchangeAborted(
                    "timed out waiting for initiator".into(),
                ))
            }
        };

        let cmp = match self.store.compare(&remote_meta) {
            Ok(cmp) => cmp,
            Err(e) => {
                conn.send(&WireMessage::DiffData(None)).await?;
                return Err(e.into());
            }
        };

        let missing: Vec<_> = cmp
            .fresher_on_remote
            .iter()
            .cloned()
            .map(cloudgossip_core::EntryDiffData::key_only)
            .collect();
        conn.send(&WireMessage::DiffData(Some(missing))).await?;

        let diffs = match conn.receive(PASSIVE_RECEIVE_TIMEOUT).await? {
            Some(WireMessage::Diffs(diffs)) => diffs,
            Some(other) => {
                warn!(?other, "message out of phase");
                return Err(EngineError::ExchangeAborted("message out of phase".into()));
            }
            None => {
                return Err(EngineError::ExchangeAborted(
                    "timed out waiting for diffs".into(),
                ))
            }
        };

        // Every key just received is news here, even when the local copy
        // turns out to be newer and the patch applies nothing.
        let received: Vec<String> = diffs.iter().map(|d| d.key.clone()).collect();
        let applied = self.store.patch_entries(&diffs)?;
        self.seed(&received);
        debug!(received = received.len(), applied = applied.len(), "served rumor push");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EpidemicProtocol for RumorMongering {
    fn name(&self) -> &'static str {
        "rumor-mongering"
    }

    async fn active_cycle(&self, budget: Duration) -> Result<CycleOutcome, EngineError> {
        self.drain_updates();
        let news_keys: Vec<String> = {
            let news = self.news.lock();
            if news.is_empty() {
                return Ok(CycleOutcome::Idle);
            }
            news.keys().cloned().collect()
        };

        let node = self
            .selector
            .select_node()
            .ok_or(EngineError::NoPeerAvailable)?;
        let peer = match node {
            Node::Peer(peer) => peer,
            Node::Cloud(cloud) => {
                // Rumor mongering is peer-to-peer only; a selector handing
                // out cloud targets is misconfigured.
                warn!(cloud = %cloud, "rumor mongering cannot target a cloud, check selector configuration");
                return Ok(CycleOutcome::Idle);
            }
        };

        self.push_to_peer(peer, news_keys, budget).await?;
        Ok(CycleOutcome::Exchanged)
    }

    async fn passive_cycle(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let conn = tokio::select! {
            conn = self.client.accept_connection() => conn?,
            _ = cancel.cancelled() => return Err(cloudgossip_net::NetError::Terminated.into()),
        };
        self.serve_push(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cloudgossip_core::{CloudRef, PeerAddr, StaticSelector};
    use cloudgossip_net::Multiplexer;
    use cloudgossip_store::diff::WholeEntryStrategy;
    use cloudgossip_store::persist::MemoryBackend;

    fn test_store() -> Arc<Store> {
        let store = Store::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(WholeEntryStrategy::new()),
        );
        store.set_list_window(Duration::ZERO);
        Arc::new(store)
    }

    fn entry_at(key: &str, content: &[u8], modified_ms: u64) -> cloudgossip_core::StoreEntry {
        let content = Bytes::copy_from_slice(content);
        let mut meta =
            cloudgossip_core::EntryMetadata::for_content(&content, "text/plain", HashMap::new());
        meta.modified_ms = modified_ms;
        cloudgossip_core::StoreEntry::new(key, meta, content)
    }

    async fn mux() -> Multiplexer {
        Multiplexer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    fn pair(
        store_a: Arc<Store>,
        store_b: Arc<Store>,
        mux_a: &Multiplexer,
        mux_b: &Multiplexer,
        threshold: u32,
    ) -> (RumorMongering, RumorMongering) {
        let selector_a = Arc::new(StaticSelector::new(vec![Node::Peer(mux_b.local_addr())]));
        let selector_b = Arc::new(StaticSelector::new(vec![Node::Peer(mux_a.local_addr())]));
        (
            RumorMongering::new(
                store_a,
                selector_a,
                mux_a.register_client(RUMOR_CLIENT_ID).unwrap(),
                threshold,
            ),
            RumorMongering::new(
                store_b,
                selector_b,
                mux_b.register_client(RUMOR_CLIENT_ID).unwrap(),
                threshold,
            ),
        )
    }

    async fn one_push(active: &RumorMongering, passive: Arc<RumorMongering>) -> CycleOutcome {
        let cancel = CancellationToken::new();
        let serving = tokio::spawn(async move { passive.passive_cycle(cancel).await });
        let outcome = active.active_cycle(Duration::from_secs(10)).await.unwrap();
        if outcome == CycleOutcome::Exchanged {
            serving.await.unwrap().unwrap();
        } else {
            serving.abort();
        }
        outcome
    }

    #[tokio::test]
    async fn no_news_is_an_idle_cycle() {
        let mux_a = mux().await;
        let protocol = RumorMongering::new(
            test_store(),
            Arc::new(StaticSelector::new(vec![])),
            mux_a.register_client(RUMOR_CLIENT_ID).unwrap(),
            DEFAULT_THRESHOLD,
        );
        let outcome = protocol.active_cycle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn local_write_propagates_and_seeds_receiver() {
        let store_a = test_store();
        let store_b = test_store();
        let mux_a = mux().await;
        let mux_b = mux().await;
        let (active, passive) = pair(store_a.clone(), store_b.clone(), &mux_a, &mux_b, 3);
        let passive = Arc::new(passive);

        store_a
            .put_entry("hot", Bytes::from_static(b"news"), "text/plain", HashMap::new())
            .unwrap();

        let outcome = one_push(&active, passive.clone()).await;
        assert_eq!(outcome, CycleOutcome::Exchanged);

        assert!(store_b.contains("hot").unwrap());
        // The receiver now spreads it onward.
        assert_eq!(passive.news_len(), 1);
        // The peer was missing it, so our counter did not advance.
        assert_eq!(*active.news.lock().get("hot").unwrap(), 0);
    }

    #[tokio::test]
    async fn rumor_goes_cold_after_threshold_redundant_pushes() {
        let store_a = test_store();
        let store_b = test_store();
        let mux_a = mux().await;
        let mux_b = mux().await;
        let threshold = 2;
        let (active, passive) = pair(store_a.clone(), store_b.clone(), &mux_a, &mux_b, threshold);
        let passive = Arc::new(passive);

        store_a
            .put_entry("hot", Bytes::from_static(b"news"), "text/plain", HashMap::new())
            .unwrap();

        // First push delivers; the next `threshold` pushes are redundant.
        assert_eq!(one_push(&active, passive.clone()).await, CycleOutcome::Exchanged);
        for _ in 0..threshold {
            assert_eq!(active.news_len(), 1);
            assert_eq!(one_push(&active, passive.clone()).await, CycleOutcome::Exchanged);
        }
        assert_eq!(active.news_len(), 0);

        // With no news left the protocol idles without contacting anyone.
        let outcome = active.active_cycle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn received_key_seeds_news_even_when_local_copy_is_newer() {
        let store_a = test_store();
        let store_b = test_store();
        let mux_a = mux().await;
        let mux_b = mux().await;
        let passive = Arc::new(RumorMongering::new(
            store_b.clone(),
            Arc::new(StaticSelector::new(vec![])),
            mux_b.register_client(RUMOR_CLIENT_ID).unwrap(),
            DEFAULT_THRESHOLD,
        ));

        store_a.update_entries(vec![entry_at("hot", b"stale", 500)]).unwrap();

        let cancel = CancellationToken::new();
        let serving = {
            let passive = passive.clone();
            tokio::spawn(async move { passive.passive_cycle(cancel).await })
        };

        // Drive the initiator side by hand so a local write can land
        // between the comparison and the patch.
        let dialer = mux_a.register_client(RUMOR_CLIENT_ID).unwrap();
        let mut conn = dialer
            .create_connection(mux_b.local_addr(), Duration::from_secs(5))
            .await
            .unwrap();
        conn.send(&WireMessage::Metadata(store_a.entries_metadata().unwrap()))
            .await
            .unwrap();
        let missing = match conn.receive(Duration::from_secs(5)).await.unwrap() {
            Some(WireMessage::DiffData(Some(data))) => data,
            other => panic!("unexpected message {other:?}"),
        };
        assert_eq!(missing.len(), 1);

        store_b.update_entries(vec![entry_at("hot", b"fresh", 900)]).unwrap();

        conn.send(&WireMessage::Diffs(store_a.diff_entries(&missing)))
            .await
            .unwrap();
        serving.await.unwrap().unwrap();

        // The stale diff lost the merge, but the key still spreads onward.
        let local = store_b.entry("hot").unwrap().unwrap();
        assert_eq!(local.metadata.modified_ms, 900);
        assert_eq!(local.content.as_ref(), b"fresh");
        assert_eq!(passive.news_len(), 1);
    }

    #[tokio::test]
    async fn cloud_target_is_logged_and_skipped() {
        let store = test_store();
        let mux_a = mux().await;
        let protocol = RumorMongering::new(
            store.clone(),
            Arc::new(StaticSelector::new(vec![Node::Cloud(CloudRef(
                "memory:c".into(),
            ))])),
            mux_a.register_client(RUMOR_CLIENT_ID).unwrap(),
            DEFAULT_THRESHOLD,
        );

        store
            .put_entry("hot", Bytes::from_static(b"news"), "text/plain", HashMap::new())
            .unwrap();
        let outcome = protocol.active_cycle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
        // The rumor is retained for a future, correctly configured cycle.
        assert_eq!(protocol.news_len(), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_fails_the_cycle() {
        let store = test_store();
        let mux_a = mux().await;
        // Nobody listening on this port.
        let dead = PeerAddr("127.0.0.1:1".parse().unwrap());
        let protocol = RumorMongering::new(
            store.clone(),
            Arc::new(StaticSelector::new(vec![Node::Peer(dead)])),
            mux_a.register_client(RUMOR_CLIENT_ID).unwrap(),
            DEFAULT_THRESHOLD,
        );
        store
            .put_entry("hot", Bytes::from_static(b"news"), "text/plain", HashMap::new())
            .unwrap();

        assert!(protocol.active_cycle(Duration::from_secs(1)).await.is_err());
        // Failure keeps the rumor for the retry.
        assert_eq!(protocol.news_len(), 1);
    }
}
