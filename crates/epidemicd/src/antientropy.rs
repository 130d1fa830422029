//! Anti-entropy push-pull protocol
//!
//! Once per active cycle the protocol reconciles the full store with one
//! selected target. Against a peer the exchange runs over a multiplexed
//! connection in four round trips; against a cloud target the remote store
//! is a local collaborator and the same compare/pull/push sequence runs
//! without wire framing.
//!
//! Patch application is the last step of every exchange, so a mid-exchange
//! timeout or I/O failure abandons the cycle without corrupting the store.

use cloudgossip_core::{CloudRef, EntryDiffData, EntryMetadata, Node, PeerAddr, PeerSelector};
use cloudgossip_net::{Connection, MuxClient, WireMessage};
use cloudgossip_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{CycleOutcome, EpidemicProtocol};
use crate::error::EngineError;

/// Multiplexer client id reserved for anti-entropy.
pub const ANTI_ENTROPY_CLIENT_ID: u32 = 0;

/// Bound on each network wait while serving an inbound exchange.
const PASSIVE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AntiEntropy {
    store: Arc<Store>,
    selector: Arc<dyn PeerSelector>,
    client: MuxClient,
    /// Cloud stores by endpoint reference, resolved at startup.
    clouds: HashMap<CloudRef, Arc<Store>>,
}

impl AntiEntropy {
    pub fn new(store: Arc<Store>, selector: Arc<dyn PeerSelector>, client: MuxClient) -> Self {
        Self {
            store,
            selector,
            client,
            clouds: HashMap::new(),
        }
    }

    /// Attach a cloud store the selector may hand out as a target.
    pub fn with_cloud(mut self, cloud_ref: CloudRef, cloud: Arc<Store>) -> Self {
        self.clouds.insert(cloud_ref, cloud);
        self
    }

    async fn exchange_with_peer(
        &self,
        peer: PeerAddr,
        budget: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + budget;
        let mut conn = self
            .client
            .create_connection(peer, remaining(deadline))
            .await?;
        debug!(peer = %peer, "anti-entropy exchange started");

        // Phase 1: announce our full metadata mapping.
        let local_meta = self.store.entries_metadata()?;
        conn.send(&WireMessage::Metadata(local_meta)).await?;

        // Phase 2: the peer advertises diff data for every key it is
        // missing or stale on; we answer with the diffs.
        let diff_data = match recv(&mut conn, deadline).await? {
            WireMessage::DiffData(Some(data)) => data,
            WireMessage::DiffData(None) => {
                return Err(EngineError::ExchangeAborted(
                    "peer could not compare stores".into(),
                ))
            }
            other => return Err(unexpected(&other)),
        };
        conn.send(&WireMessage::Diffs(self.store.diff_entries(&diff_data)))
            .await?;

        // Phase 3: metadata-only deltas the peer is newer on, then the keys
        // it is content-fresher on.
        let meta_update = match recv(&mut conn, deadline).await? {
            WireMessage::MetadataUpdate(update) => update,
            other => return Err(unexpected(&other)),
        };
        let wanted = match recv(&mut conn, deadline).await? {
            WireMessage::KeyList(keys) => keys,
            other => return Err(unexpected(&other)),
        };

        // Phase 4: advertise diff data for the keys we want, collect the
        // diffs, and only then touch the store.
        conn.send(&WireMessage::DiffData(Some(diff_data_for(
            &self.store,
            &wanted,
        ))))
        .await?;
        let diffs = match recv(&mut conn, deadline).await? {
            WireMessage::Diffs(diffs) => diffs,
            other => return Err(unexpected(&other)),
        };

        let applied = self.store.patch_entries(&diffs)?;
        if let Some(update) = meta_update {
            self.store.update_metadatas(&update);
        }
        info!(peer = %peer, pushed = diff_data.len(), pulled = applied.len(), "anti-entropy exchange complete");
        Ok(())
    }

    /// Serve one inbound exchange, the mirror of [`Self::exchange_with_peer`].
    async fn serve_exchange(&self, mut conn: Connection) -> Result<(), EngineError> {
        let peer = conn.peer_addr();
        let remote_meta = match recv_fixed(&mut conn).await? {
            WireMessage::Metadata(map) => map,
            other => return Err(unexpected(&other)),
        };

        let cmp = match self.store.compare(&remote_meta) {
            Ok(cmp) => cmp,
            Err(e) => {
                // Tell the initiator to abort instead of leaving it hanging.
                conn.send(&WireMessage::DiffData(None)).await?;
                return Err(e.into());
            }
        };

        conn.send(&WireMessage::DiffData(Some(diff_data_for(
            &self.store,
            &cmp.fresher_on_remote,
        ))))
        .await?;
        let diffs = match recv_fixed(&mut conn).await? {
            WireMessage::Diffs(diffs) => diffs,
            other => return Err(unexpected(&other)),
        };

        let meta_update = if cmp.metadata_changed_on_local.is_empty() {
            None
        } else {
            Some(self.store.entries_metadata_for(&cmp.metadata_changed_on_local))
        };
        conn.send(&WireMessage::MetadataUpdate(meta_update)).await?;
        conn.send(&WireMessage::KeyList(cmp.fresher_on_local.clone()))
            .await?;

        let their_diff_data = match recv_fixed(&mut conn).await? {
            WireMessage::DiffData(Some(data)) => data,
            WireMessage::DiffData(None) => {
                return Err(EngineError::ExchangeAborted("peer aborted pull phase".into()))
            }
            other => return Err(unexpected(&other)),
        };
        conn.send(&WireMessage::Diffs(self.store.diff_entries(&their_diff_data)))
            .await?;

        // Everything is in hand; apply as the final step.
        let applied = self.store.patch_entries(&diffs)?;
        if !cmp.metadata_changed_on_remote.is_empty() {
            let subset = restrict(&remote_meta, &cmp.metadata_changed_on_remote);
            self.store.update_metadatas(&subset);
        }
        debug!(peer = %peer, applied = applied.len(), "served anti-entropy exchange");
        Ok(())
    }

    /// Reconcile with a cloud store: same compare/pull/push sequence, no
    /// wire framing.
    fn exchange_with_cloud(&self, cloud_ref: &CloudRef) -> Result<(), EngineError> {
        let cloud = self.clouds.get(cloud_ref).ok_or_else(|| {
            EngineError::ExchangeAborted(format!("no cloud store for {cloud_ref}"))
        })?;

        let remote_meta = cloud.entries_metadata()?;
        let cmp = self.store.compare(&remote_meta)?;
        if cmp.is_empty() {
            debug!(cloud = %cloud_ref, "cloud already in sync");
            return Ok(());
        }

        // Pull what the cloud is fresher on.
        let pull = cloud.diff_entries(&diff_data_for(&self.store, &cmp.fresher_on_remote));
        let pulled = self.store.patch_entries(&pull)?;

        // Push what we are fresher on.
        let push = self.store.diff_entries(&diff_data_for(cloud, &cmp.fresher_on_local));
        let pushed = cloud.patch_entries(&push)?;

        if !cmp.metadata_changed_on_local.is_empty() {
            cloud.update_metadatas(&self.store.entries_metadata_for(&cmp.metadata_changed_on_local));
        }
        if !cmp.metadata_changed_on_remote.is_empty() {
            self.store
                .update_metadatas(&restrict(&remote_meta, &cmp.metadata_changed_on_remote));
        }

        info!(cloud = %cloud_ref, pulled = pulled.len(), pushed = pushed.len(), "cloud exchange complete");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EpidemicProtocol for AntiEntropy {
    fn name(&self) -> &'static str {
        "anti-entropy"
    }

    async fn active_cycle(&self, budget: Duration) -> Result<CycleOutcome, EngineError> {
        let node = self
            .selector
            .select_node()
            .ok_or(EngineError::NoPeerAvailable)?;
        match node {
            Node::Peer(peer) => self.exchange_with_peer(peer, budget).await?,
            Node::Cloud(cloud_ref) => self.exchange_with_cloud(&cloud_ref)?,
        }
        Ok(CycleOutcome::Exchanged)
    }

    async fn passive_cycle(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let conn = tokio::select! {
            conn = self.client.accept_connection() => conn?,
            _ = cancel.cancelled() => return Err(cloudgossip_net::NetError::Terminated.into()),
        };
        self.serve_exchange(conn).await
    }
}

/// Diff-data advertisements for `keys`: real advertisements for keys we
/// hold, key-only placeholders for keys we are requesting outright.
fn diff_data_for(store: &Store, keys: &[String]) -> Vec<EntryDiffData> {
    let mut data = store.produce_diff_data(keys);
    for key in keys {
        if !data.iter().any(|d| &d.key == key) {
            data.push(EntryDiffData::key_only(key.clone()));
        }
    }
    data
}

fn restrict(
    map: &HashMap<String, EntryMetadata>,
    keys: &[String],
) -> HashMap<String, EntryMetadata> {
    keys.iter()
        .filter_map(|k| map.get(k).map(|m| (k.clone(), m.clone())))
        .collect()
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn recv(conn: &mut Connection, deadline: Instant) -> Result<WireMessage, EngineError> {
    match conn.receive(remaining(deadline)).await? {
        Some(msg) => Ok(msg),
        None => Err(EngineError::ExchangeAborted(
            "timed out waiting for peer".into(),
        )),
    }
}

async fn recv_fixed(conn: &mut Connection) -> Result<WireMessage, EngineError> {
    match conn.receive(PASSIVE_RECEIVE_TIMEOUT).await? {
        Some(msg) => Ok(msg),
        None => Err(EngineError::ExchangeAborted(
            "timed out waiting for initiator".into(),
        )),
    }
}

fn unexpected(message: &WireMessage) -> EngineError {
    warn!(?message, "message out of phase");
    EngineError::ExchangeAborted("message out of phase".into())
}
