//! Peer selection
//!
//! The epidemic protocols never sample the membership themselves: each
//! active cycle they ask a [`PeerSelector`] for one target. The selector in
//! turn reads a [`View`] maintained by an external peer-sampling
//! collaborator.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::types::{Node, PeerAddr};

/// Supplies one gossip target per active cycle, or `None` when no candidate
/// is currently known.
pub trait PeerSelector: Send + Sync {
    fn select_node(&self) -> Option<Node>;
}

/// A node's current sample of known neighbors, keyed by descriptor with
/// opaque per-node metadata. Produced externally, consumed read-only here.
#[derive(Clone, Debug, Default)]
pub struct View {
    nodes: HashMap<Node, Vec<u8>>,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node, meta: Vec<u8>) {
        self.nodes.insert(node, meta);
    }

    pub fn remove(&mut self, node: &Node) {
        self.nodes.remove(node);
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.keys()
    }

    pub fn meta(&self, node: &Node) -> Option<&[u8]> {
        self.nodes.get(node).map(|m| m.as_slice())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Uniform random selection over a shared view, with an optional exclusion
/// set and a switch to skip cloud descriptors (rumor mongering requires
/// peer-only selection).
pub struct RandomSelector {
    view: Arc<RwLock<View>>,
    excluded: RwLock<HashSet<PeerAddr>>,
    exclude_cloud: bool,
}

impl RandomSelector {
    pub fn new(view: Arc<RwLock<View>>) -> Self {
        Self {
            view,
            excluded: RwLock::new(HashSet::new()),
            exclude_cloud: false,
        }
    }

    /// Skip cloud descriptors during selection.
    pub fn exclude_cloud(mut self, exclude: bool) -> Self {
        self.exclude_cloud = exclude;
        self
    }

    /// Exclude a peer from future selections (typically the local node).
    pub fn exclude_peer(&self, peer: PeerAddr) {
        self.excluded.write().insert(peer);
    }
}

impl PeerSelector for RandomSelector {
    fn select_node(&self) -> Option<Node> {
        let view = self.view.read();
        let excluded = self.excluded.read();
        let candidates: Vec<&Node> = view
            .nodes()
            .filter(|n| match n {
                Node::Peer(p) => !excluded.contains(p),
                Node::Cloud(_) => !self.exclude_cloud,
            })
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|n| (*n).clone())
    }
}

/// Random selection over a fixed node list, used for bootstrap peers.
pub struct StaticSelector {
    nodes: Vec<Node>,
}

impl StaticSelector {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}

impl PeerSelector for StaticSelector {
    fn select_node(&self) -> Option<Node> {
        self.nodes.choose(&mut rand::thread_rng()).cloned()
    }
}
