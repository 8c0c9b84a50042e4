//! Peer store and active-peer computation (spec §4.3).
//!
//! Generalizes the teacher's log-encoded `Configuration` (`protos.rs`,
//! `members`/`learners` sets maintained purely by committed config-change
//! entries) to a dynamically discovered set refreshed out-of-band by the
//! discovery manager. Majority math (consensus.rs `majority_size`) is
//! computed against this snapshot instead of a committed configuration.

use crate::config::timing;
use crate::store::Store;
use crate::types::{ClusterNode, NodeId, NodeSource};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A rewritable-atomically snapshot of reachable peers (spec §3 `PeerStore
/// snapshot`).
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    pub peers: HashMap<NodeId, String>,
    pub current_leader_id: Option<NodeId>,
}

pub struct PeerStore {
    local_id: NodeId,
    store: Arc<dyn Store>,
    snapshot: RwLock<PeerSnapshot>,
}

impl PeerStore {
    pub fn new(local_id: NodeId, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(PeerStore {
            local_id,
            store,
            snapshot: RwLock::new(PeerSnapshot::default()),
        })
    }

    /// Rewrites the in-memory snapshot from the `ClusterNode` table,
    /// excluding self, the empty string and any sentinel placeholder, and
    /// keeping only rows fresh within the consensus freshness window (spec
    /// §4.3). Called by the discovery manager every ~5s
    /// (`timing::PEER_STORE_REFRESH_INTERVAL`).
    pub fn refresh(&self) -> crate::errors::Result<()> {
        let nodes = self.store.cluster_nodes()?;
        let now = Utc::now();
        let mut peers = HashMap::new();
        for node in nodes {
            if !self.is_eligible(&node, now, timing::PEER_FRESHNESS_WINDOW) {
                continue;
            }
            peers.insert(node.node_id, node.address);
        }
        let mut snap = self.snapshot.write().unwrap();
        snap.peers = peers;
        Ok(())
    }

    fn is_eligible(&self, node: &ClusterNode, now: chrono::DateTime<Utc>, window: std::time::Duration) -> bool {
        if node.node_id.is_empty() || node.node_id == self.local_id || node.node_id == "-" {
            return false;
        }
        let age = now.signed_duration_since(node.last_seen);
        age.to_std().map(|a| a <= window).unwrap_or(false)
    }

    /// Active peer set used for majority math and replication targets
    /// (spec §4.1.2, §4.1.3).
    pub fn active_peers(&self) -> Vec<NodeId> {
        self.snapshot.read().unwrap().peers.keys().cloned().collect()
    }

    pub fn address_of(&self, node_id: &str) -> Option<String> {
        self.snapshot.read().unwrap().peers.get(node_id).cloned()
    }

    pub fn set_current_leader(&self, leader_id: Option<NodeId>) {
        self.snapshot.write().unwrap().current_leader_id = leader_id;
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.snapshot.read().unwrap().current_leader_id.clone()
    }

    /// A longer window used for informational listings (`GET
    /// /cluster/nodes`), spec §4.3.
    pub fn listing(&self) -> crate::errors::Result<Vec<ClusterNode>> {
        let nodes = self.store.cluster_nodes()?;
        let now = Utc::now();
        Ok(nodes
            .into_iter()
            .filter(|n| self.is_eligible(n, now, timing::PEER_LISTING_WINDOW))
            .collect())
    }

    /// Inserts or updates a node record. `last_seen` is advanced only when
    /// `direct_contact` is true (spec §4.3/§4.4: gossip reports about
    /// third parties must not refresh `last_seen`).
    pub fn upsert(&self, node_id: &str, address: &str, source: NodeSource, direct_contact: bool) -> crate::errors::Result<()> {
        let existing = self
            .store
            .cluster_nodes()?
            .into_iter()
            .find(|n| n.node_id == node_id);

        let last_seen = if direct_contact {
            Utc::now()
        } else {
            match existing {
                // Gossip-sourced inserts of previously unknown nodes get a
                // timestamp placed in the past so they expire quickly if
                // never contacted directly.
                None => Utc::now() - chrono::Duration::from_std(timing::PEER_FRESHNESS_WINDOW).unwrap() * 2,
                Some(n) => n.last_seen,
            }
        };

        self.store.upsert_cluster_node(&ClusterNode {
            node_id: node_id.to_string(),
            address: address.to_string(),
            source,
            last_seen,
        })
    }

    pub fn touch(&self, node_id: &str) -> crate::errors::Result<()> {
        self.store.touch_last_seen(node_id, Utc::now())
    }

    /// Handles `POST /cluster/leave`: pushes `last_seen` far enough into the
    /// past that the next `refresh()` drops the node from the active set,
    /// without needing a separate tombstone column.
    pub fn forget(&self, node_id: &str) -> crate::errors::Result<()> {
        self.store.touch_last_seen(node_id, Utc::now() - chrono::Duration::days(3650))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn active_peers_excludes_self_and_stale() {
        let store = SqliteStore::open_in_memory().unwrap();
        let peer_store = PeerStore::new("n1".into(), store.clone());

        peer_store.upsert("n1", "10.0.0.1:8000", NodeSource::Local, true).unwrap();
        peer_store.upsert("n2", "10.0.0.2:8000", NodeSource::Dns, true).unwrap();
        // n3 is stale: gossip insert never directly contacted.
        peer_store.upsert("n3", "10.0.0.3:8000", NodeSource::Gossip, false).unwrap();

        peer_store.refresh().unwrap();
        let mut active = peer_store.active_peers();
        active.sort();
        assert_eq!(active, vec!["n2".to_string()]);
    }

    #[test]
    fn gossip_does_not_refresh_last_seen_of_known_node() {
        let store = SqliteStore::open_in_memory().unwrap();
        let peer_store = PeerStore::new("n1".into(), store.clone());
        peer_store.upsert("n2", "addr", NodeSource::Dns, true).unwrap();
        peer_store.refresh().unwrap();
        assert!(peer_store.active_peers().contains(&"n2".to_string()));

        // A gossip report about n2 from a seed must not refresh last_seen.
        peer_store.upsert("n2", "addr", NodeSource::Gossip, false).unwrap();
        let nodes = store.cluster_nodes().unwrap();
        let n2 = nodes.iter().find(|n| n.node_id == "n2").unwrap();
        assert!(Utc::now().signed_duration_since(n2.last_seen).num_seconds() < 60);
    }
}
