//! Heartbeat-based membership tracking.
//!
//! A pure state machine: the caller feeds it observed senders and the
//! current time, and acts on the nodes it reports as gone. Any message from
//! a peer counts as a heartbeat.

use crate::node_id::NodeId;
use std::collections::{HashMap, HashSet};

/// What we know about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeRecord {
    id: NodeId,
    /// Last time a message from this node was seen (milliseconds)
    last_seen_at: u64,
}

/// Tracks live peers and evicts silent ones.
pub struct MembershipTracker {
    local_id: NodeId,
    heartbeat_timeout_ms: u64,
    peers: HashMap<NodeId, NodeRecord>,
}

impl MembershipTracker {
    pub fn new(local_id: NodeId, heartbeat_timeout_ms: u64) -> Self {
        Self {
            local_id,
            heartbeat_timeout_ms,
            peers: HashMap::new(),
        }
    }

    /// Record a message from `sender`. Returns true if the node is new.
    pub fn observe(&mut self, sender: NodeId, now_ms: u64) -> bool {
        if sender == self.local_id {
            return false;
        }
        match self.peers.get_mut(&sender) {
            Some(record) => {
                record.last_seen_at = record.last_seen_at.max(now_ms);
                false
            }
            None => {
                self.peers.insert(
                    sender,
                    NodeRecord {
                        id: sender,
                        last_seen_at: now_ms,
                    },
                );
                true
            }
        }
    }

    /// Evict every peer silent for longer than the heartbeat timeout.
    ///
    /// Returns the evicted nodes; the caller must treat each as down.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<NodeId> {
        let timeout = self.heartbeat_timeout_ms;
        let mut gone: Vec<NodeId> = self
            .peers
            .values()
            .filter(|r| now_ms.saturating_sub(r.last_seen_at) > timeout)
            .map(|r| r.id)
            .collect();
        gone.sort();

        for id in &gone {
            self.peers.remove(id);
        }
        gone
    }

    /// Remove a peer that announced its departure. Returns true if it was known.
    pub fn remove(&mut self, id: NodeId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn live_peers(&self) -> HashSet<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of nodes in the cluster, this one included.
    pub fn server_count(&self) -> usize {
        self.peers.len() + 1
    }
}
