//! State shared by the engine, the adapters and the node loop.

use crate::config::ClusterConfig;
use crate::membership::MembershipTracker;
use crate::node_id::NodeId;
use crate::protocol::{ClusterMessage, MessageBody};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) struct NodeContext {
    pub node_id: NodeId,
    pub config: ClusterConfig,
    membership: Mutex<MembershipTracker>,
    outbox: mpsc::UnboundedSender<ClusterMessage>,
    last_broadcast_ms: AtomicU64,
}

impl NodeContext {
    /// Returns the context and the receiving end of its outbound queue.
    pub fn new(
        node_id: NodeId,
        config: ClusterConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClusterMessage>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let membership = MembershipTracker::new(node_id, config.heartbeat_timeout_ms);
        let ctx = Arc::new(Self {
            node_id,
            config,
            membership: Mutex::new(membership),
            outbox,
            last_broadcast_ms: AtomicU64::new(0),
        });
        (ctx, rx)
    }

    /// A broadcast message from this node.
    pub fn message(&self, body: MessageBody) -> ClusterMessage {
        ClusterMessage::broadcast(self.node_id, body)
    }

    /// Queue a message for the outbound pump.
    pub fn publish(&self, message: ClusterMessage) {
        if message.recipient_id.is_none() {
            self.last_broadcast_ms.store(now_ms(), Ordering::Relaxed);
        }
        debug!(
            "Publishing {} (recipient: {:?}, request: {:?})",
            message.body.kind(),
            message.recipient_id.map(|r| r.to_string()),
            message.request_id.map(|r| r.to_string())
        );
        if self.outbox.send(message).is_err() {
            debug!("Outbound pump stopped, message dropped");
        }
    }

    pub fn last_broadcast_ms(&self) -> u64 {
        self.last_broadcast_ms.load(Ordering::Relaxed)
    }

    pub fn with_membership<R>(&self, f: impl FnOnce(&mut MembershipTracker) -> R) -> R {
        let mut membership = self.membership.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut membership)
    }

    pub fn live_peers(&self) -> HashSet<NodeId> {
        self.with_membership(|m| m.live_peers())
    }

    pub fn server_count(&self) -> usize {
        self.with_membership(|m| m.server_count())
    }
}
