//! A cluster node: one bus endpoint, the membership tracker, the session
//! engine and one adapter per namespace, wired together by background tasks.
//!
//! Tasks:
//! - outbound pump: encodes queued messages and publishes them in order
//! - dispatch: decodes inbound payloads and routes them by kind and namespace
//! - heartbeat: publishes a heartbeat when nothing was broadcast for
//!   `heartbeatInterval`
//! - cleanup: evicts silent nodes every `cleanupInterval`
//! - recovery sweep (when recovery is enabled)

use crate::adapter::local::LocalAdapter;
use crate::adapter::ClusterAdapter;
use crate::bus::{BusEndpoint, MessageBus};
use crate::config::{ClusterConfig, ConfigError};
use crate::context::{now_ms, NodeContext};
use crate::engine::{ClusterEngine, EngineEvent};
use crate::events::{ClusterEvent, EventBus, LeaveReason};
use crate::node_id::NodeId;
use crate::protocol::{self, ClusterMessage, MessageBody};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time given to the outbound pump to publish the leave notice.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(50);

pub struct ClusterNode {
    ctx: Arc<NodeContext>,
    engine: Arc<ClusterEngine>,
    adapters: RwLock<HashMap<String, Arc<ClusterAdapter>>>,
    events: Arc<EventBus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Start a node with a fresh id. Must be called inside a tokio runtime.
    ///
    /// Returns the node and the receiver of its engine events.
    pub fn start(
        config: ClusterConfig,
        endpoint: BusEndpoint,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>), ConfigError> {
        Self::start_with_id(NodeId::generate(), config, endpoint)
    }

    pub fn start_with_id(
        node_id: NodeId,
        config: ClusterConfig,
        endpoint: BusEndpoint,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>), ConfigError> {
        config.validate()?;

        let (ctx, outbox) = NodeContext::new(node_id, config);
        let (engine, engine_events) = ClusterEngine::new(Arc::clone(&ctx));
        let node = Arc::new(Self {
            ctx: Arc::clone(&ctx),
            engine,
            adapters: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let BusEndpoint { publisher, inbound } = endpoint;
        let mut tasks = vec![
            tokio::spawn(pump(outbox, publisher)),
            node.spawn_dispatch(inbound),
            node.spawn_heartbeat(),
            node.spawn_cleanup(),
        ];
        if let Some(recovery) = &ctx.config.recovery {
            tasks.push(node.spawn_recovery_sweep(Duration::from_millis(recovery.sweep_interval_ms)));
        }
        *node.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;

        ctx.publish(ctx.message(MessageBody::InitialHeartbeat));
        info!("Cluster node {} started", node_id);
        Ok((node, engine_events))
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.ctx.config
    }

    pub fn engine(&self) -> &Arc<ClusterEngine> {
        &self.engine
    }

    /// Membership events. Subscriptions end when dropped.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Live nodes including this one.
    pub fn server_count(&self) -> usize {
        self.ctx.server_count()
    }

    /// Live peers, sorted.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.ctx.live_peers().into_iter().collect();
        peers.sort();
        peers
    }

    /// Register the adapter for a namespace, replacing any previous one.
    pub fn adapter(&self, nsp: &str, local: Arc<dyn LocalAdapter>) -> Arc<ClusterAdapter> {
        let adapter = Arc::new(ClusterAdapter::new(Arc::clone(&self.ctx), nsp, local));
        let previous = self
            .adapters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nsp.to_string(), Arc::clone(&adapter));
        if previous.is_some() {
            warn!("Replaced adapter for namespace {}", nsp);
        }
        adapter
    }

    fn adapters(&self) -> Vec<Arc<ClusterAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Announce departure, then stop every task and drop every transport.
    pub async fn shutdown(&self) {
        self.ctx.publish(self.ctx.message(MessageBody::NodeLeave));
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        self.engine.shutdown();
        self.abort_tasks();
        info!("Cluster node {} stopped", self.ctx.node_id);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn on_payload(&self, payload: &[u8]) {
        if let Some(message) = protocol::decode(payload) {
            self.on_message(message);
        }
    }

    fn on_message(&self, message: ClusterMessage) {
        let sender = message.sender_id;
        if sender == self.ctx.node_id {
            return;
        }

        if message.body == MessageBody::NodeLeave {
            if message.is_for(self.ctx.node_id) && self.ctx.with_membership(|m| m.remove(sender)) {
                self.node_down(sender, LeaveReason::Leave);
            }
            return;
        }

        // Any message proves liveness, including unicasts meant for others
        let now = now_ms();
        if self.ctx.with_membership(|m| m.observe(sender, now)) {
            info!("Node {} joined", sender);
            self.events.emit(ClusterEvent::NodeJoined {
                node_id: sender,
                timestamp: now,
            });
        }

        if !message.is_for(self.ctx.node_id) {
            return;
        }

        if message.body.is_membership() {
            if message.body == MessageBody::InitialHeartbeat {
                self.ctx.publish(self.ctx.message(MessageBody::Heartbeat));
            }
            return;
        }

        if message.body.is_session() {
            self.engine.on_message(message);
            return;
        }

        let adapter = self
            .adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message.namespace())
            .cloned();
        match adapter {
            Some(adapter) => adapter.on_message(message),
            None => debug!(
                "No adapter for namespace {}, dropping {}",
                message.namespace(),
                message.body.kind()
            ),
        }
    }

    /// Stop waiting on a departed node everywhere.
    fn node_down(&self, node: NodeId, reason: LeaveReason) {
        info!("Node {} left ({:?})", node, reason);
        self.engine.on_node_down(node);
        for adapter in self.adapters() {
            adapter.on_node_down(node);
        }
        self.events.emit(ClusterEvent::NodeLeft {
            node_id: node,
            reason,
            timestamp: now_ms(),
        });
    }

    fn sweep_members(&self) {
        let gone = self.ctx.with_membership(|m| m.sweep(now_ms()));
        for node in gone {
            self.node_down(node, LeaveReason::Timeout);
        }
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    fn spawn_dispatch(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                let Some(node) = node.upgrade() else {
                    break;
                };
                node.on_payload(&payload);
            }
            debug!("Bus inbound closed");
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let interval = ctx.config.heartbeat_interval_ms;
        tokio::spawn(async move {
            loop {
                let due = ctx.last_broadcast_ms().saturating_add(interval);
                let now = now_ms();
                if now >= due {
                    ctx.publish(ctx.message(MessageBody::Heartbeat));
                } else {
                    tokio::time::sleep(Duration::from_millis(due - now)).await;
                }
            }
        })
    }

    fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        let period = Duration::from_millis(self.ctx.config.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                node.sweep_members();
            }
        })
    }

    fn spawn_recovery_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                for adapter in node.adapters() {
                    let Some(store) = adapter.recovery() else {
                        continue;
                    };
                    let (sessions, packets) = store.sweep(now_ms());
                    if sessions + packets > 0 {
                        debug!(
                            "Recovery sweep for {} evicted {} session(s) and {} packet(s)",
                            adapter.namespace(),
                            sessions,
                            packets
                        );
                    }
                }
            }
        })
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Publish queued messages one at a time so each sender's order holds.
async fn pump(mut outbox: mpsc::UnboundedReceiver<ClusterMessage>, bus: Arc<dyn MessageBus>) {
    while let Some(message) = outbox.recv().await {
        let payload = protocol::encode(&message);
        if let Err(e) = bus.publish(payload, message.recipient_id).await {
            warn!("Failed to publish {}: {}", message.body.kind(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> ClusterConfig {
        ClusterConfig {
            heartbeat_interval_ms: 40,
            heartbeat_timeout_ms: 120,
            cleanup_interval_ms: 20,
            ..ClusterConfig::default()
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let bus = InMemoryBus::new();
        let (_, endpoint) = bus.connect();
        let config = ClusterConfig {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 100,
            ..ClusterConfig::default()
        };
        assert!(ClusterNode::start(config, endpoint).is_err());
    }

    #[tokio::test]
    async fn test_nodes_discover_each_other() {
        let bus = InMemoryBus::new();
        let (_, a) = bus.connect();
        let (_, b) = bus.connect();
        let (node_a, _) = ClusterNode::start(fast(), a).unwrap();
        let (node_b, _) = ClusterNode::start(fast(), b).unwrap();

        assert!(wait_for(|| node_a.server_count() == 2 && node_b.server_count() == 2).await);
        assert_eq!(node_a.peers(), vec![node_b.node_id()]);
    }

    #[tokio::test]
    async fn test_crashed_node_times_out() {
        let bus = InMemoryBus::new();
        let (_, a) = bus.connect();
        let (member_b, b) = bus.connect();
        let (node_a, _) = ClusterNode::start(fast(), a).unwrap();
        let (node_b, _) = ClusterNode::start(fast(), b).unwrap();
        assert!(wait_for(|| node_a.server_count() == 2).await);

        let left = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&left);
        let _sub = node_a.events().subscribe(move |event| {
            if matches!(event, ClusterEvent::NodeLeft { reason: LeaveReason::Timeout, .. }) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        bus.disconnect(member_b);
        assert!(wait_for(|| node_a.server_count() == 1).await);
        assert_eq!(left.load(Ordering::Relaxed), 1);
        drop(node_b);
    }

    #[tokio::test]
    async fn test_leave_notice_removes_node() {
        let bus = InMemoryBus::new();
        let (_, a) = bus.connect();
        let (_, b) = bus.connect();
        let config = ClusterConfig {
            heartbeat_timeout_ms: 60_000,
            ..fast()
        };
        let (node_a, _) = ClusterNode::start(config.clone(), a).unwrap();
        let (node_b, _) = ClusterNode::start(config, b).unwrap();
        assert!(wait_for(|| node_a.server_count() == 2).await);

        node_b.shutdown().await;
        assert!(wait_for(|| node_a.server_count() == 1).await);
    }

    #[tokio::test]
    async fn test_foreign_payloads_ignored() {
        let bus = InMemoryBus::new();
        let (_, a) = bus.connect();
        let (_, raw) = bus.connect();
        let (node_a, _) = ClusterNode::start(fast(), a).unwrap();

        raw.publisher.publish(b"not json".to_vec(), None).await.unwrap();
        raw.publisher
            .publish(br#"{"_source":"other","senderId":"0000000000000009","body":{"type":"heartbeat"}}"#.to_vec(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node_a.server_count(), 1);
    }
}
