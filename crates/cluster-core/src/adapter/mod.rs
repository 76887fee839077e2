//! Cluster-wide room operations for one namespace.
//!
//! Every operation is applied to the local adapter and, unless the `local`
//! flag is set, published so that every other node applies it too.
//! Operations that return data (`fetch_sockets`, `server_side_emit_with_ack`)
//! are correlated requests aggregated per the configured policy.

pub(crate) mod acks;
pub mod local;
pub mod options;

use crate::config::AggregationPolicy;
use crate::context::{now_ms, NodeContext};
use crate::correlator::{Expectation, RequestCorrelator, RequestError};
use crate::node_id::{NodeId, RequestId};
use crate::protocol::{ClusterMessage, MessageBody};
use crate::recovery::{Offset, RecoveryStore, RestoredSession, SessionToPersist};
use acks::AckRegistry;
use local::{AckCallback, ClientCountCallback, LocalAdapter, ReplyCallback};
use options::{BroadcastOptions, BroadcastPacket, Room, SocketDetails};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("timeout reached: missing {missing} of {expected} responses")]
    Timeout { missing: usize, expected: usize },
}

impl From<RequestError> for AdapterError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Timeout { missing, expected } => AdapterError::Timeout { missing, expected },
        }
    }
}

/// Replies to a server-side emit. On timeout, `responses` holds the replies
/// that did arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitReplies {
    pub responses: Vec<Value>,
    pub error: Option<AdapterError>,
}

pub struct ClusterAdapter {
    ctx: Arc<NodeContext>,
    nsp: String,
    local: Arc<dyn LocalAdapter>,
    fetches: RequestCorrelator<SocketDetails>,
    emits: RequestCorrelator<Value>,
    acks: AckRegistry,
    recovery: Option<Arc<RecoveryStore>>,
}

impl ClusterAdapter {
    pub(crate) fn new(ctx: Arc<NodeContext>, nsp: impl Into<String>, local: Arc<dyn LocalAdapter>) -> Self {
        let recovery = ctx
            .config
            .recovery
            .as_ref()
            .map(|config| Arc::new(RecoveryStore::new(config)));
        Self {
            ctx,
            nsp: nsp.into(),
            local,
            fetches: RequestCorrelator::new("fetch-sockets"),
            emits: RequestCorrelator::new("server-side-emit"),
            acks: AckRegistry::default(),
            recovery,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.nsp
    }

    pub fn local(&self) -> &Arc<dyn LocalAdapter> {
        &self.local
    }

    pub fn recovery(&self) -> Option<&Arc<RecoveryStore>> {
        self.recovery.as_ref()
    }

    /// Live nodes including this one.
    pub fn server_count(&self) -> usize {
        self.ctx.server_count()
    }

    fn message(&self, body: MessageBody) -> ClusterMessage {
        self.ctx.message(body).in_namespace(self.nsp.as_str())
    }

    fn expectation(&self) -> Expectation {
        match self.ctx.config.aggregation {
            AggregationPolicy::Membership => Expectation::Peers(self.ctx.live_peers()),
            AggregationPolicy::Count => Expectation::Count(self.ctx.server_count().saturating_sub(1)),
        }
    }

    fn has_peers(&self) -> bool {
        self.ctx.with_membership(|m| m.peer_count() > 0)
    }

    // ========================================================================
    // Fire-and-forget operations
    // ========================================================================

    pub fn broadcast(&self, mut packet: BroadcastPacket, opts: BroadcastOptions) {
        if !opts.flags.local {
            if let Some(store) = &self.recovery {
                if packet.is_recoverable(&opts.flags) {
                    packet.offset = Some(store.append(&packet, &opts, now_ms()));
                }
            }
            self.ctx.publish(self.message(MessageBody::Broadcast {
                packet: packet.clone(),
                opts: opts.clone(),
            }));
        }
        self.local.broadcast(&packet, &opts);
    }

    /// Broadcast and collect client acknowledgements from every node.
    ///
    /// `on_client_count` is called once with the local count and once per
    /// peer that reports. `on_ack` is called per acknowledgement until the
    /// timeout (`opts.flags.timeout_ms`, else the request timeout) passes.
    pub fn broadcast_with_ack(
        &self,
        packet: BroadcastPacket,
        opts: BroadcastOptions,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
    ) {
        if !opts.flags.local {
            let request_id = RequestId::generate();
            let timeout = opts
                .flags
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.ctx.config.request_timeout());
            self.acks.register(
                request_id,
                Arc::clone(&on_client_count),
                Arc::clone(&on_ack),
                timeout,
            );
            let body = MessageBody::Broadcast {
                packet: packet.clone(),
                opts: opts.clone(),
            };
            self.ctx.publish(self.message(body).with_request(request_id));
        }

        let count = self.local.broadcast_with_ack(&packet, &opts, on_ack);
        on_client_count(count);
    }

    pub fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.local.add_sockets(&opts, &rooms);
        if !opts.flags.local {
            self.ctx.publish(self.message(MessageBody::SocketsJoin { opts, rooms }));
        }
    }

    pub fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.local.del_sockets(&opts, &rooms);
        if !opts.flags.local {
            self.ctx.publish(self.message(MessageBody::SocketsLeave { opts, rooms }));
        }
    }

    pub fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) {
        self.local.disconnect_sockets(&opts, close);
        if !opts.flags.local {
            self.ctx
                .publish(self.message(MessageBody::DisconnectSockets { opts, close }));
        }
    }

    /// Emit to the other servers, expecting no reply.
    pub fn server_side_emit(&self, args: Vec<Value>) {
        self.ctx.publish(self.message(MessageBody::ServerSideEmit { args }));
    }

    // ========================================================================
    // Aggregated requests
    // ========================================================================

    /// Matching sockets across the cluster, local ones first.
    pub async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<SocketDetails>, AdapterError> {
        let mut sockets = self.local.fetch_sockets(&opts);
        if opts.flags.local || !self.has_peers() {
            return Ok(sockets);
        }

        let request_id = RequestId::generate();
        let pending = self
            .fetches
            .issue(request_id, self.expectation(), self.ctx.config.request_timeout());
        self.ctx.publish(
            self.message(MessageBody::FetchSockets { opts })
                .with_request(request_id),
        );

        let remote = pending.wait().await.into_result()?;
        sockets.extend(remote);
        Ok(sockets)
    }

    /// Emit to the other servers and collect one reply from each.
    pub async fn server_side_emit_with_ack(&self, args: Vec<Value>) -> EmitReplies {
        if !self.has_peers() {
            return EmitReplies {
                responses: Vec::new(),
                error: None,
            };
        }

        let request_id = RequestId::generate();
        let pending = self
            .emits
            .issue(request_id, self.expectation(), self.ctx.config.request_timeout());
        self.ctx.publish(
            self.message(MessageBody::ServerSideEmit { args })
                .with_request(request_id),
        );

        let (responses, error) = pending.wait().await.into_parts();
        EmitReplies {
            responses,
            error: error.map(AdapterError::from),
        }
    }

    // ========================================================================
    // Connection-state recovery
    // ========================================================================

    pub fn persist_session(&self, session: SessionToPersist) {
        if let Some(store) = &self.recovery {
            store.persist_session(session, now_ms());
        }
    }

    pub fn restore_session(&self, pid: &str, offset: &Offset) -> Option<RestoredSession> {
        let store = self.recovery.as_ref()?;
        let restored = store.restore_session(pid, offset, now_ms());
        if let Some(session) = &restored {
            info!(
                "Restored session {} with {} missed packet(s)",
                session.sid,
                session.missed_packets.len()
            );
        }
        restored
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn reply(&self, to: NodeId, request_id: RequestId, body: MessageBody) {
        self.ctx.publish(self.message(body).to(to).with_request(request_id));
    }

    pub(crate) fn on_message(&self, message: ClusterMessage) {
        let sender = message.sender_id;
        let request_id = message.request_id;

        match message.body {
            MessageBody::Broadcast { packet, opts } => match request_id {
                Some(request_id) => self.on_broadcast_with_ack(sender, request_id, packet, opts),
                None => {
                    if let Some(store) = &self.recovery {
                        if packet.is_recoverable(&opts.flags) {
                            store.record(&packet, &opts, now_ms());
                        }
                    }
                    self.local.broadcast(&packet, &opts);
                }
            },
            MessageBody::SocketsJoin { opts, rooms } => self.local.add_sockets(&opts, &rooms),
            MessageBody::SocketsLeave { opts, rooms } => self.local.del_sockets(&opts, &rooms),
            MessageBody::DisconnectSockets { opts, close } => self.local.disconnect_sockets(&opts, close),
            MessageBody::FetchSockets { opts } => {
                let Some(request_id) = request_id else {
                    debug!("fetchSockets from {} without a request id", sender);
                    return;
                };
                let sockets = self.local.fetch_sockets(&opts);
                self.reply(sender, request_id, MessageBody::FetchSocketsResponse { sockets });
            }
            MessageBody::ServerSideEmit { args } => {
                let reply = request_id.map(|request_id| {
                    let ctx = Arc::clone(&self.ctx);
                    let nsp = self.nsp.clone();
                    let reply: ReplyCallback = Box::new(move |value| {
                        let body = MessageBody::ServerSideEmitResponse { value };
                        ctx.publish(
                            ctx.message(body)
                                .in_namespace(nsp)
                                .to(sender)
                                .with_request(request_id),
                        );
                    });
                    reply
                });
                self.local.server_side_emit(args, reply);
            }
            MessageBody::FetchSocketsResponse { sockets } => {
                if let Some(request_id) = request_id {
                    self.fetches.on_response(request_id, sender, sockets);
                }
            }
            MessageBody::ServerSideEmitResponse { value } => {
                if let Some(request_id) = request_id {
                    self.emits.on_response(request_id, sender, [value]);
                }
            }
            MessageBody::BroadcastClientCount { count } => {
                if let Some(request_id) = request_id {
                    self.acks.on_client_count(request_id, sender, count);
                }
            }
            MessageBody::BroadcastAck { value } => {
                if let Some(request_id) = request_id {
                    self.acks.on_ack(request_id, value);
                }
            }
            other => debug!("Adapter {} ignoring {}", self.nsp, other.kind()),
        }
    }

    fn on_broadcast_with_ack(
        &self,
        origin: NodeId,
        request_id: RequestId,
        packet: BroadcastPacket,
        opts: BroadcastOptions,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let nsp = self.nsp.clone();
        let on_ack: AckCallback = Arc::new(move |value| {
            let body = MessageBody::BroadcastAck { value };
            ctx.publish(
                ctx.message(body)
                    .in_namespace(nsp.as_str())
                    .to(origin)
                    .with_request(request_id),
            );
        });

        let count = self.local.broadcast_with_ack(&packet, &opts, on_ack);
        debug!("Waiting for {} client ack(s) for request {}", count, request_id);
        self.reply(origin, request_id, MessageBody::BroadcastClientCount { count });
    }

    pub(crate) fn on_node_down(&self, node: NodeId) {
        self.fetches.on_node_down(node);
        self.emits.on_node_down(node);
    }
}
