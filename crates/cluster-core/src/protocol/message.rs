//! The cluster bus envelope and every message kind carried in it.

use crate::adapter::options::{BroadcastOptions, BroadcastPacket, Room, SocketDetails};
use crate::engine::lock::LockMode;
use crate::node_id::{NodeId, RequestId, SessionId};
use crate::packet::{Packet, TransportKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag carried by every message so that foreign traffic sharing the bus is
/// ignored.
pub const MESSAGE_SOURCE: &str = "_cluster";

/// Namespace assumed when a message carries none.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Envelope for everything published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMessage {
    #[serde(rename = "_source")]
    pub source: String,
    pub sender_id: NodeId,
    /// Set for unicast messages. Everyone else drops them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsp: Option<String>,
    pub body: MessageBody,
}

impl ClusterMessage {
    pub fn broadcast(sender_id: NodeId, body: MessageBody) -> Self {
        Self {
            source: MESSAGE_SOURCE.to_string(),
            sender_id,
            recipient_id: None,
            request_id: None,
            nsp: None,
            body,
        }
    }

    pub fn to(mut self, recipient: NodeId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn in_namespace(mut self, nsp: impl Into<String>) -> Self {
        self.nsp = Some(nsp.into());
        self
    }

    pub fn namespace(&self) -> &str {
        self.nsp.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Whether this node should act on the message.
    pub fn is_for(&self, node: NodeId) -> bool {
        self.recipient_id.is_none_or(|r| r == node)
    }
}

/// All message kinds, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageBody {
    // Membership
    InitialHeartbeat,
    Heartbeat,
    NodeLeave,

    // Session ownership and handoff
    AcquireLock {
        sid: SessionId,
        transport: TransportKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<LockMode>,
    },
    AcquireLockResponse {
        success: bool,
    },
    Drain {
        sid: SessionId,
        packets: Vec<Packet>,
    },
    Packet {
        sid: SessionId,
        packet: Packet,
    },
    Upgrade {
        sid: SessionId,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpgradeResponse {
        take_over: bool,
        #[serde(default)]
        packets: Vec<Packet>,
    },
    SessionClose {
        sid: SessionId,
        reason: String,
    },

    // Broadcast and aggregation
    Broadcast {
        packet: BroadcastPacket,
        opts: BroadcastOptions,
    },
    SocketsJoin {
        opts: BroadcastOptions,
        rooms: Vec<Room>,
    },
    SocketsLeave {
        opts: BroadcastOptions,
        rooms: Vec<Room>,
    },
    DisconnectSockets {
        opts: BroadcastOptions,
        close: bool,
    },
    FetchSockets {
        opts: BroadcastOptions,
    },
    FetchSocketsResponse {
        sockets: Vec<SocketDetails>,
    },
    ServerSideEmit {
        args: Vec<Value>,
    },
    ServerSideEmitResponse {
        value: Value,
    },
    BroadcastClientCount {
        count: usize,
    },
    BroadcastAck {
        value: Value,
    },
}

impl MessageBody {
    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::InitialHeartbeat => "initialHeartbeat",
            MessageBody::Heartbeat => "heartbeat",
            MessageBody::NodeLeave => "nodeLeave",
            MessageBody::AcquireLock { .. } => "acquireLock",
            MessageBody::AcquireLockResponse { .. } => "acquireLockResponse",
            MessageBody::Drain { .. } => "drain",
            MessageBody::Packet { .. } => "packet",
            MessageBody::Upgrade { .. } => "upgrade",
            MessageBody::UpgradeResponse { .. } => "upgradeResponse",
            MessageBody::SessionClose { .. } => "sessionClose",
            MessageBody::Broadcast { .. } => "broadcast",
            MessageBody::SocketsJoin { .. } => "socketsJoin",
            MessageBody::SocketsLeave { .. } => "socketsLeave",
            MessageBody::DisconnectSockets { .. } => "disconnectSockets",
            MessageBody::FetchSockets { .. } => "fetchSockets",
            MessageBody::FetchSocketsResponse { .. } => "fetchSocketsResponse",
            MessageBody::ServerSideEmit { .. } => "serverSideEmit",
            MessageBody::ServerSideEmitResponse { .. } => "serverSideEmitResponse",
            MessageBody::BroadcastClientCount { .. } => "broadcastClientCount",
            MessageBody::BroadcastAck { .. } => "broadcastAck",
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            MessageBody::InitialHeartbeat | MessageBody::Heartbeat | MessageBody::NodeLeave
        )
    }

    /// Handled by the session ownership engine.
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MessageBody::AcquireLock { .. }
                | MessageBody::AcquireLockResponse { .. }
                | MessageBody::Drain { .. }
                | MessageBody::Packet { .. }
                | MessageBody::Upgrade { .. }
                | MessageBody::UpgradeResponse { .. }
                | MessageBody::SessionClose { .. }
        )
    }

    /// Replies that are meaningless without a request id.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageBody::AcquireLockResponse { .. }
                | MessageBody::UpgradeResponse { .. }
                | MessageBody::FetchSocketsResponse { .. }
                | MessageBody::ServerSideEmitResponse { .. }
                | MessageBody::BroadcastClientCount { .. }
                | MessageBody::BroadcastAck { .. }
        )
    }
}
