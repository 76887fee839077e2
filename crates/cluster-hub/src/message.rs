//! Hub handshake and frame routing header.
//!
//! A node's first frame on the relay is a JSON handshake sent as a binary
//! WebSocket frame. Every later frame is an encoded `ClusterMessage`, of which
//! the relay reads only `recipientId`.

use cluster_core::NodeId;
use serde::{Deserialize, Serialize};

/// Maximum frame size (16MB) accepted from a node.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Handshake sent by a node right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
}

impl HandshakeMessage {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            node_id,
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("HandshakeMessage serialization should not fail")
    }

    /// Returns None if the data is not a handshake.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        (msg.msg_type == "handshake").then_some(msg)
    }
}

/// The one field of a bus frame the relay needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingHeader {
    #[serde(default)]
    recipient_id: Option<NodeId>,
}

/// Unicast target of a bus frame, if it names one.
pub fn recipient_of(frame: &[u8]) -> Option<NodeId> {
    serde_json::from_slice::<RoutingHeader>(frame)
        .ok()
        .and_then(|header| header.recipient_id)
}
