//! Bus payload encoding.
//!
//! Messages travel as UTF-8 JSON objects. Anything else sharing the bus,
//! including JSON from other producers, is rejected by `decode` so the
//! caller can drop it.

use super::message::{ClusterMessage, MESSAGE_SOURCE};
use tracing::debug;

/// Encoding of a raw bus payload, judged from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Json,
    Binary,
    Empty,
}

pub fn detect_payload_kind(data: &[u8]) -> PayloadKind {
    match data.first() {
        Some(b'{') => PayloadKind::Json,
        Some(_) => PayloadKind::Binary,
        None => PayloadKind::Empty,
    }
}

pub fn encode(message: &ClusterMessage) -> Vec<u8> {
    serde_json::to_vec(message).expect("ClusterMessage serialization should not fail")
}

/// Decode a payload, returning `None` for anything that is not one of ours.
pub fn decode(data: &[u8]) -> Option<ClusterMessage> {
    if detect_payload_kind(data) != PayloadKind::Json {
        debug!("Dropping non-JSON bus payload ({} bytes)", data.len());
        return None;
    }

    let message: ClusterMessage = match serde_json::from_slice(data) {
        Ok(message) => message,
        Err(e) => {
            debug!("Dropping malformed bus message: {}", e);
            return None;
        }
    };

    if message.source != MESSAGE_SOURCE {
        debug!("Dropping foreign bus message (source: {})", message.source);
        return None;
    }

    if message.body.is_response() && message.request_id.is_none() {
        debug!(
            "Dropping {} from {} without request id",
            message.body.kind(),
            message.sender_id
        );
        return None;
    }

    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::{NodeId, RequestId};
    use crate::protocol::MessageBody;

    #[test]
    fn test_detect_payload_kind() {
        assert_eq!(detect_payload_kind(b"{}"), PayloadKind::Json);
        assert_eq!(detect_payload_kind(&[0x93, 0x01]), PayloadKind::Binary);
        assert_eq!(detect_payload_kind(b" {}"), PayloadKind::Binary);
        assert_eq!(detect_payload_kind(&[]), PayloadKind::Empty);
    }

    #[test]
    fn test_decode_own_message() {
        let msg = ClusterMessage::broadcast(NodeId::from(9), MessageBody::InitialHeartbeat);
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_drop_foreign_source() {
        let data = br#"{"_source":"_eio","senderId":"0000000000000001","body":{"type":"heartbeat"}}"#;
        assert!(decode(data).is_none());
    }

    #[test]
    fn test_drop_unknown_type() {
        let data =
            br#"{"_source":"_cluster","senderId":"0000000000000001","body":{"type":"gossip"}}"#;
        assert!(decode(data).is_none());
    }

    #[test]
    fn test_drop_garbage() {
        assert!(decode(b"not json").is_none());
        assert!(decode(b"{truncated").is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn test_drop_response_without_request_id() {
        let msg = ClusterMessage::broadcast(
            NodeId::from(1),
            MessageBody::AcquireLockResponse { success: true },
        );
        assert!(decode(&encode(&msg)).is_none());
        assert!(decode(&encode(&msg.with_request(RequestId::from(3)))).is_some());
    }
}
