//! Engine-level packets and the local transport contract.
//!
//! Byte-level packet encoding belongs to the transports. Here a packet is
//! just a kind plus an optional text payload.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PacketKind {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: PacketKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

const PROBE: &str = "probe";

impl Packet {
    pub fn new(kind: PacketKind) -> Self {
        Self { kind, data: None }
    }

    pub fn message(data: impl Into<String>) -> Self {
        Self {
            kind: PacketKind::Message,
            data: Some(data.into()),
        }
    }

    pub fn noop() -> Self {
        Self::new(PacketKind::Noop)
    }

    pub fn ping_probe() -> Self {
        Self {
            kind: PacketKind::Ping,
            data: Some(PROBE.to_string()),
        }
    }

    pub fn pong_probe() -> Self {
        Self {
            kind: PacketKind::Pong,
            data: Some(PROBE.to_string()),
        }
    }

    pub fn is_ping_probe(&self) -> bool {
        self.kind == PacketKind::Ping && self.data.as_deref() == Some(PROBE)
    }
}

/// Transport types a session can be served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Polling,
    WebSocket,
    WebTransport,
}

impl TransportKind {
    pub fn is_polling(self) -> bool {
        self == TransportKind::Polling
    }
}

/// Write side of a client transport.
///
/// For long-polling this is a single pending GET response, so the engine
/// drops it after one `send`. Persistent transports keep it.
pub trait PacketSink: Send + Sync {
    fn send(&self, packets: Vec<Packet>);

    /// Tear the transport down without notifying the application.
    fn close(&self) {}
}

/// Read side of a client transport, delivered over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Packet(Packet),
    Error(String),
    Close,
}

/// Output of a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFrame {
    Packets(Vec<Packet>),
    Closed,
}

/// `PacketSink` that forwards every write to an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkFrame>,
}

impl ChannelSink {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<SinkFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PacketSink for ChannelSink {
    fn send(&self, packets: Vec<Packet>) {
        let _ = self.tx.send(SinkFrame::Packets(packets));
    }

    fn close(&self) {
        let _ = self.tx.send(SinkFrame::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_json_shape() {
        let json = serde_json::to_string(&Packet::message("hi")).unwrap();
        assert_eq!(json, r#"{"type":"message","data":"hi"}"#);

        let json = serde_json::to_string(&Packet::noop()).unwrap();
        assert_eq!(json, r#"{"type":"noop"}"#);
    }

    #[test]
    fn test_probe_detection() {
        assert!(Packet::ping_probe().is_ping_probe());
        assert!(!Packet::pong_probe().is_ping_probe());
        assert!(!Packet::new(PacketKind::Ping).is_ping_probe());
    }

    #[test]
    fn test_transport_kind_names() {
        let json = serde_json::to_string(&TransportKind::WebSocket).unwrap();
        assert_eq!(json, "\"websocket\"");
        assert!(TransportKind::Polling.is_polling());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_writes() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.send(vec![Packet::message("a")]);
        sink.close();

        assert_eq!(
            rx.recv().await,
            Some(SinkFrame::Packets(vec![Packet::message("a")]))
        );
        assert_eq!(rx.recv().await, Some(SinkFrame::Closed));
    }
}
