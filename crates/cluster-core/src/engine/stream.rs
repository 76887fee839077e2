//! Persistent client transports and the upgrade probe exchange.

use crate::packet::{Packet, PacketKind, PacketSink, TransportEvent, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A freshly accepted WebSocket or WebTransport connection.
pub struct StreamTransport {
    pub kind: TransportKind,
    pub sink: Arc<dyn PacketSink>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl StreamTransport {
    pub fn new(
        kind: TransportKind,
        sink: Arc<dyn PacketSink>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            kind,
            sink,
            inbound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("transport closed during probe")]
    Closed,
    #[error("unexpected {0:?} packet during probe")]
    Unexpected(PacketKind),
    #[error("transport error during probe: {0}")]
    Transport(String),
}

/// Run the client-driven probe: every `ping "probe"` is answered with
/// `pong "probe"`, and an `upgrade` packet completes it.
pub async fn probe(transport: &mut StreamTransport, timeout: Duration) -> Result<(), ProbeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, transport.inbound.recv()).await {
            Err(_) => return Err(ProbeError::Timeout),
            Ok(None) => return Err(ProbeError::Closed),
            Ok(Some(event)) => event,
        };

        match event {
            TransportEvent::Packet(packet) if packet.is_ping_probe() => {
                transport.sink.send(vec![Packet::pong_probe()]);
            }
            TransportEvent::Packet(packet) if packet.kind == PacketKind::Upgrade => return Ok(()),
            TransportEvent::Packet(packet) => return Err(ProbeError::Unexpected(packet.kind)),
            TransportEvent::Error(e) => return Err(ProbeError::Transport(e)),
            TransportEvent::Close => return Err(ProbeError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ChannelSink, SinkFrame};

    fn stream() -> (
        StreamTransport,
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<SinkFrame>,
    ) {
        let (sink, frames) = ChannelSink::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamTransport::new(TransportKind::WebSocket, sink, rx), tx, frames)
    }

    #[tokio::test]
    async fn test_probe_succeeds() {
        let (mut transport, tx, mut frames) = stream();
        tx.send(TransportEvent::Packet(Packet::ping_probe())).unwrap();
        tx.send(TransportEvent::Packet(Packet::new(PacketKind::Upgrade))).unwrap();

        assert_eq!(probe(&mut transport, Duration::from_secs(1)).await, Ok(()));
        assert_eq!(
            frames.recv().await,
            Some(SinkFrame::Packets(vec![Packet::pong_probe()]))
        );
    }

    #[tokio::test]
    async fn test_probe_rejects_other_packets() {
        let (mut transport, tx, _frames) = stream();
        tx.send(TransportEvent::Packet(Packet::message("early"))).unwrap();

        assert_eq!(
            probe(&mut transport, Duration::from_secs(1)).await,
            Err(ProbeError::Unexpected(PacketKind::Message))
        );
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let (mut transport, _tx, _frames) = stream();
        assert_eq!(
            probe(&mut transport, Duration::from_millis(20)).await,
            Err(ProbeError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_probe_fails_on_close() {
        let (mut transport, tx, _frames) = stream();
        drop(tx);
        assert_eq!(
            probe(&mut transport, Duration::from_secs(1)).await,
            Err(ProbeError::Closed)
        );
    }
}
