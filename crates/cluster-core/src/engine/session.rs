//! Per-session transport state on the owning node.

use super::lock::LockView;
use crate::node_id::{NodeId, SessionId};
use crate::packet::{Packet, PacketSink, TransportKind};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Where the next flush of the write buffer goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStrategy {
    /// The client's own transport on this node.
    Local,
    /// One DRAIN to the node holding the client's pending GET, then back
    /// to `Local`.
    ForwardOnce(NodeId),
    /// Every flush becomes a DRAIN to the node holding the client's
    /// upgraded transport.
    Forward(NodeId),
}

/// Work produced by a flush, carried out after the engine lock is released.
pub(crate) enum Flush {
    Nothing,
    Local {
        sink: Arc<dyn PacketSink>,
        packets: Vec<Packet>,
    },
    Forward {
        to: NodeId,
        packets: Vec<Packet>,
    },
}

pub(crate) struct SessionTransport {
    kind: TransportKind,
    writable: bool,
    sink: Option<Arc<dyn PacketSink>>,
    strategy: SendStrategy,
}

impl SessionTransport {
    /// Long-polling transport with no GET pending.
    pub fn polling() -> Self {
        Self {
            kind: TransportKind::Polling,
            writable: false,
            sink: None,
            strategy: SendStrategy::Local,
        }
    }

    /// Persistent transport, writable until closed.
    pub fn persistent(kind: TransportKind, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            kind,
            writable: true,
            sink: Some(sink),
            strategy: SendStrategy::Local,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    #[cfg(test)]
    pub fn strategy(&self) -> SendStrategy {
        self.strategy
    }

    /// A GET arrived on this node.
    pub fn attach_poll(&mut self, sink: Arc<dyn PacketSink>) {
        self.sink = Some(sink);
        self.writable = true;
    }

    /// Route the next flush to `node`, which holds the client's GET.
    pub fn forward_once(&mut self, node: NodeId) {
        self.strategy = SendStrategy::ForwardOnce(node);
        self.writable = true;
    }

    /// Route every flush to `node`. Returns a local GET left pending, which
    /// the caller should release.
    pub fn forward(&mut self, node: NodeId) -> Option<Arc<dyn PacketSink>> {
        self.strategy = SendStrategy::Forward(node);
        self.writable = true;
        self.sink.take()
    }

    /// Take the buffered packets if the transport can accept them now.
    pub fn flush(&mut self, buffer: &mut Vec<Packet>) -> Flush {
        if !self.writable || buffer.is_empty() {
            return Flush::Nothing;
        }

        match self.strategy {
            SendStrategy::Local => {
                let sink = if self.kind.is_polling() {
                    self.sink.take()
                } else {
                    self.sink.clone()
                };
                let Some(sink) = sink else {
                    return Flush::Nothing;
                };
                if self.kind.is_polling() {
                    self.writable = false;
                }
                Flush::Local {
                    sink,
                    packets: std::mem::take(buffer),
                }
            }
            SendStrategy::ForwardOnce(to) => {
                self.strategy = SendStrategy::Local;
                self.writable = false;
                Flush::Forward {
                    to,
                    packets: std::mem::take(buffer),
                }
            }
            SendStrategy::Forward(to) => Flush::Forward {
                to,
                packets: std::mem::take(buffer),
            },
        }
    }

    /// Give up a pending GET, leaving the transport unwritable.
    pub fn release(&mut self) -> Option<Arc<dyn PacketSink>> {
        self.writable = false;
        self.sink.take()
    }

    /// Drop the transport without telling the application.
    pub fn discard(&mut self) {
        self.writable = false;
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
    }
}

/// A session owned by this node.
pub(crate) struct LocalSession {
    pub sid: SessionId,
    pub transport: SessionTransport,
    pub write_buffer: Vec<Packet>,
    pub upgrading: bool,
    pub upgraded: bool,
    /// Inbound packets held back while the connection is still hidden from
    /// the application
    pub delayed: Option<Vec<Packet>>,
    pub noop_task: Option<JoinHandle<()>>,
    pub delay_task: Option<JoinHandle<()>>,
    pub read_task: Option<JoinHandle<()>>,
}

impl LocalSession {
    pub fn new(sid: SessionId, transport: SessionTransport) -> Self {
        Self {
            sid,
            transport,
            write_buffer: Vec::new(),
            upgrading: false,
            upgraded: false,
            delayed: None,
            noop_task: None,
            delay_task: None,
            read_task: None,
        }
    }

    pub fn lock_view(&self) -> LockView {
        LockView {
            transport: self.transport.kind(),
            writable: self.transport.writable(),
            upgrading: self.upgrading,
            upgraded: self.upgraded,
        }
    }

    pub fn flush(&mut self) -> Flush {
        self.transport.flush(&mut self.write_buffer)
    }

    pub fn stop_noop(&mut self) {
        if let Some(task) = self.noop_task.take() {
            task.abort();
        }
    }

    pub fn abort_tasks(&mut self) {
        self.stop_noop();
        for task in [self.delay_task.take(), self.read_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Client transport held by this node on behalf of another node's session.
pub(crate) struct RemoteTransport {
    pub kind: TransportKind,
    pub sink: Arc<dyn PacketSink>,
    /// Unknown until the owner grants the lock
    pub owner: Option<NodeId>,
    pub read_task: Option<JoinHandle<()>>,
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ChannelSink, SinkFrame};

    #[test]
    fn test_polling_flush_consumes_the_get() {
        let (sink, mut rx) = ChannelSink::channel();
        let mut transport = SessionTransport::polling();
        let mut buffer = vec![Packet::message("a")];

        // Nothing pending: stays buffered
        assert!(matches!(transport.flush(&mut buffer), Flush::Nothing));
        assert_eq!(buffer.len(), 1);

        transport.attach_poll(sink);
        match transport.flush(&mut buffer) {
            Flush::Local { sink, packets } => sink.send(packets),
            _ => panic!("expected local flush"),
        }
        assert!(buffer.is_empty());
        assert!(!transport.writable());
        assert_eq!(
            rx.try_recv().unwrap(),
            SinkFrame::Packets(vec![Packet::message("a")])
        );

        buffer.push(Packet::message("b"));
        assert!(matches!(transport.flush(&mut buffer), Flush::Nothing));
    }

    #[test]
    fn test_forward_once_restores_local_strategy() {
        let mut transport = SessionTransport::polling();
        let node = NodeId::from(2);
        transport.forward_once(node);

        // An empty buffer keeps the forward armed
        let mut buffer = Vec::new();
        assert!(matches!(transport.flush(&mut buffer), Flush::Nothing));
        assert_eq!(transport.strategy(), SendStrategy::ForwardOnce(node));

        buffer.push(Packet::message("x"));
        match transport.flush(&mut buffer) {
            Flush::Forward { to, packets } => {
                assert_eq!(to, node);
                assert_eq!(packets, vec![Packet::message("x")]);
            }
            _ => panic!("expected forward"),
        }
        assert_eq!(transport.strategy(), SendStrategy::Local);
        assert!(!transport.writable());
    }

    #[test]
    fn test_forward_is_permanent() {
        let mut transport = SessionTransport::polling();
        let node = NodeId::from(3);
        assert!(transport.forward(node).is_none());

        for i in 0..3 {
            let mut buffer = vec![Packet::message(i.to_string())];
            assert!(matches!(transport.flush(&mut buffer), Flush::Forward { to, .. } if to == node));
        }
        assert!(transport.writable());
    }

    #[test]
    fn test_forward_releases_pending_get() {
        let (sink, _rx) = ChannelSink::channel();
        let mut transport = SessionTransport::polling();
        transport.attach_poll(sink);
        assert!(transport.forward(NodeId::from(3)).is_some());
    }

    #[test]
    fn test_persistent_transport_stays_writable() {
        let (sink, mut rx) = ChannelSink::channel();
        let mut transport = SessionTransport::persistent(TransportKind::WebSocket, sink);
        for i in 0..2 {
            let mut buffer = vec![Packet::message(i.to_string())];
            if let Flush::Local { sink, packets } = transport.flush(&mut buffer) {
                sink.send(packets);
            }
        }
        assert!(transport.writable());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_lock_view_reflects_state() {
        let mut session = LocalSession::new(SessionId::generate(), SessionTransport::polling());
        session.upgrading = true;
        let view = session.lock_view();
        assert_eq!(view.transport, TransportKind::Polling);
        assert!(view.upgrading);
        assert!(!view.writable);
    }
}
