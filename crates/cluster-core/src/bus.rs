//! Message bus abstraction.
//!
//! The bus delivers every published payload to every other node,
//! at-least-once, with no ordering guarantee across senders. Routing buses
//! may use the recipient hint to deliver unicast messages to one node only.
//!
//! Implementations:
//! - `InMemoryBus`: a single-process hub used by tests and demos
//! - `cluster-hub`'s `WsBus`: a WebSocket client for the relay hub

use crate::node_id::NodeId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus disconnected")]
    Disconnected,

    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Publishing side of the bus. Inbound payloads arrive on a channel handed
/// out together with the publisher.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to the other nodes.
    async fn publish(&self, payload: Vec<u8>, recipient: Option<NodeId>) -> Result<()>;
}

/// One node's attachment to a bus.
pub struct BusEndpoint {
    pub publisher: Arc<dyn MessageBus>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct Member {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: bool,
}

/// In-process bus connecting any number of endpoints.
///
/// Test hooks simulate a crashed node (`disconnect`) and at-least-once
/// redelivery (`set_duplicate_delivery`).
#[derive(Default)]
pub struct InMemoryBus {
    members: Mutex<Vec<Member>>,
    duplicate: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new endpoint. Returns its member index and the endpoint.
    pub fn connect(self: &Arc<Self>) -> (usize, BusEndpoint) {
        let (tx, inbound) = mpsc::unbounded_channel();
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        let member = members.len();
        members.push(Member {
            tx,
            connected: true,
        });

        let publisher = Arc::new(InMemoryPublisher {
            bus: Arc::clone(self),
            member,
        });
        (member, BusEndpoint { publisher, inbound })
    }

    /// Cut a member off: it neither sends nor receives from now on.
    pub fn disconnect(&self, member: usize) {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(m) = members.get_mut(member) {
            m.connected = false;
        }
    }

    /// Deliver every payload twice.
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.duplicate.store(on, Ordering::Relaxed);
    }

    fn deliver(&self, from: usize, payload: Vec<u8>) -> Result<()> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if !members.get(from).is_some_and(|m| m.connected) {
            return Err(BusError::Disconnected);
        }

        let copies = if self.duplicate.load(Ordering::Relaxed) { 2 } else { 1 };
        for (index, member) in members.iter().enumerate() {
            if index == from || !member.connected {
                continue;
            }
            for _ in 0..copies {
                if member.tx.send(payload.clone()).is_err() {
                    debug!("Bus member {} dropped its receiver", index);
                }
            }
        }
        Ok(())
    }
}

struct InMemoryPublisher {
    bus: Arc<InMemoryBus>,
    member: usize,
}

#[async_trait]
impl MessageBus for InMemoryPublisher {
    async fn publish(&self, payload: Vec<u8>, _recipient: Option<NodeId>) -> Result<()> {
        self.bus.deliver(self.member, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_to_everyone_but_sender() {
        let bus = InMemoryBus::new();
        let (_, mut a) = bus.connect();
        let (_, mut b) = bus.connect();
        let (_, mut c) = bus.connect();

        a.publisher.publish(b"hello".to_vec(), None).await.unwrap();

        assert_eq!(b.inbound.recv().await.unwrap(), b"hello");
        assert_eq!(c.inbound.recv().await.unwrap(), b"hello");
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_preserves_per_sender_order() {
        let bus = InMemoryBus::new();
        let (_, a) = bus.connect();
        let (_, mut b) = bus.connect();

        for i in 0..10u8 {
            a.publisher.publish(vec![i], None).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.inbound.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_disconnected_member_is_silent() {
        let bus = InMemoryBus::new();
        let (a_index, mut a) = bus.connect();
        let (_, b) = bus.connect();

        bus.disconnect(a_index);

        assert!(matches!(
            a.publisher.publish(b"x".to_vec(), None).await,
            Err(BusError::Disconnected)
        ));
        b.publisher.publish(b"y".to_vec(), None).await.unwrap();
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let bus = InMemoryBus::new();
        let (_, a) = bus.connect();
        let (_, mut b) = bus.connect();

        bus.set_duplicate_delivery(true);
        a.publisher.publish(b"once".to_vec(), None).await.unwrap();

        assert_eq!(b.inbound.recv().await.unwrap(), b"once");
        assert_eq!(b.inbound.recv().await.unwrap(), b"once");
    }
}
