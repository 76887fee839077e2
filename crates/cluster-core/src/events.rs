//! Membership events for monitoring.
//!
//! `EventBus` delivers `ClusterEvent`s to callbacks registered with
//! `subscribe`. Dropping the returned `Subscription` unsubscribes.

use crate::node_id::NodeId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Why a node was removed from the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// No message within `heartbeatTimeout`.
    Timeout,
    /// The node announced its own departure.
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClusterEvent {
    /// First message seen from a node.
    NodeJoined {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    NodeLeft {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        reason: LeaveReason,
        timestamp: u64,
    },
}

type Callback = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// Unsubscribes from its `EventBus` when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(ClusterEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    pub fn emit(&self, event: ClusterEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn joined(id: u64) -> ClusterEvent {
        ClusterEvent::NodeJoined {
            node_id: NodeId::from(id),
            timestamp: 1000,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |event| sink.lock().unwrap().push(event));

        bus.emit(joined(1));
        assert_eq!(*seen.lock().unwrap(), vec![joined(1)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = Arc::clone(&count);
            let _sub = bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(joined(1));
        }
        bus.emit(joined(2));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_only_dropped_subscriber_stops() {
        let bus = Arc::new(EventBus::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        let sub1 = bus.subscribe(move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        });
        let s = Arc::clone(&second);
        let _sub2 = bus.subscribe(move |_| {
            s.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(joined(1));
        drop(sub1);
        bus.emit(joined(2));

        assert_eq!(first.load(Ordering::Relaxed), 1);
        assert_eq!(second.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = ClusterEvent::NodeLeft {
            node_id: NodeId::from(0xab),
            reason: LeaveReason::Timeout,
            timestamp: 5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"nodeLeft\""));
        assert!(json.contains("\"nodeId\":\"00000000000000ab\""));
        assert!(json.contains("\"reason\":\"timeout\""));
    }
}
