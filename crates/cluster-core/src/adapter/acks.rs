//! Callbacks for broadcasts awaiting client acknowledgements.
//!
//! There is no way to know how many peers will report, so an entry is never
//! completed. It is dropped when its timeout fires.

use super::local::{AckCallback, ClientCountCallback};
use crate::node_id::{NodeId, RequestId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::debug;

struct AckRequest {
    on_client_count: ClientCountCallback,
    on_ack: AckCallback,
    counted: HashSet<NodeId>,
}

type Table = Mutex<HashMap<RequestId, AckRequest>>;

#[derive(Default)]
pub(crate) struct AckRegistry {
    requests: Arc<Table>,
}

fn lock(table: &Table) -> MutexGuard<'_, HashMap<RequestId, AckRequest>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

impl AckRegistry {
    /// Keep the callbacks for `timeout`. Must be called inside a tokio runtime.
    pub fn register(
        &self,
        request_id: RequestId,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
        timeout: Duration,
    ) {
        lock(&self.requests).insert(
            request_id,
            AckRequest {
                on_client_count,
                on_ack,
                counted: HashSet::new(),
            },
        );

        let requests: Weak<Table> = Arc::downgrade(&self.requests);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(requests) = requests.upgrade() {
                if lock(&requests).remove(&request_id).is_some() {
                    debug!("Ack request {} expired", request_id);
                }
            }
        });
    }

    /// A peer's client count. Counted once per peer.
    pub fn on_client_count(&self, request_id: RequestId, sender: NodeId, count: usize) -> bool {
        let callback = {
            let mut requests = lock(&self.requests);
            let Some(request) = requests.get_mut(&request_id) else {
                return false;
            };
            if !request.counted.insert(sender) {
                return false;
            }
            Arc::clone(&request.on_client_count)
        };
        callback(count);
        true
    }

    pub fn on_ack(&self, request_id: RequestId, value: Value) -> bool {
        let callback = lock(&self.requests)
            .get(&request_id)
            .map(|r| Arc::clone(&r.on_ack));
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, ClientCountCallback, AckCallback) {
        let clients = Arc::new(AtomicUsize::new(0));
        let acks = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&clients);
        let a = Arc::clone(&acks);
        (
            clients,
            acks,
            Arc::new(move |n: usize| {
                c.fetch_add(n, Ordering::Relaxed);
            }),
            Arc::new(move |_: Value| {
                a.fetch_add(1, Ordering::Relaxed);
            }),
        )
    }

    #[tokio::test]
    async fn test_counts_once_per_peer() {
        let registry = AckRegistry::default();
        let (clients, acks, on_count, on_ack) = counters();
        let id = RequestId::from(1);
        registry.register(id, on_count, on_ack, Duration::from_secs(5));

        assert!(registry.on_client_count(id, NodeId::from(2), 3));
        assert!(!registry.on_client_count(id, NodeId::from(2), 3));
        assert!(registry.on_client_count(id, NodeId::from(3), 1));
        assert!(registry.on_ack(id, json!("a")));
        assert!(registry.on_ack(id, json!("b")));

        assert_eq!(clients.load(Ordering::Relaxed), 4);
        assert_eq!(acks.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let registry = AckRegistry::default();
        let (_clients, acks, on_count, on_ack) = counters();
        let id = RequestId::from(7);
        registry.register(id, on_count, on_ack, Duration::from_millis(20));
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.len(), 0);
        assert!(!registry.on_ack(id, json!(1)));
        assert_eq!(acks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unknown_request_ignored() {
        let registry = AckRegistry::default();
        assert!(!registry.on_client_count(RequestId::from(1), NodeId::from(2), 1));
        assert!(!registry.on_ack(RequestId::from(1), json!(null)));
    }
}
