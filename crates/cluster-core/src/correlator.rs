//! Request/response correlation for cluster-wide requests.
//!
//! A request is registered with an expectation of who must answer, then
//! resolves exactly once: when the expectation is met, or when its deadline
//! passes (with whatever arrived so far). Responses for unknown request ids
//! and repeated responses from the same sender are ignored, which makes
//! at-least-once delivery harmless.

use crate::node_id::{NodeId, RequestId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("timeout reached: missing {missing} of {expected} responses")]
    Timeout { missing: usize, expected: usize },
}

/// Who a request is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// A fixed number of responses, snapshotted when the request is issued.
    Count(usize),
    /// One response from each of these peers. Peers that go down are
    /// dropped from the set.
    Peers(HashSet<NodeId>),
    /// The first response from any of these peers. Peers that go down are
    /// dropped from the set; an empty set resolves with nothing.
    First(HashSet<NodeId>),
}

impl Expectation {
    fn remaining(&self) -> usize {
        match self {
            Expectation::Count(n) => *n,
            Expectation::Peers(set) | Expectation::First(set) => set.len(),
        }
    }

    fn is_satisfied(&self) -> bool {
        self.remaining() == 0
    }

    fn record_response(&mut self, sender: NodeId) {
        match self {
            Expectation::Count(n) => *n = n.saturating_sub(1),
            Expectation::Peers(set) => {
                set.remove(&sender);
            }
            Expectation::First(set) => set.clear(),
        }
    }

    fn node_down(&mut self, node: NodeId) -> bool {
        match self {
            Expectation::Count(_) => false,
            Expectation::Peers(set) | Expectation::First(set) => set.remove(&node),
        }
    }
}

/// Final outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Complete(Vec<T>),
    /// The deadline passed first. `responses` holds what did arrive.
    TimedOut {
        responses: Vec<T>,
        missing: usize,
        expected: usize,
    },
}

impl<T> Resolution<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Resolution::Complete(_))
    }

    /// Discard partial results on timeout.
    pub fn into_result(self) -> Result<Vec<T>, RequestError> {
        match self {
            Resolution::Complete(responses) => Ok(responses),
            Resolution::TimedOut {
                missing, expected, ..
            } => Err(RequestError::Timeout { missing, expected }),
        }
    }

    /// Keep partial results alongside the timeout error.
    pub fn into_parts(self) -> (Vec<T>, Option<RequestError>) {
        match self {
            Resolution::Complete(responses) => (responses, None),
            Resolution::TimedOut {
                responses,
                missing,
                expected,
            } => (responses, Some(RequestError::Timeout { missing, expected })),
        }
    }
}

struct Pending<T> {
    expectation: Expectation,
    expected: usize,
    responders: HashSet<NodeId>,
    responses: Vec<T>,
    tx: oneshot::Sender<Vec<T>>,
}

type Table<T> = Arc<Mutex<HashMap<RequestId, Pending<T>>>>;

/// Registry of in-flight requests whose responses carry values of type `T`.
pub struct RequestCorrelator<T> {
    name: &'static str,
    pending: Table<T>,
}

impl<T: Send + 'static> RequestCorrelator<T> {
    /// `name` labels log lines for this registry.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a request. The returned handle must be kept (and awaited)
    /// for the request to stay registered.
    pub fn issue(
        &self,
        request_id: RequestId,
        expectation: Expectation,
        timeout: Duration,
    ) -> PendingResponse<T> {
        let (tx, rx) = oneshot::channel();
        let expected = expectation.remaining();

        if expectation.is_satisfied() {
            let _ = tx.send(Vec::new());
        } else {
            let mut table = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if table.contains_key(&request_id) {
                warn!("{}: request id {} already in flight, replacing", self.name, request_id);
            }
            table.insert(
                request_id,
                Pending {
                    expectation,
                    expected,
                    responders: HashSet::new(),
                    responses: Vec::new(),
                    tx,
                },
            );
        }

        PendingResponse {
            name: self.name,
            request_id,
            deadline: Instant::now() + timeout,
            rx,
            table: Arc::clone(&self.pending),
        }
    }

    /// Feed one sender's response. Returns false if it was ignored (unknown
    /// or already resolved request, or a repeat from the same sender).
    pub fn on_response(
        &self,
        request_id: RequestId,
        sender: NodeId,
        values: impl IntoIterator<Item = T>,
    ) -> bool {
        let mut table = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pending) = table.get_mut(&request_id) else {
            debug!("{}: ignoring response to unknown request {}", self.name, request_id);
            return false;
        };

        if !pending.responders.insert(sender) {
            debug!(
                "{}: ignoring repeated response from {} to request {}",
                self.name, sender, request_id
            );
            return false;
        }

        pending.expectation.record_response(sender);
        pending.responses.extend(values);

        if pending.expectation.is_satisfied() {
            if let Some(done) = table.remove(&request_id) {
                let _ = done.tx.send(done.responses);
            }
        }
        true
    }

    /// Stop waiting for a departed node. Returns how many requests this
    /// completed.
    pub fn on_node_down(&self, node: NodeId) -> usize {
        let mut table = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let completed: Vec<RequestId> = table
            .iter_mut()
            .filter_map(|(id, pending)| {
                let changed = pending.expectation.node_down(node);
                (changed && pending.expectation.is_satisfied()).then_some(*id)
            })
            .collect();

        for id in &completed {
            if let Some(done) = table.remove(id) {
                debug!("{}: request {} completed by departure of {}", self.name, id, node);
                let _ = done.tx.send(done.responses);
            }
        }
        completed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Handle to an in-flight request. Dropping it unregisters the request.
pub struct PendingResponse<T> {
    name: &'static str,
    request_id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<Vec<T>>,
    table: Table<T>,
}

impl<T> PendingResponse<T> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for completion or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Resolution<T> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(responses)) => Resolution::Complete(responses),
            Ok(Err(_)) | Err(_) => self.expire(),
        }
    }

    fn expire(&mut self) -> Resolution<T> {
        let removed = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request_id);

        match removed {
            Some(pending) => {
                let missing = pending.expectation.remaining();
                warn!(
                    "{}: request {} timed out, missing {} of {} responses",
                    self.name, self.request_id, missing, pending.expected
                );
                Resolution::TimedOut {
                    responses: pending.responses,
                    missing,
                    expected: pending.expected,
                }
            }
            // Completed between the deadline firing and taking the lock
            None => match self.rx.try_recv() {
                Ok(responses) => Resolution::Complete(responses),
                Err(_) => Resolution::TimedOut {
                    responses: Vec::new(),
                    missing: 0,
                    expected: 0,
                },
            },
        }
    }
}

impl<T> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: &[u64]) -> HashSet<NodeId> {
        ids.iter().map(|&id| NodeId::from(id)).collect()
    }

    const LONG: Duration = Duration::from_secs(5);

    // ==================== Count-based ====================

    #[tokio::test]
    async fn test_count_resolves_after_n_responses() {
        let c = RequestCorrelator::<u32>::new("test");
        let id = RequestId::from(1);
        let pending = c.issue(id, Expectation::Count(2), LONG);

        assert!(c.on_response(id, NodeId::from(2), [10]));
        assert_eq!(c.pending_count(), 1);
        assert!(c.on_response(id, NodeId::from(3), [20, 21]));
        assert_eq!(c.pending_count(), 0);

        assert_eq!(pending.wait().await, Resolution::Complete(vec![10, 20, 21]));
    }

    #[tokio::test]
    async fn test_count_ignores_node_down() {
        let c = RequestCorrelator::<u32>::new("test");
        let id = RequestId::from(1);
        let pending = c.issue(id, Expectation::Count(2), Duration::from_millis(50));

        c.on_response(id, NodeId::from(2), [1]);
        assert_eq!(c.on_node_down(NodeId::from(3)), 0);

        let resolution = pending.wait().await;
        assert_eq!(
            resolution,
            Resolution::TimedOut {
                responses: vec![1],
                missing: 1,
                expected: 2
            }
        );
    }

    #[tokio::test]
    async fn test_zero_expectation_resolves_immediately() {
        let c = RequestCorrelator::<u32>::new("test");
        let pending = c.issue(RequestId::from(1), Expectation::Count(0), LONG);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(pending.wait().await, Resolution::Complete(vec![]));
    }

    // ==================== Membership-based ====================

    #[tokio::test]
    async fn test_peers_shrink_on_response_and_departure() {
        let c = RequestCorrelator::<&'static str>::new("test");
        let id = RequestId::from(7);
        let pending = c.issue(id, Expectation::Peers(peers(&[2, 3, 4])), LONG);

        c.on_response(id, NodeId::from(2), ["a"]);
        assert_eq!(c.on_node_down(NodeId::from(3)), 0);
        assert_eq!(c.on_node_down(NodeId::from(4)), 1);

        assert_eq!(pending.wait().await, Resolution::Complete(vec!["a"]));
    }

    #[tokio::test]
    async fn test_first_resolves_on_first_response() {
        let c = RequestCorrelator::<bool>::new("test");
        let id = RequestId::from(3);
        let pending = c.issue(id, Expectation::First(peers(&[2, 3])), LONG);

        assert!(c.on_response(id, NodeId::from(3), [true]));
        // Late reply from the other peer is stale
        assert!(!c.on_response(id, NodeId::from(2), [false]));

        assert_eq!(pending.wait().await, Resolution::Complete(vec![true]));
    }

    #[tokio::test]
    async fn test_first_with_everyone_gone_resolves_empty() {
        let c = RequestCorrelator::<bool>::new("test");
        let id = RequestId::from(3);
        let pending = c.issue(id, Expectation::First(peers(&[2])), LONG);

        assert_eq!(c.on_node_down(NodeId::from(2)), 1);
        assert_eq!(pending.wait().await, Resolution::Complete(vec![]));
    }

    // ==================== Idempotency and timeouts ====================

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let c = RequestCorrelator::<u32>::new("test");
        let id = RequestId::from(1);
        let pending = c.issue(id, Expectation::Peers(peers(&[2, 3])), LONG);

        assert!(c.on_response(id, NodeId::from(2), [1]));
        assert!(!c.on_response(id, NodeId::from(2), [1]));
        assert_eq!(c.pending_count(), 1);
        assert!(c.on_response(id, NodeId::from(3), [2]));
        // Redelivery after resolution is a no-op
        assert!(!c.on_response(id, NodeId::from(3), [2]));

        assert_eq!(pending.wait().await, Resolution::Complete(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_unknown_request_is_ignored() {
        let c = RequestCorrelator::<u32>::new("test");
        assert!(!c.on_response(RequestId::from(99), NodeId::from(2), [1]));
    }

    #[tokio::test]
    async fn test_timeout_reports_shortfall_and_unregisters() {
        let c = RequestCorrelator::<u32>::new("test");
        let id = RequestId::from(5);
        let pending = c.issue(id, Expectation::Peers(peers(&[2, 3, 4])), Duration::from_millis(30));
        c.on_response(id, NodeId::from(2), [1]);

        let err = pending.wait().await.into_result().unwrap_err();
        assert_eq!(err, RequestError::Timeout { missing: 2, expected: 3 });
        assert_eq!(err.to_string(), "timeout reached: missing 2 of 3 responses");
        assert_eq!(c.pending_count(), 0);

        // A reply after the deadline finds nothing to resolve
        assert!(!c.on_response(id, NodeId::from(3), [2]));
    }

    #[tokio::test]
    async fn test_into_parts_keeps_partial_results() {
        let c = RequestCorrelator::<u32>::new("test");
        let id = RequestId::from(5);
        let pending = c.issue(id, Expectation::Count(2), Duration::from_millis(20));
        c.on_response(id, NodeId::from(2), [42]);

        let (responses, err) = pending.wait().await.into_parts();
        assert_eq!(responses, vec![42]);
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let c = RequestCorrelator::<u32>::new("test");
        let pending = c.issue(RequestId::from(1), Expectation::Count(1), LONG);
        assert_eq!(c.pending_count(), 1);
        drop(pending);
        assert_eq!(c.pending_count(), 0);
    }
}
