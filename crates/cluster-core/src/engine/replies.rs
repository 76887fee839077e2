//! Answers the owner already sent, kept so a redelivered request gets the
//! same answer instead of being decided again.

use crate::node_id::{NodeId, RequestId};
use crate::protocol::MessageBody;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

struct Answered {
    body: MessageBody,
    at: Instant,
}

pub(crate) struct ReplyCache {
    ttl: Duration,
    entries: HashMap<(NodeId, RequestId), Answered>,
}

impl ReplyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// The answer already given to this request, if still remembered.
    pub fn get(&mut self, sender: NodeId, request_id: RequestId) -> Option<MessageBody> {
        self.evict(Instant::now());
        self.entries.get(&(sender, request_id)).map(|a| a.body.clone())
    }

    pub fn insert(&mut self, sender: NodeId, request_id: RequestId, body: MessageBody) {
        let now = Instant::now();
        self.evict(now);
        self.entries.insert((sender, request_id), Answered { body, at: now });
    }

    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, a| now.duration_since(a.at) <= ttl);
    }
}
