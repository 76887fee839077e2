//! The per-node room store the cluster adapter fans operations into.

use super::options::{BroadcastOptions, BroadcastPacket, Room, SocketDetails, SocketId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Called once per client acknowledgement of a broadcast.
pub type AckCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Called with the number of clients a broadcast with ack reached on one node.
pub type ClientCountCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Answers a server-side emit. Single-use.
pub type ReplyCallback = Box<dyn FnOnce(Value) + Send>;

/// Receives server-side emits from other nodes.
pub type EmitHandler = Arc<dyn Fn(Vec<Value>, Option<ReplyCallback>) + Send + Sync>;

/// Local room membership and delivery for one namespace.
pub trait LocalAdapter: Send + Sync {
    fn broadcast(&self, packet: &BroadcastPacket, opts: &BroadcastOptions);

    /// Deliver with a per-client ack. Returns how many clients were reached,
    /// each of which may later call `ack` once.
    fn broadcast_with_ack(&self, packet: &BroadcastPacket, opts: &BroadcastOptions, ack: AckCallback) -> usize;

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]);

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]);

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool);

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<SocketDetails>;

    /// An event emitted by another node to the servers themselves, not to
    /// clients.
    fn server_side_emit(&self, args: Vec<Value>, reply: Option<ReplyCallback>);
}

#[derive(Default)]
struct SocketEntry {
    rooms: BTreeSet<Room>,
    data: Value,
    received: Vec<BroadcastPacket>,
    pending_acks: VecDeque<AckCallback>,
}

#[derive(Default)]
struct AdapterState {
    sockets: BTreeMap<SocketId, SocketEntry>,
    next_ack_id: u64,
    disconnected: Vec<(SocketId, bool)>,
    server_side_events: Vec<Vec<Value>>,
}

/// Room store kept entirely in memory. Sockets are registered by hand and
/// record every packet delivered to them.
#[derive(Default)]
pub struct InMemoryAdapter {
    state: Mutex<AdapterState>,
    emit_handler: Mutex<Option<EmitHandler>>,
}

impl InMemoryAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_socket<I, S>(&self, id: impl Into<SocketId>, rooms: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Room>,
    {
        let entry = SocketEntry {
            rooms: rooms.into_iter().map(Into::into).collect(),
            ..SocketEntry::default()
        };
        self.lock().sockets.insert(id.into(), entry);
    }

    pub fn set_data(&self, id: &str, data: Value) -> bool {
        match self.lock().sockets.get_mut(id) {
            Some(entry) => {
                entry.data = data;
                true
            }
            None => false,
        }
    }

    pub fn remove_socket(&self, id: &str) -> bool {
        self.lock().sockets.remove(id).is_some()
    }

    pub fn has_socket(&self, id: &str) -> bool {
        self.lock().sockets.contains_key(id)
    }

    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn rooms_of(&self, id: &str) -> Option<BTreeSet<Room>> {
        self.lock().sockets.get(id).map(|s| s.rooms.clone())
    }

    /// Packets delivered to a socket, oldest first.
    pub fn received(&self, id: &str) -> Vec<BroadcastPacket> {
        self.lock()
            .sockets
            .get(id)
            .map(|s| s.received.clone())
            .unwrap_or_default()
    }

    /// Answer the oldest outstanding ack of a socket.
    pub fn ack(&self, id: &str, value: Value) -> bool {
        let callback = self
            .lock()
            .sockets
            .get_mut(id)
            .and_then(|s| s.pending_acks.pop_front());
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    /// Sockets removed by `disconnect_sockets`, with the `close` flag used.
    pub fn disconnected(&self) -> Vec<(SocketId, bool)> {
        self.lock().disconnected.clone()
    }

    /// Server-side emits received while no handler was installed.
    pub fn server_side_events(&self) -> Vec<Vec<Value>> {
        self.lock().server_side_events.clone()
    }

    pub fn on_server_side_emit(&self, handler: impl Fn(Vec<Value>, Option<ReplyCallback>) + Send + Sync + 'static) {
        *self.emit_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    fn deliver(&self, packet: &BroadcastPacket, opts: &BroadcastOptions, ack: Option<&AckCallback>) -> usize {
        let mut state = self.lock();
        let ack_id = ack.map(|_| {
            state.next_ack_id += 1;
            state.next_ack_id
        });

        let mut reached = 0;
        for (id, entry) in state.sockets.iter_mut() {
            if !opts.matches(id, &entry.rooms) {
                continue;
            }
            let mut delivered = packet.clone();
            if ack_id.is_some() {
                delivered.ack_id = ack_id;
            }
            entry.received.push(delivered);
            if let Some(ack) = ack {
                entry.pending_acks.push_back(Arc::clone(ack));
            }
            reached += 1;
        }
        reached
    }
}

impl LocalAdapter for InMemoryAdapter {
    fn broadcast(&self, packet: &BroadcastPacket, opts: &BroadcastOptions) {
        let reached = self.deliver(packet, opts, None);
        debug!("Delivered broadcast to {} local socket(s)", reached);
    }

    fn broadcast_with_ack(&self, packet: &BroadcastPacket, opts: &BroadcastOptions, ack: AckCallback) -> usize {
        self.deliver(packet, opts, Some(&ack))
    }

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]) {
        let mut state = self.lock();
        for (id, entry) in state.sockets.iter_mut() {
            if opts.matches(id, &entry.rooms) {
                entry.rooms.extend(rooms.iter().cloned());
            }
        }
    }

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]) {
        let mut state = self.lock();
        for (id, entry) in state.sockets.iter_mut() {
            if opts.matches(id, &entry.rooms) {
                for room in rooms {
                    entry.rooms.remove(room);
                }
            }
        }
    }

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool) {
        let mut state = self.lock();
        let targeted: Vec<SocketId> = state
            .sockets
            .iter()
            .filter(|(id, entry)| opts.matches(id, &entry.rooms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in targeted {
            state.sockets.remove(&id);
            state.disconnected.push((id, close));
        }
    }

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<SocketDetails> {
        self.lock()
            .sockets
            .iter()
            .filter(|(id, entry)| opts.matches(id, &entry.rooms))
            .map(|(id, entry)| SocketDetails {
                id: id.clone(),
                rooms: entry.rooms.clone(),
                data: entry.data.clone(),
            })
            .collect()
    }

    fn server_side_emit(&self, args: Vec<Value>, reply: Option<ReplyCallback>) {
        let handler = self
            .emit_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(args, reply),
            None => self.lock().server_side_events.push(args),
        }
    }
}
