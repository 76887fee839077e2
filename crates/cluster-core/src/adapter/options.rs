//! Broadcast scoping and the application-level packets carried by the
//! aggregation protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub type Room = String;
pub type SocketId = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFlags {
    /// Apply on this node only; nothing is published.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub volatile: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compress: bool,
    /// Ack collection deadline, overriding the configured request timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Which sockets an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOptions {
    #[serde(default)]
    pub rooms: BTreeSet<Room>,
    #[serde(default)]
    pub except: BTreeSet<Room>,
    #[serde(default)]
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    /// Target every socket.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn to_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Room>,
    {
        Self {
            rooms: rooms.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn except<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Room>,
    {
        self.except.extend(rooms.into_iter().map(Into::into));
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    /// Whether a socket with this id and these rooms is targeted.
    ///
    /// A socket is implicitly a member of the room named after its id, so an
    /// `except` entry may name either a room or a socket.
    pub fn matches(&self, socket_id: &str, rooms: &BTreeSet<Room>) -> bool {
        let in_room = |name: &Room| name == socket_id || rooms.contains(name);

        if !self.rooms.is_empty() && !self.rooms.iter().any(in_room) {
            return false;
        }
        !self.except.iter().any(in_room)
    }

    /// Room-level test used when replaying persisted packets: the packet's
    /// scope is met by a session holding `rooms`.
    pub fn admits_rooms(&self, rooms: &BTreeSet<Room>) -> bool {
        let included = self.rooms.is_empty() || self.rooms.iter().any(|r| rooms.contains(r));
        let excluded = self.except.iter().any(|r| rooms.contains(r));
        included && !excluded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastKind {
    #[default]
    Event,
    BinaryEvent,
    Ack,
}

/// Application packet fanned out to sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPacket {
    #[serde(default, rename = "type")]
    pub kind: BroadcastKind,
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    /// Recovery offset assigned by the originating node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

impl BroadcastPacket {
    pub fn event(data: Vec<Value>) -> Self {
        Self {
            kind: BroadcastKind::Event,
            data,
            ack_id: None,
            offset: None,
        }
    }

    /// Only plain events without a per-client ack can be replayed to a
    /// reconnecting client.
    pub fn is_recoverable(&self, flags: &BroadcastFlags) -> bool {
        self.kind == BroadcastKind::Event && self.ack_id.is_none() && !flags.volatile
    }
}

/// A socket as reported by `fetch_sockets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketDetails {
    pub id: SocketId,
    pub rooms: BTreeSet<Room>,
    #[serde(default)]
    pub data: Value,
}
