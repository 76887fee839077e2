//! Connection-state recovery.
//!
//! Keeps a log of recent broadcast packets and the state of recently
//! disconnected sockets, so a client reconnecting within
//! `max_disconnection_duration_ms` gets back its rooms, its data and every
//! packet it missed after the last offset it saw.

use crate::adapter::options::{BroadcastOptions, BroadcastPacket, Room, SocketId};
use crate::config::RecoveryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Offset of a persisted packet. Later packets compare greater.
pub type Offset = String;

/// Private session id handed to the client for reconnection.
pub type PrivateSessionId = String;

/// Generate a fresh private session id.
pub fn generate_private_id() -> PrivateSessionId {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Offsets
// ============================================================================

// ASCII-ordered, so fixed-width encodings sort like the numbers they encode
const OFFSET_ALPHABET: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_WIDTH: usize = 8;
const SEQ_WIDTH: usize = 4;

fn encode_fixed(mut value: u64, width: usize, out: &mut String) {
    let mut digits = vec![b'-'; width];
    for slot in digits.iter_mut().rev() {
        *slot = OFFSET_ALPHABET[(value % 64) as usize];
        value /= 64;
    }
    out.extend(digits.into_iter().map(char::from));
}

/// Produces short offsets that increase both in time and lexicographically,
/// even for several packets within one millisecond or a clock step back.
#[derive(Debug, Default)]
pub struct OffsetGenerator {
    last_ms: u64,
    seq: u64,
}

impl OffsetGenerator {
    pub fn next(&mut self, now_ms: u64) -> Offset {
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.seq = 0;
        } else {
            self.seq += 1;
            if self.seq >= 64u64.pow(SEQ_WIDTH as u32) {
                self.last_ms += 1;
                self.seq = 0;
            }
        }

        let mut offset = String::with_capacity(TIME_WIDTH + SEQ_WIDTH);
        encode_fixed(self.last_ms, TIME_WIDTH, &mut offset);
        encode_fixed(self.seq, SEQ_WIDTH, &mut offset);
        offset
    }
}

// ============================================================================
// Store
// ============================================================================

/// Socket state captured at disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToPersist {
    pub sid: SocketId,
    pub pid: PrivateSessionId,
    pub rooms: BTreeSet<Room>,
    #[serde(default)]
    pub data: Value,
}

/// A session handed back to a reconnecting client.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredSession {
    pub sid: SocketId,
    pub pid: PrivateSessionId,
    pub rooms: BTreeSet<Room>,
    pub data: Value,
    /// Packets emitted after the client's offset, oldest first.
    pub missed_packets: Vec<BroadcastPacket>,
}

#[derive(Debug, Clone)]
struct PersistedSession {
    session: SessionToPersist,
    disconnected_at: u64,
}

#[derive(Debug, Clone)]
struct PersistedPacket {
    id: Offset,
    packet: BroadcastPacket,
    opts: BroadcastOptions,
    emitted_at: u64,
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<PrivateSessionId, PersistedSession>,
    packets: VecDeque<PersistedPacket>,
    offsets: OffsetGenerator,
}

/// In-memory recovery store. All methods take the current time so the
/// store itself never reads the clock.
pub struct RecoveryStore {
    max_age_ms: u64,
    state: Mutex<StoreState>,
}

impl RecoveryStore {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            max_age_ms: config.max_disconnection_duration_ms,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log an outgoing packet under a new offset.
    pub fn append(&self, packet: &BroadcastPacket, opts: &BroadcastOptions, now_ms: u64) -> Offset {
        let mut state = self.lock();
        let id = state.offsets.next(now_ms);
        let mut packet = packet.clone();
        packet.offset = Some(id.clone());
        state.packets.push_back(PersistedPacket {
            id: id.clone(),
            packet,
            opts: opts.clone(),
            emitted_at: now_ms,
        });
        id
    }

    /// Log a packet that already carries an offset from its origin node.
    /// Redelivered packets are stored once.
    pub fn record(&self, packet: &BroadcastPacket, opts: &BroadcastOptions, now_ms: u64) {
        let Some(id) = packet.offset.clone() else {
            return;
        };
        let mut state = self.lock();
        if state.packets.iter().rev().any(|p| p.id == id) {
            return;
        }
        state.packets.push_back(PersistedPacket {
            id,
            packet: packet.clone(),
            opts: opts.clone(),
            emitted_at: now_ms,
        });
    }

    pub fn persist_session(&self, session: SessionToPersist, now_ms: u64) {
        debug!("Persisting session {} (sid: {})", session.pid, session.sid);
        self.lock().sessions.insert(
            session.pid.clone(),
            PersistedSession {
                session,
                disconnected_at: now_ms,
            },
        );
    }

    /// Restore a session and collect the packets it missed after `offset`.
    ///
    /// Returns `None` when the session is unknown or expired, or when the
    /// offset is no longer retained. A restored session is consumed.
    pub fn restore_session(
        &self,
        pid: &str,
        offset: &str,
        now_ms: u64,
    ) -> Option<RestoredSession> {
        let mut state = self.lock();

        let persisted = state.sessions.get(pid)?;
        if now_ms.saturating_sub(persisted.disconnected_at) > self.max_age_ms {
            debug!("Session {} expired before restore", pid);
            state.sessions.remove(pid);
            return None;
        }

        let Some(index) = state.packets.iter().position(|p| p.id == offset) else {
            debug!("Offset {} for session {} is no longer retained", offset, pid);
            return None;
        };

        let rooms = &persisted.session.rooms;
        let missed_packets = state
            .packets
            .iter()
            .skip(index + 1)
            .filter(|p| p.opts.admits_rooms(rooms))
            .map(|p| p.packet.clone())
            .collect();

        let persisted = state.sessions.remove(pid)?;
        let SessionToPersist {
            sid,
            pid,
            rooms,
            data,
        } = persisted.session;

        Some(RestoredSession {
            sid,
            pid,
            rooms,
            data,
            missed_packets,
        })
    }

    /// Evict expired sessions and packets. Returns (sessions, packets) evicted.
    pub fn sweep(&self, now_ms: u64) -> (usize, usize) {
        let max_age = self.max_age_ms;
        let mut state = self.lock();

        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, s| now_ms.saturating_sub(s.disconnected_at) <= max_age);
        let sessions = before - state.sessions.len();

        let mut packets = 0;
        while state
            .packets
            .front()
            .is_some_and(|p| now_ms.saturating_sub(p.emitted_at) > max_age)
        {
            state.packets.pop_front();
            packets += 1;
        }

        if sessions > 0 || packets > 0 {
            debug!("Recovery sweep evicted {} session(s), {} packet(s)", sessions, packets);
        }
        (sessions, packets)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn packet_count(&self) -> usize {
        self.lock().packets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> RecoveryStore {
        RecoveryStore::new(&RecoveryConfig {
            max_disconnection_duration_ms: 1_000,
            sweep_interval_ms: 60_000,
        })
    }

    fn session(rooms: &[&str]) -> SessionToPersist {
        SessionToPersist {
            sid: "socket-1".into(),
            pid: "pid-1".into(),
            rooms: rooms.iter().map(|r| r.to_string()).collect(),
            data: json!({"user": "ada"}),
        }
    }

    // ==================== Offsets ====================

    #[test]
    fn test_offsets_increase_lexicographically() {
        let mut generator = OffsetGenerator::default();
        let mut previous = generator.next(1_700_000_000_000);
        for now in [1_700_000_000_000, 1_700_000_000_000, 1_700_000_000_001, 1_700_000_000_500] {
            let next = generator.next(now);
            assert!(next > previous, "{next} should sort after {previous}");
            assert_eq!(next.len(), 12);
            previous = next;
        }
    }

    #[test]
    fn test_offsets_survive_clock_step_back() {
        let mut generator = OffsetGenerator::default();
        let first = generator.next(5_000);
        let second = generator.next(4_000);
        assert!(second > first);
    }

    // ==================== Restore ====================

    #[test]
    fn test_restore_returns_packets_after_offset() {
        let store = store();
        let opts = BroadcastOptions::all();
        let offsets: Vec<Offset> = (1..=5)
            .map(|i| store.append(&BroadcastPacket::event(vec![json!(i)]), &opts, 100 + i))
            .collect();

        store.persist_session(session(&[]), 200);
        let restored = store.restore_session("pid-1", &offsets[1], 300).unwrap();

        let data: Vec<_> = restored.missed_packets.iter().map(|p| p.data[0].clone()).collect();
        assert_eq!(data, vec![json!(3), json!(4), json!(5)]);
        assert_eq!(restored.missed_packets[0].offset.as_deref(), Some(offsets[2].as_str()));
        assert_eq!(restored.sid, "socket-1");
        assert_eq!(restored.data, json!({"user": "ada"}));

        // Consumed by the restore
        assert!(store.restore_session("pid-1", &offsets[1], 300).is_none());
    }

    #[test]
    fn test_restore_filters_by_rooms() {
        let store = store();
        let first = store.append(&BroadcastPacket::event(vec![json!("start")]), &BroadcastOptions::all(), 100);
        store.append(&BroadcastPacket::event(vec![json!("a")]), &BroadcastOptions::to_rooms(["a"]), 101);
        store.append(&BroadcastPacket::event(vec![json!("b")]), &BroadcastOptions::to_rooms(["b"]), 102);
        store.append(
            &BroadcastPacket::event(vec![json!("not-a")]),
            &BroadcastOptions::all().except(["a"]),
            103,
        );
        store.append(&BroadcastPacket::event(vec![json!("all")]), &BroadcastOptions::all(), 104);

        store.persist_session(session(&["a"]), 200);
        let restored = store.restore_session("pid-1", &first, 300).unwrap();
        let data: Vec<_> = restored.missed_packets.iter().map(|p| p.data[0].clone()).collect();
        assert_eq!(data, vec![json!("a"), json!("all")]);
    }

    #[test]
    fn test_restore_after_ttl_fails_and_forgets() {
        let store = store();
        let offset = store.append(&BroadcastPacket::event(vec![]), &BroadcastOptions::all(), 100);
        store.persist_session(session(&[]), 200);

        assert!(store.restore_session("pid-1", &offset, 1_201).is_none());
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_restore_with_unknown_offset_fails() {
        let store = store();
        store.persist_session(session(&[]), 200);
        assert!(store.restore_session("pid-1", "AAAAAAAA----", 300).is_none());
        // The session is kept for a retry with a valid offset
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_restore_unknown_session_fails() {
        let store = store();
        assert!(store.restore_session("nobody", "x", 0).is_none());
    }

    #[test]
    fn test_record_keeps_origin_offset_once() {
        let store = store();
        let mut packet = BroadcastPacket::event(vec![json!(1)]);
        packet.offset = Some("0000000-0000".into());

        store.record(&packet, &BroadcastOptions::all(), 100);
        store.record(&packet, &BroadcastOptions::all(), 100);
        store.record(&BroadcastPacket::event(vec![]), &BroadcastOptions::all(), 100);
        assert_eq!(store.packet_count(), 1);
    }

    // ==================== Sweep ====================

    #[test]
    fn test_sweep_evicts_expired_entries() {
        let store = store();
        store.append(&BroadcastPacket::event(vec![]), &BroadcastOptions::all(), 0);
        store.append(&BroadcastPacket::event(vec![]), &BroadcastOptions::all(), 900);
        store.persist_session(session(&[]), 100);

        assert_eq!(store.sweep(1_000), (0, 0));
        assert_eq!(store.sweep(1_050), (0, 1));
        assert_eq!(store.sweep(1_101), (1, 0));
        assert_eq!(store.packet_count(), 1);
    }
}
