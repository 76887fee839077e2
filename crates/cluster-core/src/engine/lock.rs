//! Whether an owner may grant another node access to one of its sessions.
//!
//! Nothing is reserved by a grant. The owner evaluates the predicate on
//! every request against the session's current transport state.

use crate::packet::TransportKind;
use serde::{Deserialize, Serialize};

/// Access requested for a long-polling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Serve one pending GET.
    Read,
    /// Accept one POST.
    Write,
}

/// The parts of a session's state that decide lockability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockView {
    pub transport: TransportKind,
    /// A GET is pending (or a forward is armed) on the owner
    pub writable: bool,
    pub upgrading: bool,
    pub upgraded: bool,
}

/// Decide an ACQUIRE_LOCK request.
///
/// - polling read: the session is polling and nothing is being written
/// - polling write: the session is polling
/// - upgrade: the session is polling, not upgrading and not upgraded
pub fn is_lockable(view: &LockView, requested: TransportKind, mode: Option<LockMode>) -> bool {
    match requested {
        TransportKind::Polling => {
            view.transport.is_polling() && (mode == Some(LockMode::Write) || !view.writable)
        }
        TransportKind::WebSocket | TransportKind::WebTransport => {
            view.transport.is_polling() && !view.upgrading && !view.upgraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polling() -> LockView {
        LockView {
            transport: TransportKind::Polling,
            writable: false,
            upgrading: false,
            upgraded: false,
        }
    }

    #[test]
    fn test_read_requires_idle_transport() {
        assert!(is_lockable(&polling(), TransportKind::Polling, Some(LockMode::Read)));

        let busy = LockView {
            writable: true,
            ..polling()
        };
        assert!(!is_lockable(&busy, TransportKind::Polling, Some(LockMode::Read)));
        // Missing mode is a read
        assert!(!is_lockable(&busy, TransportKind::Polling, None));
    }

    #[test]
    fn test_write_only_requires_polling() {
        let busy = LockView {
            writable: true,
            ..polling()
        };
        assert!(is_lockable(&busy, TransportKind::Polling, Some(LockMode::Write)));

        let websocket = LockView {
            transport: TransportKind::WebSocket,
            ..polling()
        };
        assert!(!is_lockable(&websocket, TransportKind::Polling, Some(LockMode::Write)));
    }

    #[test]
    fn test_upgrade_is_granted_once() {
        assert!(is_lockable(&polling(), TransportKind::WebSocket, None));
        assert!(is_lockable(&polling(), TransportKind::WebTransport, None));

        let upgrading = LockView {
            upgrading: true,
            ..polling()
        };
        assert!(!is_lockable(&upgrading, TransportKind::WebSocket, None));

        let upgraded = LockView {
            upgraded: true,
            ..polling()
        };
        assert!(!is_lockable(&upgraded, TransportKind::WebSocket, None));
    }

    #[test]
    fn test_upgrade_allowed_while_poll_pending() {
        let busy = LockView {
            writable: true,
            ..polling()
        };
        assert!(is_lockable(&busy, TransportKind::WebSocket, None));
    }
}
