//! Session ownership and cross-node handoff.
//!
//! A session belongs to the node that handed out its id. Client requests
//! that land elsewhere are served through the owner: a GET or POST on a
//! foreign node first asks the cluster for a lock, then the owner drains its
//! buffered packets to the node holding the GET (or the foreign node forwards
//! the POSTed packets to the owner). An upgrade to a persistent transport
//! either moves the session to the upgrading node (if the application has not
//! seen it yet) or leaves the owner forwarding every write.
//!
//! All state lives behind one mutex that is never held across an await.
//! Sink writes and bus publishes are computed under the lock and carried out
//! after it is released.

pub mod lock;
mod replies;
pub(crate) mod session;
pub mod stream;

use crate::context::NodeContext;
use crate::correlator::{Expectation, RequestCorrelator, Resolution};
use crate::node_id::{NodeId, RequestId, SessionId};
use crate::packet::{Packet, PacketKind, PacketSink, TransportEvent, TransportKind};
use crate::protocol::{ClusterMessage, MessageBody};
use lock::LockMode;
use replies::ReplyCache;
use serde_json::json;
use session::{Flush, LocalSession, RemoteTransport, SessionTransport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use stream::StreamTransport;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the application sees of the sessions owned by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connection { sid: SessionId },
    Packet { sid: SessionId, packet: Packet },
    Upgrade { sid: SessionId },
    Close { sid: SessionId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(SessionId),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("session {0} does not use {1:?}")]
    TransportMismatch(SessionId, TransportKind),

    #[error("upgrade of session {sid} failed: {reason}")]
    UpgradeFailed { sid: SessionId, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Where a polling request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Local,
    Proxied { owner: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The session was already owned here.
    Local,
    /// The session moved to this node.
    TakenOver { previous_owner: NodeId },
    /// The owner keeps the session and forwards its writes here.
    Proxied { owner: NodeId },
}

#[derive(Debug, Clone)]
struct LockReply {
    owner: NodeId,
    success: bool,
}

#[derive(Debug, Clone)]
struct UpgradeReply {
    take_over: bool,
    packets: Vec<Packet>,
}

enum UpgradeDecision {
    Refused,
    HandOver(Vec<Packet>),
    Forward {
        flush: Flush,
        pending_get: Option<Arc<dyn PacketSink>>,
    },
}

struct EngineState {
    sessions: HashMap<SessionId, LocalSession>,
    remote: HashMap<SessionId, RemoteTransport>,
    /// Lock and upgrade answers, replayed when a request is redelivered
    answered: ReplyCache,
}

pub struct ClusterEngine {
    ctx: Arc<NodeContext>,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    locks: RequestCorrelator<LockReply>,
    upgrades: RequestCorrelator<UpgradeReply>,
}

fn open_packet(sid: &SessionId, kind: TransportKind) -> Packet {
    let upgrades: &[&str] = if kind.is_polling() {
        &["websocket", "webtransport"]
    } else {
        &[]
    };
    Packet {
        kind: PacketKind::Open,
        data: Some(json!({ "sid": sid, "upgrades": upgrades }).to_string()),
    }
}

impl ClusterEngine {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = EngineState {
            sessions: HashMap::new(),
            remote: HashMap::new(),
            answered: ReplyCache::new(ctx.config.response_timeout()),
        };
        let engine = Arc::new(Self {
            ctx,
            state: Mutex::new(state),
            events,
            locks: RequestCorrelator::new("engine-lock"),
            upgrades: RequestCorrelator::new("engine-upgrade"),
        });
        (engine, rx)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Engine event receiver dropped");
        }
    }

    fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config.upgrade_timeout_ms)
    }

    fn execute(&self, sid: &SessionId, flush: Flush) {
        match flush {
            Flush::Nothing => {}
            Flush::Local { sink, packets } => sink.send(packets),
            Flush::Forward { to, packets } => {
                debug!("Draining {} packet(s) of {} to {}", packets.len(), sid, to);
                let body = MessageBody::Drain {
                    sid: sid.clone(),
                    packets,
                };
                self.ctx.publish(self.ctx.message(body).to(to));
            }
        }
    }

    // ========================================================================
    // Client-facing operations
    // ========================================================================

    /// Start a long-polling session. The handshake response goes out on
    /// `sink`, but the application only hears about the session once the
    /// delayed connection window has passed.
    pub fn open_polling(self: &Arc<Self>, sink: Arc<dyn PacketSink>) -> SessionId {
        let sid = SessionId::generate();
        let mut session = LocalSession::new(sid.clone(), SessionTransport::polling());
        session.transport.attach_poll(sink);
        session.write_buffer.push(open_packet(&sid, TransportKind::Polling));
        session.delayed = Some(Vec::new());
        let flush = session.flush();

        self.lock().sessions.insert(sid.clone(), session);
        self.execute(&sid, flush);
        self.schedule_connect(&sid);

        info!("Opened polling session {}", sid);
        sid
    }

    /// Start a session directly on a persistent transport. It is announced
    /// to the application immediately.
    pub fn open_stream(self: &Arc<Self>, transport: StreamTransport) -> SessionId {
        let StreamTransport {
            kind,
            sink,
            inbound,
        } = transport;
        let sid = SessionId::generate();
        let mut session = LocalSession::new(sid.clone(), SessionTransport::persistent(kind, sink));
        session.write_buffer.push(open_packet(&sid, kind));
        let flush = session.flush();

        {
            let mut state = self.lock();
            state.sessions.insert(sid.clone(), session);
            self.emit(EngineEvent::Connection { sid: sid.clone() });
        }
        self.execute(&sid, flush);
        self.attach_reader(&sid, inbound);

        info!("Opened {:?} session {}", kind, sid);
        sid
    }

    /// Serve a GET. For a session owned elsewhere, the owner is asked for a
    /// read lock and drains its buffer to `sink`.
    pub async fn poll(self: &Arc<Self>, sid: &SessionId, sink: Arc<dyn PacketSink>) -> Result<PollOutcome> {
        let local = {
            let mut state = self.lock();
            match state.sessions.get_mut(sid) {
                Some(session) if !session.transport.kind().is_polling() => {
                    return Err(EngineError::TransportMismatch(sid.clone(), TransportKind::Polling));
                }
                Some(session) => {
                    session.transport.attach_poll(Arc::clone(&sink));
                    Some(session.flush())
                }
                None => None,
            }
        };
        if let Some(flush) = local {
            self.execute(sid, flush);
            return Ok(PollOutcome::Local);
        }

        if !sid.is_well_formed() {
            return Err(EngineError::InvalidSessionId(sid.clone()));
        }

        // Registered before asking so a DRAIN racing the grant finds it
        {
            let mut state = self.lock();
            if state.remote.contains_key(sid) {
                debug!("GET for {} while another transport is held here", sid);
                return Err(EngineError::UnknownSession(sid.clone()));
            }
            state.remote.insert(
                sid.clone(),
                RemoteTransport {
                    kind: TransportKind::Polling,
                    sink,
                    owner: None,
                    read_task: None,
                },
            );
        }

        match self.acquire_lock(sid, TransportKind::Polling, Some(LockMode::Read)).await {
            Some(owner) => {
                let mut state = self.lock();
                if let Some(remote) = state.remote.get_mut(sid) {
                    if remote.kind.is_polling() && remote.owner.is_none() {
                        remote.owner = Some(owner);
                    }
                }
                debug!("GET for {} proxied to {}", sid, owner);
                Ok(PollOutcome::Proxied { owner })
            }
            None => {
                let mut state = self.lock();
                if state.remote.get(sid).is_some_and(|r| r.owner.is_none()) {
                    state.remote.remove(sid);
                }
                Err(EngineError::UnknownSession(sid.clone()))
            }
        }
    }

    /// Serve a POST. For a session owned elsewhere, the owner is asked for a
    /// write lock and the packets are forwarded to it.
    pub async fn post(&self, sid: &SessionId, packets: Vec<Packet>) -> Result<PollOutcome> {
        let local = self.lock().sessions.get(sid).map(|s| s.transport.kind());
        match local {
            Some(kind) if !kind.is_polling() => {
                Err(EngineError::TransportMismatch(sid.clone(), TransportKind::Polling))
            }
            Some(_) => {
                for packet in packets {
                    self.on_client_packet(sid, packet);
                }
                Ok(PollOutcome::Local)
            }
            None => {
                if !sid.is_well_formed() {
                    return Err(EngineError::InvalidSessionId(sid.clone()));
                }
                let Some(owner) = self
                    .acquire_lock(sid, TransportKind::Polling, Some(LockMode::Write))
                    .await
                else {
                    return Err(EngineError::UnknownSession(sid.clone()));
                };
                debug!("Forwarding {} packet(s) of {} to {}", packets.len(), sid, owner);
                for packet in packets {
                    let body = MessageBody::Packet {
                        sid: sid.clone(),
                        packet,
                    };
                    self.ctx.publish(self.ctx.message(body).to(owner));
                }
                Ok(PollOutcome::Proxied { owner })
            }
        }
    }

    /// Queue packets for a client of a session owned here.
    pub fn send(&self, sid: &SessionId, packets: Vec<Packet>) -> Result<()> {
        let flush = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(sid) else {
                return Err(EngineError::UnknownSession(sid.clone()));
            };
            session.write_buffer.extend(packets);
            session.flush()
        };
        self.execute(sid, flush);
        Ok(())
    }

    /// Close a session owned here. Returns false if there was none.
    pub fn close(&self, sid: &SessionId, reason: &str) -> bool {
        let Some(mut session) = self.lock().sessions.remove(sid) else {
            return false;
        };
        session.abort_tasks();
        session.transport.discard();

        // A session closed inside its delay window still opens first
        if let Some(buffer) = session.delayed.take() {
            self.emit(EngineEvent::Connection { sid: sid.clone() });
            for packet in buffer.into_iter().filter(|p| p.kind != PacketKind::Close) {
                self.emit(EngineEvent::Packet {
                    sid: sid.clone(),
                    packet,
                });
            }
        }

        info!("Closed session {} ({})", session.sid, reason);
        self.emit(EngineEvent::Close {
            sid: sid.clone(),
            reason: reason.to_string(),
        });
        true
    }

    /// Move a client onto a persistent transport.
    pub async fn upgrade(self: &Arc<Self>, sid: &SessionId, transport: StreamTransport) -> Result<UpgradeOutcome> {
        let local = {
            let mut state = self.lock();
            state.sessions.get_mut(sid).map(|session| {
                let lockable = lock::is_lockable(&session.lock_view(), transport.kind, None);
                if lockable {
                    session.upgrading = true;
                }
                lockable
            })
        };

        match local {
            Some(true) => {
                self.start_noop(sid);
                self.upgrade_local(sid, transport).await
            }
            Some(false) => {
                transport.sink.close();
                Err(EngineError::UpgradeFailed {
                    sid: sid.clone(),
                    reason: "session is not upgradable".to_string(),
                })
            }
            None => self.upgrade_remote(sid, transport).await,
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn has_session(&self, sid: &SessionId) -> bool {
        self.lock().sessions.contains_key(sid)
    }

    /// Owned here and already announced to the application.
    pub fn is_connected(&self, sid: &SessionId) -> bool {
        self.lock()
            .sessions
            .get(sid)
            .is_some_and(|s| s.delayed.is_none())
    }

    /// Client transports held here for sessions owned elsewhere.
    pub fn proxied_count(&self) -> usize {
        self.lock().remote.len()
    }

    /// Stop every task and drop every transport without notifying anyone.
    pub(crate) fn shutdown(&self) {
        let mut state = self.lock();
        for session in state.sessions.values_mut() {
            session.abort_tasks();
            session.transport.discard();
        }
        state.sessions.clear();
        for (_, remote) in state.remote.drain() {
            remote.sink.close();
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn schedule_connect(self: &Arc<Self>, sid: &SessionId) {
        let engine = Arc::downgrade(self);
        let delay = Duration::from_millis(self.ctx.config.delayed_connection_timeout_ms);
        let task_sid = sid.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.do_connect(&task_sid);
            }
        });

        let mut state = self.lock();
        match state.sessions.get_mut(sid) {
            Some(session) if session.delayed.is_some() => session.delay_task = Some(task),
            _ => task.abort(),
        }
    }

    /// End the delay window: announce the session and replay what the
    /// client sent meanwhile.
    fn do_connect(&self, sid: &SessionId) {
        let closed = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(sid) else {
                return;
            };
            let Some(buffer) = session.delayed.take() else {
                return;
            };
            if let Some(task) = session.delay_task.take() {
                task.abort();
            }

            self.emit(EngineEvent::Connection { sid: sid.clone() });
            let mut closed = false;
            for packet in buffer {
                if packet.kind == PacketKind::Close {
                    closed = true;
                    break;
                }
                self.emit(EngineEvent::Packet {
                    sid: sid.clone(),
                    packet,
                });
            }
            if session.upgraded {
                self.emit(EngineEvent::Upgrade { sid: sid.clone() });
            }
            closed
        };

        debug!("Session {} connected", sid);
        if closed {
            self.close(sid, "client close");
        }
    }

    fn on_client_packet(&self, sid: &SessionId, packet: Packet) {
        let close = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(sid) else {
                debug!("Dropping packet for unknown session {}", sid);
                return;
            };
            if let Some(buffer) = session.delayed.as_mut() {
                buffer.push(packet);
                return;
            }
            if packet.kind == PacketKind::Close {
                true
            } else {
                self.emit(EngineEvent::Packet {
                    sid: sid.clone(),
                    packet,
                });
                false
            }
        };

        if close {
            self.close(sid, "client close");
        }
    }

    /// Keep a pending GET from timing out while an upgrade is in flight.
    fn start_noop(self: &Arc<Self>, sid: &SessionId) {
        let engine = Arc::downgrade(self);
        let period = Duration::from_millis(self.ctx.config.noop_upgrade_interval_ms);
        let task_sid = sid.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if !engine.write_noop(&task_sid) {
                    break;
                }
            }
        });

        let mut state = self.lock();
        match state.sessions.get_mut(sid) {
            Some(session) if session.upgrading => {
                session.stop_noop();
                session.noop_task = Some(task);
            }
            _ => task.abort(),
        }
    }

    /// Returns false once the session is gone or no longer upgrading.
    fn write_noop(&self, sid: &SessionId) -> bool {
        let flush = {
            let mut state = self.lock();
            let Some(session) = state.sessions.get_mut(sid) else {
                return false;
            };
            if !session.upgrading {
                return false;
            }
            if !session.transport.writable() {
                return true;
            }
            session.write_buffer.push(Packet::noop());
            session.flush()
        };
        self.execute(sid, flush);
        true
    }

    fn attach_reader(self: &Arc<Self>, sid: &SessionId, inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        let task = self.spawn_local_reader(sid.clone(), inbound);
        let mut state = self.lock();
        match state.sessions.get_mut(sid) {
            Some(session) => session.read_task = Some(task),
            None => task.abort(),
        }
    }

    fn spawn_local_reader(
        self: &Arc<Self>,
        sid: SessionId,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                let event = inbound.recv().await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                match event {
                    Some(TransportEvent::Packet(packet)) => engine.on_client_packet(&sid, packet),
                    Some(TransportEvent::Error(e)) => break format!("transport error: {}", e),
                    Some(TransportEvent::Close) | None => break "transport close".to_string(),
                }
            };
            if let Some(engine) = engine.upgrade() {
                engine.close(&sid, &reason);
            }
        })
    }

    /// Relay a proxied transport's inbound packets to the owner.
    fn spawn_proxy_reader(
        self: &Arc<Self>,
        sid: SessionId,
        owner: NodeId,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                let event = inbound.recv().await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                match event {
                    Some(TransportEvent::Packet(packet)) => {
                        let body = MessageBody::Packet {
                            sid: sid.clone(),
                            packet,
                        };
                        engine.ctx.publish(engine.ctx.message(body).to(owner));
                    }
                    Some(TransportEvent::Error(e)) => break format!("transport error: {}", e),
                    Some(TransportEvent::Close) | None => break "transport close".to_string(),
                }
            };
            let Some(engine) = engine.upgrade() else {
                return;
            };
            debug!("Proxied transport of {} closed: {}", sid, reason);
            let body = MessageBody::SessionClose {
                sid: sid.clone(),
                reason,
            };
            engine.ctx.publish(engine.ctx.message(body).to(owner));

            let mut state = engine.lock();
            if state.remote.get(&sid).is_some_and(|r| !r.kind.is_polling()) {
                state.remote.remove(&sid);
            }
        })
    }

    // ========================================================================
    // Requesting side
    // ========================================================================

    /// Ask the cluster for access to a session owned elsewhere. Only the
    /// owner answers; silence until the response timeout means no owner.
    async fn acquire_lock(
        &self,
        sid: &SessionId,
        transport: TransportKind,
        mode: Option<LockMode>,
    ) -> Option<NodeId> {
        let peers = self.ctx.live_peers();
        if peers.is_empty() {
            debug!("No peers to ask about session {}", sid);
            return None;
        }

        let request_id = RequestId::generate();
        let pending = self.locks.issue(
            request_id,
            Expectation::First(peers),
            self.ctx.config.response_timeout(),
        );
        let body = MessageBody::AcquireLock {
            sid: sid.clone(),
            transport,
            mode,
        };
        self.ctx.publish(self.ctx.message(body).with_request(request_id));

        match pending.wait().await {
            Resolution::Complete(replies) => match replies.into_iter().next() {
                Some(LockReply { owner, success: true }) => Some(owner),
                Some(LockReply { owner, .. }) => {
                    debug!("Lock on {} refused by {}", sid, owner);
                    None
                }
                None => None,
            },
            Resolution::TimedOut { .. } => {
                debug!("No owner answered for session {}", sid);
                None
            }
        }
    }

    async fn upgrade_local(self: &Arc<Self>, sid: &SessionId, mut transport: StreamTransport) -> Result<UpgradeOutcome> {
        let probed = stream::probe(&mut transport, self.upgrade_timeout()).await;
        let StreamTransport {
            kind,
            sink,
            inbound,
        } = transport;

        let outcome = {
            let mut state = self.lock();
            match state.sessions.get_mut(sid) {
                None => Err(EngineError::UnknownSession(sid.clone())),
                Some(session) => {
                    session.stop_noop();
                    session.upgrading = false;
                    match probed {
                        Err(e) => Err(EngineError::UpgradeFailed {
                            sid: sid.clone(),
                            reason: e.to_string(),
                        }),
                        Ok(()) => {
                            session.upgraded = true;
                            let mut previous = std::mem::replace(
                                &mut session.transport,
                                SessionTransport::persistent(kind, Arc::clone(&sink)),
                            );
                            let pending_get = previous.release();
                            let flush = session.flush();
                            if session.delayed.is_none() {
                                self.emit(EngineEvent::Upgrade { sid: sid.clone() });
                            }
                            Ok((flush, pending_get))
                        }
                    }
                }
            }
        };

        match outcome {
            Ok((flush, pending_get)) => {
                if let Some(get) = pending_get {
                    get.send(vec![Packet::noop()]);
                }
                self.execute(sid, flush);
                self.attach_reader(sid, inbound);
                info!("Session {} upgraded to {:?}", sid, kind);
                Ok(UpgradeOutcome::Local)
            }
            Err(e) => {
                warn!("{}", e);
                sink.close();
                Err(e)
            }
        }
    }

    async fn upgrade_remote(self: &Arc<Self>, sid: &SessionId, mut transport: StreamTransport) -> Result<UpgradeOutcome> {
        if !sid.is_well_formed() {
            transport.sink.close();
            return Err(EngineError::InvalidSessionId(sid.clone()));
        }

        let Some(owner) = self.acquire_lock(sid, transport.kind, None).await else {
            transport.sink.close();
            return Err(EngineError::UnknownSession(sid.clone()));
        };

        if let Err(e) = stream::probe(&mut transport, self.upgrade_timeout()).await {
            warn!("Upgrade probe for {} failed: {}", sid, e);
            // Lets the owner clear its upgrading flag
            let body = MessageBody::Upgrade {
                sid: sid.clone(),
                success: false,
            };
            self.ctx
                .publish(self.ctx.message(body).to(owner).with_request(RequestId::generate()));
            transport.sink.close();
            return Err(EngineError::UpgradeFailed {
                sid: sid.clone(),
                reason: e.to_string(),
            });
        }

        let StreamTransport {
            kind,
            sink,
            inbound,
        } = transport;
        self.lock().remote.insert(
            sid.clone(),
            RemoteTransport {
                kind,
                sink: Arc::clone(&sink),
                owner: Some(owner),
                read_task: None,
            },
        );

        let request_id = RequestId::generate();
        let pending = self.upgrades.issue(
            request_id,
            Expectation::First(HashSet::from([owner])),
            self.ctx.config.response_timeout(),
        );
        let body = MessageBody::Upgrade {
            sid: sid.clone(),
            success: true,
        };
        self.ctx
            .publish(self.ctx.message(body).to(owner).with_request(request_id));

        let reply = match pending.wait().await {
            Resolution::Complete(replies) => replies.into_iter().next(),
            Resolution::TimedOut { .. } => None,
        };
        let Some(reply) = reply else {
            self.lock().remote.remove(sid);
            sink.close();
            return Err(EngineError::UpgradeFailed {
                sid: sid.clone(),
                reason: format!("no upgrade response from {}", owner),
            });
        };

        if reply.take_over {
            let mut session = LocalSession::new(sid.clone(), SessionTransport::persistent(kind, sink));
            session.upgraded = true;
            {
                let mut state = self.lock();
                state.remote.remove(sid);
                state.sessions.insert(sid.clone(), session);
                self.emit(EngineEvent::Connection { sid: sid.clone() });
                self.emit(EngineEvent::Upgrade { sid: sid.clone() });
            }
            for packet in reply.packets {
                self.on_client_packet(sid, packet);
            }
            self.attach_reader(sid, inbound);
            info!("Took over session {} from {}", sid, owner);
            Ok(UpgradeOutcome::TakenOver {
                previous_owner: owner,
            })
        } else {
            let task = self.spawn_proxy_reader(sid.clone(), owner, inbound);
            let mut state = self.lock();
            match state.remote.get_mut(sid) {
                Some(remote) => remote.read_task = Some(task),
                None => task.abort(),
            }
            info!("Session {} upgraded here, owned by {}", sid, owner);
            Ok(UpgradeOutcome::Proxied { owner })
        }
    }

    // ========================================================================
    // Owner side
    // ========================================================================

    pub(crate) fn on_message(self: &Arc<Self>, message: ClusterMessage) {
        let sender = message.sender_id;
        let request_id = message.request_id;
        match message.body {
            MessageBody::AcquireLock {
                sid,
                transport,
                mode,
            } => self.on_acquire_lock(sender, request_id, &sid, transport, mode),
            MessageBody::AcquireLockResponse { success } => {
                if let Some(id) = request_id {
                    self.locks.on_response(id, sender, [LockReply { owner: sender, success }]);
                }
            }
            MessageBody::Drain { sid, packets } => self.on_drain(sender, &sid, packets),
            MessageBody::Packet { sid, packet } => self.on_client_packet(&sid, packet),
            MessageBody::Upgrade { sid, success } => self.on_upgrade(sender, request_id, &sid, success),
            MessageBody::UpgradeResponse { take_over, packets } => {
                if let Some(id) = request_id {
                    self.upgrades
                        .on_response(id, sender, [UpgradeReply { take_over, packets }]);
                }
            }
            MessageBody::SessionClose { sid, reason } => {
                self.do_connect(&sid);
                self.close(&sid, &reason);
            }
            other => debug!("Engine ignoring {}", other.kind()),
        }
    }

    fn on_acquire_lock(
        self: &Arc<Self>,
        sender: NodeId,
        request_id: Option<RequestId>,
        sid: &SessionId,
        transport: TransportKind,
        mode: Option<LockMode>,
    ) {
        let Some(request_id) = request_id else {
            return;
        };

        let (success, flush, upgrading) = {
            let mut state = self.lock();
            if let Some(body) = state.answered.get(sender, request_id) {
                drop(state);
                debug!("Repeated lock request {} from {}, answering again", request_id, sender);
                self.ctx
                    .publish(self.ctx.message(body).to(sender).with_request(request_id));
                return;
            }
            let Some(session) = state.sessions.get_mut(sid) else {
                return;
            };
            let success = lock::is_lockable(&session.lock_view(), transport, mode);
            let mut flush = Flush::Nothing;
            let mut upgrading = false;
            if success {
                if !transport.is_polling() {
                    session.upgrading = true;
                    upgrading = true;
                } else if mode != Some(LockMode::Write) {
                    session.transport.forward_once(sender);
                    flush = session.flush();
                }
            }
            let body = MessageBody::AcquireLockResponse { success };
            state.answered.insert(sender, request_id, body);
            (success, flush, upgrading)
        };

        debug!(
            "Lock on {} for {:?} {:?} from {}: {}",
            sid, transport, mode, sender, success
        );
        let body = MessageBody::AcquireLockResponse { success };
        self.ctx
            .publish(self.ctx.message(body).to(sender).with_request(request_id));

        // The grant goes out before any drain it enables
        self.execute(sid, flush);
        if upgrading {
            self.start_noop(sid);
        }
    }

    fn on_drain(&self, sender: NodeId, sid: &SessionId, packets: Vec<Packet>) {
        let sink = {
            let mut state = self.lock();
            let Some(remote) = state.remote.get(sid) else {
                debug!("Drain for {} with no transport here", sid);
                return;
            };
            if remote.owner.is_some_and(|owner| owner != sender) {
                warn!("Drain for {} from {}, which does not own it", sid, sender);
                return;
            }
            if remote.kind.is_polling() {
                state.remote.remove(sid).map(|r| Arc::clone(&r.sink))
            } else {
                Some(Arc::clone(&remote.sink))
            }
        };
        if let Some(sink) = sink {
            sink.send(packets);
        }
    }

    fn on_upgrade(self: &Arc<Self>, sender: NodeId, request_id: Option<RequestId>, sid: &SessionId, success: bool) {
        let Some(request_id) = request_id else {
            debug!("Upgrade for {} without a request id", sid);
            return;
        };
        let (decision, body) = {
            let mut state = self.lock();
            if let Some(body) = state.answered.get(sender, request_id) {
                drop(state);
                debug!("Repeated upgrade {} from {}, answering again", request_id, sender);
                self.ctx
                    .publish(self.ctx.message(body).to(sender).with_request(request_id));
                return;
            }
            let delayed = match state.sessions.get_mut(sid) {
                Some(session) if session.upgrading => {
                    session.stop_noop();
                    session.upgrading = false;
                    session.delayed.is_some()
                }
                Some(_) => {
                    debug!("Upgrade for {} from {} without a granted lock", sid, sender);
                    return;
                }
                None => {
                    debug!("Upgrade for {} which is not owned here", sid);
                    return;
                }
            };

            let decision = if !success {
                UpgradeDecision::Refused
            } else if delayed {
                match state.sessions.remove(sid) {
                    Some(mut session) => {
                        let packets = session.delayed.take().unwrap_or_default();
                        session.abort_tasks();
                        session.transport.discard();
                        UpgradeDecision::HandOver(packets)
                    }
                    None => UpgradeDecision::Refused,
                }
            } else {
                match state.sessions.get_mut(sid) {
                    Some(session) => {
                        session.upgraded = true;
                        let pending_get = session.transport.forward(sender);
                        UpgradeDecision::Forward {
                            flush: session.flush(),
                            pending_get,
                        }
                    }
                    None => UpgradeDecision::Refused,
                }
            };
            let body = match &decision {
                UpgradeDecision::HandOver(packets) => MessageBody::UpgradeResponse {
                    take_over: true,
                    packets: packets.clone(),
                },
                _ => MessageBody::UpgradeResponse {
                    take_over: false,
                    packets: Vec::new(),
                },
            };
            state.answered.insert(sender, request_id, body.clone());
            (decision, body)
        };

        if let UpgradeDecision::HandOver(packets) = &decision {
            info!(
                "Handing session {} over to {} with {} buffered packet(s)",
                sid,
                sender,
                packets.len()
            );
        }
        self.ctx
            .publish(self.ctx.message(body).to(sender).with_request(request_id));

        if let UpgradeDecision::Forward { flush, pending_get } = decision {
            if let Some(get) = pending_get {
                get.send(vec![Packet::noop()]);
            }
            self.execute(sid, flush);
            self.emit(EngineEvent::Upgrade { sid: sid.clone() });
            info!("Session {} now forwards to {}", sid, sender);
        }
    }

    /// Forget a node that left: pending requests stop waiting on it and the
    /// transports proxied to it are closed.
    pub(crate) fn on_node_down(&self, node: NodeId) {
        self.locks.on_node_down(node);
        self.upgrades.on_node_down(node);
        let orphaned: Vec<RemoteTransport> = {
            let mut state = self.lock();
            let sids: Vec<SessionId> = state
                .remote
                .iter()
                .filter(|(_, r)| r.owner == Some(node))
                .map(|(sid, _)| sid.clone())
                .collect();
            sids.iter().filter_map(|sid| state.remote.remove(sid)).collect()
        };
        for remote in orphaned {
            remote.sink.close();
        }
    }
}
