//! Message sessions, one TCP connection per peer.
//!
//! `SessionHub` owns the session table: it dials, registers accepted
//! connections, settles duplicate connections to the same peer, and closes
//! everything on shutdown. Sessions never reconnect on their own.

pub mod connection;
pub mod initiator;
pub mod listener;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use bonjou_core::frame::FrameError;
use bonjou_core::{Message, NodeId, NodeIdentity, WireError};
use bonjou_services::Peer;

pub use connection::{MessageSession, PendingSession};

/// Upper bound on a graceful close before queued frames are dropped.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: SocketAddr, reason: String },

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("sequence violation: got {got} after {last}")]
    SequenceViolation { last: u64, got: u64 },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("session closed")]
    Closed,
}

/// What every session on this node is opened with.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<NodeIdentity>,
    /// Our TCP listen port, advertised in PRESENCE.
    pub listen_port: u16,
    pub max_frame_len: usize,
}

/// Delivered on a session's inbox in arrival order. `Closed` comes last.
#[derive(Debug)]
pub enum SessionEvent {
    Message(Message),
    Closed { reason: String },
}

/// Reported to the node once per admitted connection.
#[derive(Debug)]
pub struct OpenedSession {
    pub session: MessageSession,
    /// Bounded. While it is full the session stops reading its socket.
    pub inbox: mpsc::Receiver<SessionEvent>,
}

/// At most one open session per peer.
pub type SessionTable = Arc<DashMap<NodeId, MessageSession>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

pub struct SessionHub {
    ctx: SessionContext,
    table: SessionTable,
    opened: mpsc::UnboundedSender<OpenedSession>,
    next_serial: AtomicU64,
    register_lock: Mutex<()>,
    refusing: AtomicBool,
}

impl SessionHub {
    pub fn new(ctx: SessionContext, opened: mpsc::UnboundedSender<OpenedSession>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            table: new_session_table(),
            opened,
            next_serial: AtomicU64::new(1),
            register_lock: Mutex::new(()),
            refusing: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// The open session with `peer`, if any.
    pub fn get(&self, peer: &NodeId) -> Option<MessageSession> {
        self.table
            .get(peer)
            .map(|s| s.value().clone())
            .filter(|s| s.is_open())
    }

    pub fn list(&self) -> Vec<MessageSession> {
        self.table.iter().map(|s| s.value().clone()).collect()
    }

    /// Reuse the open session with `peer` or dial a new one.
    pub async fn connect(&self, peer: &Peer) -> Result<MessageSession, SessionError> {
        if let Some(session) = self.get(&peer.id) {
            return Ok(session);
        }
        let pending = initiator::dial(peer.address, &self.ctx).await?;
        if pending.peer != peer.id {
            tracing::warn!(
                expected = %peer.id.short(),
                answered = %pending.peer.short(),
                addr = %peer.address,
                "a different node answered at this address"
            );
        }
        self.register(pending).await
    }

    /// Admit a handshaken connection.
    ///
    /// If an open session with the same peer exists, both ends keep the
    /// connection dialed by the node with the lower id, so simultaneous
    /// dials settle on the same socket.
    pub async fn register(&self, pending: PendingSession) -> Result<MessageSession, SessionError> {
        let _guard = self.register_lock.lock().await;

        if self.refusing.load(Ordering::SeqCst) {
            tracing::debug!(peer = %pending.peer.short(), "refusing session, hub is closing");
            pending.reject().await;
            return Err(SessionError::Closed);
        }

        if let Some(existing) = self.get(&pending.peer) {
            if self.keep_existing(&existing, &pending) {
                tracing::debug!(
                    peer = %pending.peer.short(),
                    serial = existing.serial,
                    "duplicate connection, keeping existing session"
                );
                pending.reject().await;
                return Ok(existing);
            }
            tracing::debug!(
                peer = %pending.peer.short(),
                serial = existing.serial,
                "duplicate connection, replacing existing session"
            );
            existing.close(CLOSE_GRACE).await;
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (session, inbox) = pending.activate(serial, &self.ctx, self.table.clone());
        let _ = self.opened.send(OpenedSession {
            session: session.clone(),
            inbox,
        });
        Ok(session)
    }

    fn keep_existing(&self, existing: &MessageSession, pending: &PendingSession) -> bool {
        let local = self.ctx.identity.id;
        let dialer = |initiated_locally: bool| if initiated_locally { local } else { pending.peer };
        let existing_dialer = dialer(existing.initiated_locally);
        let pending_dialer = dialer(pending.initiated_locally);
        existing_dialer == pending_dialer || existing_dialer < pending_dialer
    }

    /// Gracefully close the session with `peer`. Returns false if none was open.
    pub async fn disconnect(&self, peer: &NodeId) -> bool {
        match self.get(peer) {
            Some(session) => {
                session.close(CLOSE_GRACE).await;
                true
            }
            None => false,
        }
    }

    /// Refuse new sessions, then close every open one, flushing queued
    /// frames first.
    pub async fn close_all(&self) {
        self.refusing.store(true, Ordering::SeqCst);
        // Waits out a registration that passed the check before the flag was set.
        drop(self.register_lock.lock().await);
        let sessions = self.list();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "closing sessions");
        futures::future::join_all(sessions.iter().map(|s| s.close(CLOSE_GRACE))).await;
    }
}
