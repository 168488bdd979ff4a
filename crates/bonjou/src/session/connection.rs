//! One TCP connection to a peer.
//!
//! A session is established by exchanging PRESENCE messages, then split
//! into a writer task (fed by a bounded queue, stamps sequence numbers)
//! and a reader task (feeds `receive` into the session's bounded inbox).
//! `MessageSession` is a cheap cloneable handle onto both.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite};

use bonjou_core::frame::{FrameCodec, FrameError};
use bonjou_core::identity::clamp_display_name;
use bonjou_core::message::encode_control;
use bonjou_core::{Message, MessageKind, NodeId, Presence};

use super::{SessionContext, SessionError, SessionEvent, SessionTable};

/// How long each side waits for the other's PRESENCE.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per session before `send` starts waiting.
const OUTBOUND_QUEUE: usize = 16;

/// Messages buffered per session before the reader stops reading the socket.
pub const INBOX_QUEUE: usize = 32;

/// How long a closing session keeps reading so the peer sees a clean close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequence number of the PRESENCE message that opens every session.
const PRESENCE_SEQ: u64 = 1;

type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

enum Outbound {
    Message { kind: MessageKind, payload: Bytes },
    /// Flush everything queued before this, then shut down the write side.
    Close,
}

/// A connection that has completed the PRESENCE exchange but is not yet
/// reading or writing.
pub struct PendingSession {
    pub peer: NodeId,
    pub peer_name: String,
    /// Remote IP with the peer's advertised listen port.
    pub peer_addr: SocketAddr,
    pub initiated_locally: bool,
    reader: FrameReader,
    writer: FrameWriter,
}

/// Exchange PRESENCE over a freshly connected or accepted stream.
pub async fn handshake(
    stream: TcpStream,
    ctx: &SessionContext,
    initiated_locally: bool,
) -> Result<PendingSession, SessionError> {
    let remote = stream
        .peer_addr()
        .map_err(|e| SessionError::Handshake(format!("no peer address: {e}")))?;
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let codec = FrameCodec::new(ctx.max_frame_len);
    let mut reader = FramedRead::new(reader, codec);
    let mut writer = FramedWrite::new(writer, codec);

    let presence = Presence {
        display_name: ctx.identity.display_name.clone(),
        listen_port: ctx.listen_port,
    };
    let hello = Message::with_control(MessageKind::Presence, ctx.identity.id, PRESENCE_SEQ, &presence)?;
    writer.send(hello.to_bytes()).await?;

    // Bytes after PRESENCE stay buffered in `reader` for the session.
    let body = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
        .await
        .map_err(|_| SessionError::Handshake("timed out waiting for presence".into()))?
        .ok_or_else(|| SessionError::Handshake("peer closed before presence".into()))??;

    let msg = Message::from_bytes(&body)?;
    if msg.kind != MessageKind::Presence || msg.seq != PRESENCE_SEQ {
        return Err(SessionError::Handshake(format!(
            "expected presence seq {PRESENCE_SEQ}, got {:?} seq {}",
            msg.kind, msg.seq
        )));
    }
    if msg.sender_id == ctx.identity.id {
        return Err(SessionError::Handshake("connected to ourselves".into()));
    }
    let theirs: Presence = msg.control()?;
    if theirs.listen_port == 0 {
        return Err(SessionError::Handshake("peer advertised port 0".into()));
    }

    tracing::debug!(
        peer = %msg.sender_id.short(),
        name = %theirs.display_name,
        %remote,
        initiated_locally,
        "presence exchanged"
    );

    Ok(PendingSession {
        peer: msg.sender_id,
        peer_name: clamp_display_name(&theirs.display_name),
        peer_addr: SocketAddr::new(remote.ip(), theirs.listen_port),
        initiated_locally,
        reader,
        writer,
    })
}

impl PendingSession {
    /// Drop a connection that lost the duplicate-session tie break,
    /// or arrived while the node was stopping.
    pub async fn reject(mut self) {
        let _ = self.writer.close().await;
    }

    /// Insert into `table` and start the reader and writer tasks. The
    /// returned inbox receives everything the peer sends, then `Closed`.
    pub fn activate(
        self,
        serial: u64,
        ctx: &SessionContext,
        table: SessionTable,
    ) -> (MessageSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_QUEUE);
        let (state, _) = watch::channel(false);
        let state = Arc::new(state);
        let (finished, _) = watch::channel(false);
        let finished = Arc::new(finished);

        let writer_task = tokio::spawn(writer_loop(self.writer, rx, ctx.identity.id, state.clone()));

        let session = MessageSession {
            peer: self.peer,
            peer_name: self.peer_name,
            peer_addr: self.peer_addr,
            serial,
            initiated_locally: self.initiated_locally,
            tx,
            state,
            finished,
            tasks: Arc::new(OnceLock::new()),
        };
        // Registered before the reader runs, so the session is listed by
        // the time anything arrives on it.
        table.insert(session.peer, session.clone());

        let reader_task = tokio::spawn(reader_loop(
            self.reader,
            ReaderContext {
                session: session.clone(),
                table,
                inbox: inbox_tx,
            },
        ));
        let _ = session
            .tasks
            .set([writer_task.abort_handle(), reader_task.abort_handle()]);

        tracing::info!(
            peer = %session.peer.short(),
            name = %session.peer_name,
            addr = %session.peer_addr,
            serial,
            "session open"
        );
        (session, inbox_rx)
    }
}

/// Handle onto a live session. Clones share the same connection.
#[derive(Clone)]
pub struct MessageSession {
    pub peer: NodeId,
    pub peer_name: String,
    pub peer_addr: SocketAddr,
    /// Process-unique id distinguishing successive sessions with one peer.
    pub serial: u64,
    pub initiated_locally: bool,
    tx: mpsc::Sender<Outbound>,
    /// Set once either task has stopped.
    state: Arc<watch::Sender<bool>>,
    /// Set once the reader has finished, drain included.
    finished: Arc<watch::Sender<bool>>,
    tasks: Arc<OnceLock<[AbortHandle; 2]>>,
}

impl std::fmt::Debug for MessageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSession")
            .field("peer", &self.peer)
            .field("peer_addr", &self.peer_addr)
            .field("serial", &self.serial)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MessageSession {
    pub fn is_open(&self) -> bool {
        !*self.state.borrow()
    }

    /// Queue a message. Waits only while the outbound queue is full.
    pub async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        self.tx
            .send(Outbound::Message { kind, payload })
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.send(MessageKind::Chat, Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    pub async fn send_control<T: Serialize>(&self, kind: MessageKind, body: &T) -> Result<(), SessionError> {
        let payload = encode_control(body)?;
        self.send(kind, payload).await
    }

    /// Queue a control message from a task of its own. The caller never
    /// waits on this session's outbound queue.
    pub fn spawn_control<T: Serialize>(
        &self,
        kind: MessageKind,
        body: &T,
    ) -> Result<JoinHandle<Result<(), SessionError>>, SessionError> {
        let payload = encode_control(body)?;
        let session = self.clone();
        Ok(tokio::spawn(async move { session.send(kind, payload).await }))
    }

    /// Flush queued frames and close. Gives up after `grace` and drops
    /// whatever is still queued.
    pub async fn close(&self, grace: Duration) {
        let graceful = async {
            if self.tx.send(Outbound::Close).await.is_ok() {
                let mut rx = self.finished.subscribe();
                let _ = rx.wait_for(|done| *done).await;
            }
        };
        if tokio::time::timeout(grace, graceful).await.is_err() {
            tracing::warn!(peer = %self.peer.short(), "session close timed out, dropping");
            self.state.send_replace(true);
            for task in self.tasks.get().into_iter().flatten() {
                task.abort();
            }
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

async fn writer_loop(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Outbound>,
    local_id: NodeId,
    state: Arc<watch::Sender<bool>>,
) {
    let mut stop = state.subscribe();
    let mut seq = PRESENCE_SEQ;

    loop {
        let next = tokio::select! {
            item = rx.recv() => item,
            _ = stop.wait_for(|closed| *closed) => None,
        };
        match next {
            Some(Outbound::Message { kind, payload }) => {
                seq += 1;
                let bytes = Message::new(kind, local_id, seq, payload).to_bytes();
                let written = tokio::select! {
                    r = writer.send(bytes) => r,
                    _ = stop.wait_for(|closed| *closed) => break,
                };
                match written {
                    Ok(()) => {}
                    Err(FrameError::FrameTooLarge { len, max }) => {
                        // Nothing reached the socket; the stream is still in sync.
                        tracing::warn!(?kind, len, max, "dropping oversized outbound message");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "session write failed");
                        break;
                    }
                }
            }
            Some(Outbound::Close) => {
                let _ = writer.close().await;
                break;
            }
            None => break,
        }
    }

    state.send_replace(true);
}

// ── Reader ────────────────────────────────────────────────────────────────────

struct ReaderContext {
    session: MessageSession,
    table: SessionTable,
    inbox: mpsc::Sender<SessionEvent>,
}

async fn reader_loop(frames: FrameReader, ctx: ReaderContext) {
    let ReaderContext { session, table, inbox } = ctx;
    let mut stop = session.state.subscribe();
    let mut incoming = receive(frames, session.peer);

    // `None` means we closed locally and the peer may still be sending.
    let reason = loop {
        let item = tokio::select! {
            item = incoming.next() => item,
            _ = stop.wait_for(|closed| *closed) => break None,
        };
        let message = match item {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::warn!(peer = %session.peer.short(), error = %e, "closing session");
                break Some(e.to_string());
            }
            None => break Some("peer closed the connection".to_string()),
        };
        // A full inbox holds the reader here, and the socket backs up.
        tokio::select! {
            sent = inbox.send(SessionEvent::Message(message)) => {
                if sent.is_err() {
                    break Some("node stopped".to_string());
                }
            }
            _ = stop.wait_for(|closed| *closed) => break None,
        }
    };

    session.state.send_replace(true);
    table.remove_if(&session.peer, |_, s| s.serial == session.serial);
    let reason = match reason {
        Some(reason) => reason,
        None => {
            drain(incoming.into_inner().into_inner()).await;
            "closed".to_string()
        }
    };
    tracing::info!(peer = %session.peer.short(), serial = session.serial, %reason, "session closed");
    let _ = inbox.send(SessionEvent::Closed { reason }).await;
    session.finished.send_replace(true);
}

/// Discard whatever the peer still sends until it closes its side. Dropping
/// a socket with unread data resets the connection, and the peer can lose
/// frames it has not read yet.
async fn drain(mut reader: OwnedReadHalf) {
    let discarded = tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut reader, &mut tokio::io::sink())).await;
    match discarded {
        Ok(Ok(bytes)) => tracing::trace!(bytes, "drained closing session"),
        Ok(Err(e)) => tracing::debug!(error = %e, "drain failed"),
        Err(_) => tracing::debug!("peer kept sending after close"),
    }
}

/// Messages decoded from a peer's frames.
///
/// Ends on a clean close between frames. A framing error or a sequence
/// number that does not increase is yielded once, then the stream ends.
/// Frames that fail to decode as messages are logged and skipped.
pub struct Incoming<R> {
    frames: FramedRead<R, FrameCodec>,
    peer: NodeId,
    last_seq: u64,
    done: bool,
}

pub fn receive<R: AsyncRead + Unpin>(frames: FramedRead<R, FrameCodec>, peer: NodeId) -> Incoming<R> {
    Incoming {
        frames,
        peer,
        last_seq: PRESENCE_SEQ,
        done: false,
    }
}

impl<R> Incoming<R> {
    pub fn into_inner(self) -> FramedRead<R, FrameCodec> {
        self.frames
    }
}

impl<R: AsyncRead + Unpin> Stream for Incoming<R> {
    type Item = Result<Message, SessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            let body = match ready!(this.frames.poll_next_unpin(cx)) {
                Some(Ok(body)) => body,
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(SessionError::Frame(e))));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            };

            let msg = match Message::from_bytes(&body) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(peer = %this.peer.short(), error = %e, "skipping malformed message");
                    continue;
                }
            };
            if msg.sender_id != this.peer {
                tracing::warn!(
                    peer = %this.peer.short(),
                    sender = %msg.sender_id.short(),
                    "skipping message with foreign sender id"
                );
                continue;
            }

            if msg.seq <= this.last_seq {
                this.done = true;
                return Poll::Ready(Some(Err(SessionError::SequenceViolation {
                    last: this.last_seq,
                    got: msg.seq,
                })));
            }
            if msg.seq > this.last_seq + 1 {
                tracing::warn!(
                    peer = %this.peer.short(),
                    expected = this.last_seq + 1,
                    got = msg.seq,
                    "sequence gap, messages lost"
                );
            }
            this.last_seq = msg.seq;
            return Poll::Ready(Some(Ok(msg)));
        }
    }
}
