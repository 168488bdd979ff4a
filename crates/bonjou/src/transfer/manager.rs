//! Transfer manager. Drives both sides of the offer / ack / chunk / end
//! protocol for every job on this node.
//!
//! Sender: OFFER → (peer ACK accept) → CHUNK 0..N-1 → END. The receiver
//! answers END with its own END once every chunk is on disk, or with an
//! ACK listing missing indices, which are then resent.
//!
//! Receiver: OFFER surfaces as an event; `accept` opens a pre-sized file
//! and ACKs; chunks are written by index in whatever order they arrive.
//!
//! A job is bound to the session it started on. When that session closes,
//! every unfinished job on it fails and partial files are removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use bonjou_core::transfer::TransferChunk;
use bonjou_core::{JobId, Message, MessageKind, NodeId, TransferAck, TransferEnd, TransferOffer};
use bonjou_services::file_transfer::FileSink;
use bonjou_services::{NodeEvent, TransferDirection, TransferError, TransferJob, TransferState};

use super::send_worker::SendWorker;
use crate::session::MessageSession;

/// Bound on queuing a cancellation END during cancel or shutdown.
pub const END_TIMEOUT: Duration = Duration::from_secs(2);

struct WorkerHandle {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    fn stop(self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

struct JobEntry {
    job: TransferJob,
    session: MessageSession,
    sink: Option<FileSink>,
    worker: Option<WorkerHandle>,
}

impl JobEntry {
    /// Stop local activity for a job that just went terminal.
    fn release(&mut self) -> Option<FileSink> {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        self.sink.take()
    }
}

struct Inner {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    download_dir: PathBuf,
    chunk_size: u32,
}

#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    pub fn new(download_dir: PathBuf, chunk_size: u32, events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                events,
                download_dir,
                chunk_size,
            }),
        }
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Snapshot of every job, oldest first.
    pub async fn list(&self) -> Vec<TransferJob> {
        let jobs = self.inner.jobs.lock().await;
        let mut out: Vec<TransferJob> = jobs.values().map(|e| e.job.clone()).collect();
        out.sort_by_key(|j| j.created_at);
        out
    }

    // ── Local operations ─────────────────────────────────────────────────────

    /// Offer `path` to the peer on `session`.
    pub async fn offer(&self, session: &MessageSession, path: &Path) -> Result<TransferJob, TransferError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidOffer(format!("{} is not a file", path.display())));
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| TransferError::InvalidOffer("path has no file name".into()))?;

        let job = {
            let mut jobs = self.inner.jobs.lock().await;
            let job_id = loop {
                let id = JobId::random();
                if !jobs.contains_key(&id) {
                    break id;
                }
            };
            let offer = TransferOffer {
                job_id,
                filename,
                total_size: meta.len(),
                chunk_size: self.inner.chunk_size,
            };
            offer
                .validate()
                .map_err(|e| TransferError::InvalidOffer(e.to_string()))?;

            let job = TransferJob::outbound(&offer, session.peer, &session.peer_name, path.to_path_buf());
            jobs.insert(
                job_id,
                JobEntry {
                    job: job.clone(),
                    session: session.clone(),
                    sink: None,
                    worker: None,
                },
            );
            job
        };

        tracing::info!(
            job = %job.job_id.short(),
            peer = %session.peer.short(),
            file = %job.filename,
            size = job.total_size,
            chunks = job.chunk_count(),
            "offering file"
        );

        if let Err(e) = session.send_control(MessageKind::TransferOffer, &job.offer()).await {
            self.fail_job(job.job_id, e.to_string()).await;
            return Err(TransferError::SessionLost(e.to_string()));
        }
        Ok(job)
    }

    /// Accept an inbound offer, identified by job id prefix.
    pub async fn accept(&self, prefix: &str) -> Result<TransferJob, TransferError> {
        let (snapshot, session) = {
            let mut jobs = self.inner.jobs.lock().await;
            let job_id = resolve_id(&jobs, prefix)?;
            let Some(entry) = jobs.get_mut(&job_id) else {
                return Err(TransferError::UnknownJob(prefix.to_string()));
            };
            if entry.job.direction != TransferDirection::Inbound {
                return Err(invalid(&entry.job, "accept an outbound job"));
            }
            entry.job.accept()?;
            match FileSink::create(&self.inner.download_dir, &entry.job.offer()).await {
                Ok(sink) => entry.sink = Some(sink),
                Err(e) => {
                    let _ = entry.job.fail(e.to_string());
                    return Err(e);
                }
            }
            (entry.job.clone(), entry.session.clone())
        };

        let ack = TransferAck {
            job_id: snapshot.job_id,
            accept: true,
            missing: Vec::new(),
        };
        if let Err(e) = session.send_control(MessageKind::TransferAck, &ack).await {
            self.fail_job(snapshot.job_id, e.to_string()).await;
            return Err(TransferError::SessionLost(e.to_string()));
        }
        tracing::info!(job = %snapshot.job_id.short(), file = %snapshot.filename, "offer accepted");

        if snapshot.chunk_count() == 0 {
            self.complete_inbound(snapshot.job_id).await;
        }
        Ok(snapshot)
    }

    /// Decline an inbound offer.
    pub async fn reject(&self, prefix: &str) -> Result<TransferJob, TransferError> {
        let (snapshot, session) = {
            let mut jobs = self.inner.jobs.lock().await;
            let job_id = resolve_id(&jobs, prefix)?;
            let Some(entry) = jobs.get_mut(&job_id) else {
                return Err(TransferError::UnknownJob(prefix.to_string()));
            };
            if entry.job.direction != TransferDirection::Inbound || entry.job.state != TransferState::Offered {
                return Err(invalid(&entry.job, "reject"));
            }
            entry.job.cancel()?;
            (entry.job.clone(), entry.session.clone())
        };

        let ack = TransferAck {
            job_id: snapshot.job_id,
            accept: false,
            missing: Vec::new(),
        };
        if let Err(e) = session.send_control(MessageKind::TransferAck, &ack).await {
            tracing::debug!(job = %snapshot.job_id.short(), error = %e, "reject not delivered");
        }
        Ok(snapshot)
    }

    /// Cancel one job and tell the peer, if its session is still open.
    pub async fn cancel(&self, prefix: &str) -> Result<TransferJob, TransferError> {
        let job_id = {
            let jobs = self.inner.jobs.lock().await;
            resolve_id(&jobs, prefix)?
        };
        self.cancel_job(job_id).await
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<TransferJob, TransferError> {
        let (snapshot, session, sink) = {
            let mut jobs = self.inner.jobs.lock().await;
            let Some(entry) = jobs.get_mut(&job_id) else {
                return Err(TransferError::UnknownJob(job_id.to_string()));
            };
            entry.job.cancel()?;
            let sink = entry.release();
            (entry.job.clone(), entry.session.clone(), sink)
        };

        if let Some(sink) = sink {
            sink.discard().await;
        }

        let end = TransferEnd {
            job_id,
            cancelled: true,
        };
        match tokio::time::timeout(END_TIMEOUT, session.send_control(MessageKind::TransferEnd, &end)).await {
            Ok(Ok(())) => tracing::debug!(job = %job_id.short(), "cancellation sent"),
            Ok(Err(e)) => tracing::debug!(job = %job_id.short(), error = %e, "cancellation not delivered"),
            Err(_) => tracing::warn!(job = %job_id.short(), "timed out queuing cancellation"),
        }

        tracing::info!(job = %job_id.short(), file = %snapshot.filename, "transfer cancelled");
        self.emit(NodeEvent::TransferCancelled {
            job_id,
            filename: snapshot.filename.clone(),
            by_peer: false,
        });
        Ok(snapshot)
    }

    /// Cancel every unfinished job. Used on shutdown.
    pub async fn cancel_all(&self) {
        let live: Vec<JobId> = {
            let jobs = self.inner.jobs.lock().await;
            jobs.values()
                .filter(|e| !e.job.state.is_terminal())
                .map(|e| e.job.job_id)
                .collect()
        };
        if live.is_empty() {
            return;
        }
        tracing::info!(count = live.len(), "cancelling transfers");
        futures::future::join_all(live.into_iter().map(|id| self.cancel_job(id))).await;
    }

    /// Fail every unfinished job bound to a session that just closed.
    pub async fn on_session_closed(&self, peer: NodeId, serial: u64) {
        let failed: Vec<(TransferJob, Option<FileSink>)> = {
            let mut jobs = self.inner.jobs.lock().await;
            jobs.values_mut()
                .filter(|e| e.session.serial == serial && e.session.peer == peer)
                .filter(|e| !e.job.state.is_terminal())
                .filter_map(|e| {
                    e.job.fail("session closed").ok()?;
                    let sink = e.release();
                    Some((e.job.clone(), sink))
                })
                .collect()
        };

        for (job, sink) in failed {
            if let Some(sink) = sink {
                sink.discard().await;
            }
            tracing::warn!(job = %job.job_id.short(), file = %job.filename, "transfer failed, session closed");
            self.emit(NodeEvent::TransferFailed {
                job_id: job.job_id,
                filename: job.filename,
                reason: "session closed".into(),
            });
        }
    }

    // ── Inbound protocol messages ────────────────────────────────────────────

    /// Route one transfer message received on `session`.
    pub async fn handle_message(&self, session: &MessageSession, msg: &Message) {
        let result = match msg.kind {
            MessageKind::TransferOffer => match msg.control::<TransferOffer>() {
                Ok(offer) => {
                    self.handle_offer(session, offer).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageKind::TransferAck => match msg.control::<TransferAck>() {
                Ok(ack) => {
                    self.handle_ack(session, ack).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageKind::TransferChunk => match TransferChunk::decode(&msg.payload) {
                Ok(chunk) => {
                    self.handle_chunk(session, chunk).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageKind::TransferEnd => match msg.control::<TransferEnd>() {
                Ok(end) => {
                    self.handle_end(session, end).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            MessageKind::Chat | MessageKind::Presence => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(peer = %session.peer.short(), kind = ?msg.kind, error = %e, "dropping transfer message");
        }
    }

    async fn handle_offer(&self, session: &MessageSession, offer: TransferOffer) {
        if let Err(e) = offer.validate() {
            tracing::warn!(peer = %session.peer.short(), error = %e, "rejecting invalid offer");
            let ack = TransferAck {
                job_id: offer.job_id,
                accept: false,
                missing: Vec::new(),
            };
            reply(session, MessageKind::TransferAck, &ack);
            return;
        }

        let job = {
            let mut jobs = self.inner.jobs.lock().await;
            if jobs.contains_key(&offer.job_id) {
                tracing::warn!(job = %offer.job_id.short(), "duplicate offer ignored");
                return;
            }
            let job = TransferJob::inbound(&offer, session.peer, &session.peer_name);
            jobs.insert(
                offer.job_id,
                JobEntry {
                    job: job.clone(),
                    session: session.clone(),
                    sink: None,
                    worker: None,
                },
            );
            job
        };

        tracing::info!(
            job = %job.job_id.short(),
            peer = %session.peer.short(),
            file = %job.filename,
            size = job.total_size,
            "file offered"
        );
        self.emit(NodeEvent::TransferOffered {
            job_id: job.job_id,
            from: session.peer,
            name: session.peer_name.clone(),
            filename: job.filename,
            total_size: job.total_size,
        });
    }

    async fn handle_ack(&self, session: &MessageSession, ack: TransferAck) {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&ack.job_id) else {
            tracing::debug!(job = %ack.job_id.short(), "ack for unknown job");
            return;
        };
        if entry.job.direction != TransferDirection::Outbound || entry.job.peer != session.peer {
            tracing::warn!(job = %ack.job_id.short(), "ack from wrong peer or for inbound job");
            return;
        }

        if !ack.accept {
            if entry.job.state == TransferState::Offered && entry.job.cancel().is_ok() {
                tracing::info!(job = %ack.job_id.short(), "offer rejected by peer");
                self.emit(NodeEvent::TransferRejected {
                    job_id: ack.job_id,
                    filename: entry.job.filename.clone(),
                });
            }
            return;
        }

        let indices: Vec<u32> = match entry.job.state {
            TransferState::Offered => {
                if entry.job.accept().is_err() {
                    return;
                }
                self.emit(NodeEvent::TransferAccepted {
                    job_id: ack.job_id,
                    filename: entry.job.filename.clone(),
                });
                (0..entry.job.chunk_count()).collect()
            }
            TransferState::Accepted | TransferState::InProgress if !ack.missing.is_empty() => {
                let count = entry.job.chunk_count();
                let missing: Vec<u32> = ack.missing.iter().copied().filter(|i| *i < count).collect();
                tracing::info!(job = %ack.job_id.short(), missing = missing.len(), "peer re-requested chunks");
                missing
            }
            _ => {
                tracing::debug!(job = %ack.job_id.short(), state = %entry.job.state, "ack ignored");
                return;
            }
        };

        let Some(source) = entry.job.path.clone() else {
            return;
        };
        if let Some(previous) = entry.worker.take() {
            previous.stop();
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = SendWorker {
            manager: self.clone(),
            session: entry.session.clone(),
            job_id: ack.job_id,
            source,
            total_size: entry.job.total_size,
            chunk_size: entry.job.chunk_size,
            indices,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        entry.worker = Some(WorkerHandle { cancel, task });
    }

    async fn handle_chunk(&self, session: &MessageSession, chunk: TransferChunk) {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&chunk.job_id) else {
            tracing::debug!(job = %chunk.job_id.short(), "chunk for unknown job");
            return;
        };
        if entry.job.direction != TransferDirection::Inbound || entry.job.peer != session.peer {
            tracing::warn!(job = %chunk.job_id.short(), "chunk from wrong peer or for outbound job");
            return;
        }
        match entry.job.state {
            TransferState::Accepted | TransferState::InProgress => {}
            state if state.is_terminal() => return,
            state => {
                tracing::warn!(job = %chunk.job_id.short(), %state, "chunk before accept, dropped");
                return;
            }
        }

        let recorded = match entry.job.record_chunk(chunk.index, chunk.data.len()) {
            Ok(fresh) => match (&mut entry.sink, fresh) {
                (Some(sink), true) => sink.write_chunk(chunk.index, &chunk.data).await,
                _ => Ok(()),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = recorded {
            drop(jobs);
            self.abort_job(chunk.job_id, e.to_string()).await;
            return;
        }

        if entry.job.all_received() {
            drop(jobs);
            self.complete_inbound(chunk.job_id).await;
        }
    }

    async fn handle_end(&self, session: &MessageSession, end: TransferEnd) {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&end.job_id) else {
            tracing::debug!(job = %end.job_id.short(), "end for unknown job");
            return;
        };
        if entry.job.peer != session.peer || entry.job.state.is_terminal() {
            return;
        }

        if end.cancelled {
            if entry.job.cancel().is_err() {
                return;
            }
            let sink = entry.release();
            let filename = entry.job.filename.clone();
            drop(jobs);
            if let Some(sink) = sink {
                sink.discard().await;
            }
            tracing::info!(job = %end.job_id.short(), file = %filename, "transfer cancelled by peer");
            self.emit(NodeEvent::TransferCancelled {
                job_id: end.job_id,
                filename,
                by_peer: true,
            });
            return;
        }

        let direction = entry.job.direction;
        match direction {
            TransferDirection::Outbound => {
                if entry.job.complete().is_err() {
                    return;
                }
                // The receiver has everything; any retransmission still running is moot.
                if let Some(worker) = entry.worker.take() {
                    worker.stop();
                }
                tracing::info!(job = %end.job_id.short(), file = %entry.job.filename, "transfer delivered");
                self.emit(NodeEvent::TransferCompleted {
                    job_id: end.job_id,
                    filename: entry.job.filename.clone(),
                    saved_to: None,
                });
            }
            TransferDirection::Inbound => {
                if entry.job.state == TransferState::Offered || entry.job.all_received() {
                    return;
                }
                let ack = TransferAck {
                    job_id: end.job_id,
                    accept: true,
                    missing: entry.job.missing(),
                };
                let session = entry.session.clone();
                drop(jobs);
                tracing::info!(job = %end.job_id.short(), missing = ack.missing.len(), "requesting missing chunks");
                reply(&session, MessageKind::TransferAck, &ack);
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Finish the file, acknowledge with END, and mark the job complete.
    async fn complete_inbound(&self, job_id: JobId) {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return;
        };
        let Some(sink) = entry.sink.take() else {
            return;
        };
        let saved = match sink.finish().await {
            Ok(path) => path,
            Err(e) => {
                drop(jobs);
                self.abort_job(job_id, e.to_string()).await;
                return;
            }
        };
        if entry.job.complete().is_err() {
            return;
        }
        entry.job.path = Some(saved.clone());
        let session = entry.session.clone();
        let filename = entry.job.filename.clone();
        drop(jobs);

        let end = TransferEnd {
            job_id,
            cancelled: false,
        };
        reply(&session, MessageKind::TransferEnd, &end);
        tracing::info!(job = %job_id.short(), path = %saved.display(), "file received");
        self.emit(NodeEvent::TransferCompleted {
            job_id,
            filename,
            saved_to: Some(saved),
        });
    }

    /// Fail a job locally and tell the peer to stop.
    async fn abort_job(&self, job_id: JobId, reason: String) {
        let session = self.fail_job(job_id, reason).await;
        if let Some(session) = session {
            let end = TransferEnd {
                job_id,
                cancelled: true,
            };
            reply(&session, MessageKind::TransferEnd, &end);
        }
    }

    /// Mark a job failed. Returns its session if the job was still live.
    pub(crate) async fn fail_job(&self, job_id: JobId, reason: String) -> Option<MessageSession> {
        let (filename, session, sink) = {
            let mut jobs = self.inner.jobs.lock().await;
            let entry = jobs.get_mut(&job_id)?;
            entry.job.fail(reason.clone()).ok()?;
            // A failing worker reports here itself; only detach it.
            entry.worker.take();
            (entry.job.filename.clone(), entry.session.clone(), entry.sink.take())
        };
        if let Some(sink) = sink {
            sink.discard().await;
        }
        tracing::warn!(job = %job_id.short(), file = %filename, %reason, "transfer failed");
        self.emit(NodeEvent::TransferFailed {
            job_id,
            filename,
            reason,
        });
        Some(session)
    }

    /// Record that chunk `index` was handed to the session.
    /// Returns false once the job is no longer live.
    pub(crate) async fn record_sent(&self, job_id: JobId, index: u32, len: usize) -> bool {
        let mut jobs = self.inner.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(entry) if !entry.job.state.is_terminal() => entry.job.record_chunk(index, len).is_ok(),
            _ => false,
        }
    }
}

/// Answer the peer without waiting on its session's outbound queue.
/// Inbound messages are handled on the session's delivery path, which must
/// keep draining while the queue is full.
fn reply<T: Serialize>(session: &MessageSession, kind: MessageKind, body: &T) {
    if let Err(e) = session.spawn_control(kind, body) {
        tracing::warn!(peer = %session.peer.short(), ?kind, error = %e, "reply not sent");
    }
}

fn invalid(job: &TransferJob, action: &'static str) -> TransferError {
    TransferError::InvalidState {
        job: job.job_id,
        state: job.state,
        action,
    }
}

fn resolve_id(jobs: &HashMap<JobId, JobEntry>, prefix: &str) -> Result<JobId, TransferError> {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return Err(TransferError::UnknownJob(prefix.to_string()));
    }
    let matches: Vec<JobId> = jobs.keys().filter(|id| id.matches_prefix(prefix)).copied().collect();
    match matches.as_slice() {
        [] => Err(TransferError::UnknownJob(prefix.to_string())),
        [one] => Ok(*one),
        _ => Err(TransferError::AmbiguousJob(prefix.to_string())),
    }
}
