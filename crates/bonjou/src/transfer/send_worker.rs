//! Send worker. Streams one outbound job's chunks through its session.
//!
//! Pacing comes from the session's bounded outbound queue: when the socket
//! backs up, `send` waits, and so does the worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bonjou_core::transfer::TransferChunk;
use bonjou_core::{JobId, MessageKind, TransferEnd};
use bonjou_services::{FileSource, TransferError};

use super::TransferManager;
use crate::session::MessageSession;

pub struct SendWorker {
    pub manager: TransferManager,
    pub session: MessageSession,
    pub job_id: JobId,
    pub source: PathBuf,
    pub total_size: u64,
    pub chunk_size: u32,
    /// Chunk indices to send, in order.
    pub indices: Vec<u32>,
    pub cancel: Arc<AtomicBool>,
}

impl SendWorker {
    pub async fn run(self) {
        match self.stream().await {
            Ok(sent) => tracing::debug!(job = %self.job_id.short(), sent, "send worker finished"),
            Err(e) => {
                self.manager.fail_job(self.job_id, e.to_string()).await;
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn stream(&self) -> Result<u32, TransferError> {
        let mut source = FileSource::open(&self.source, self.chunk_size).await?;
        if source.total_size() != self.total_size {
            return Err(TransferError::InvalidOffer(format!(
                "{} changed size since it was offered",
                self.source.display()
            )));
        }

        let mut sent = 0u32;
        for &index in &self.indices {
            if self.cancelled() {
                return Ok(sent);
            }
            let data = source.read_chunk(index).await?;
            let len = data.len();
            let chunk = TransferChunk {
                job_id: self.job_id,
                index,
                data,
            };
            self.session
                .send(MessageKind::TransferChunk, chunk.encode())
                .await
                .map_err(|e| TransferError::SessionLost(e.to_string()))?;
            if !self.manager.record_sent(self.job_id, index, len).await {
                return Ok(sent);
            }
            sent += 1;
            tracing::trace!(job = %self.job_id.short(), index, len, "chunk queued");
        }

        if self.cancelled() {
            return Ok(sent);
        }
        let end = TransferEnd {
            job_id: self.job_id,
            cancelled: false,
        };
        self.session
            .send_control(MessageKind::TransferEnd, &end)
            .await
            .map_err(|e| TransferError::SessionLost(e.to_string()))?;
        Ok(sent)
    }
}
