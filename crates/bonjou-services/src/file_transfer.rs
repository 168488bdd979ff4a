//! File transfer jobs: per-job chunk bookkeeping and on-disk reassembly.
//!
//! A `TransferJob` is the local side's record of one transfer. The remote
//! side keeps its own independent job under the same id. Chunks are
//! written by index into a pre-sized `.part` file, so arrival order does
//! not matter.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bonjou_core::transfer::{chunk_count, chunk_len};
use bonjou_core::{JobId, NodeId, TransferOffer};
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Offered,
    Accepted,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::InProgress => "in progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-chunk progress. On outbound jobs `received` means handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlot {
    pub index: u32,
    pub received: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("chunk {index} out of range for job with {count} chunks")]
    ChunkIndexOutOfRange { index: u32, count: u32 },

    #[error("chunk {index} has {got} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u32, expected: usize, got: usize },

    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("job {job} is {state}, cannot {action}")]
    InvalidState {
        job: JobId,
        state: TransferState,
        action: &'static str,
    },

    #[error("no transfer matches {0:?}")]
    UnknownJob(String),

    #[error("{0:?} matches several transfers")]
    AmbiguousJob(String),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local record of one transfer.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub job_id: JobId,
    pub direction: TransferDirection,
    pub peer: NodeId,
    pub peer_name: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub chunks: Vec<ChunkSlot>,
    pub state: TransferState,
    /// Source file (outbound) or final destination once complete (inbound).
    pub path: Option<PathBuf>,
    pub failure: Option<String>,
    pub created_at: Instant,
}

impl TransferJob {
    fn new(offer: &TransferOffer, direction: TransferDirection, peer: NodeId, peer_name: &str) -> Self {
        let count = chunk_count(offer.total_size, offer.chunk_size);
        Self {
            job_id: offer.job_id,
            direction,
            peer,
            peer_name: peer_name.to_string(),
            filename: offer.filename.clone(),
            total_size: offer.total_size,
            chunk_size: offer.chunk_size,
            chunks: (0..count).map(|index| ChunkSlot { index, received: false }).collect(),
            state: TransferState::Offered,
            path: None,
            failure: None,
            created_at: Instant::now(),
        }
    }

    pub fn outbound(offer: &TransferOffer, peer: NodeId, peer_name: &str, source: PathBuf) -> Self {
        let mut job = Self::new(offer, TransferDirection::Outbound, peer, peer_name);
        job.path = Some(source);
        job
    }

    pub fn inbound(offer: &TransferOffer, peer: NodeId, peer_name: &str) -> Self {
        Self::new(offer, TransferDirection::Inbound, peer, peer_name)
    }

    pub fn offer(&self) -> TransferOffer {
        TransferOffer {
            job_id: self.job_id,
            filename: self.filename.clone(),
            total_size: self.total_size,
            chunk_size: self.chunk_size,
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk_len(&self, index: u32) -> usize {
        chunk_len(self.total_size, self.chunk_size, index)
    }

    pub fn received_count(&self) -> u32 {
        self.chunks.iter().filter(|c| c.received).count() as u32
    }

    pub fn missing(&self) -> Vec<u32> {
        self.chunks.iter().filter(|c| !c.received).map(|c| c.index).collect()
    }

    pub fn all_received(&self) -> bool {
        self.chunks.iter().all(|c| c.received)
    }

    /// (done, total) chunk counts.
    pub fn progress(&self) -> (u32, u32) {
        (self.received_count(), self.chunk_count())
    }

    fn ensure_live(&self, action: &'static str) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> TransferError {
        TransferError::InvalidState {
            job: self.job_id,
            state: self.state,
            action,
        }
    }

    /// Offered → Accepted.
    pub fn accept(&mut self) -> Result<(), TransferError> {
        if self.state != TransferState::Offered {
            return Err(self.invalid("accept"));
        }
        self.state = TransferState::Accepted;
        Ok(())
    }

    /// Accepted → InProgress. A no-op when already in progress.
    pub fn start(&mut self) -> Result<(), TransferError> {
        match self.state {
            TransferState::Accepted => {
                self.state = TransferState::InProgress;
                Ok(())
            }
            TransferState::InProgress => Ok(()),
            _ => Err(self.invalid("start")),
        }
    }

    /// Validate and record chunk `index` of `len` bytes.
    /// Returns false when the chunk had already been recorded.
    pub fn record_chunk(&mut self, index: u32, len: usize) -> Result<bool, TransferError> {
        self.ensure_live("record chunk")?;
        let count = self.chunk_count();
        if index >= count {
            return Err(TransferError::ChunkIndexOutOfRange { index, count });
        }
        let expected = self.chunk_len(index);
        if len != expected {
            return Err(TransferError::ChunkSizeMismatch {
                index,
                expected,
                got: len,
            });
        }
        self.start()?;
        let slot = &mut self.chunks[index as usize];
        let fresh = !slot.received;
        slot.received = true;
        Ok(fresh)
    }

    pub fn complete(&mut self) -> Result<(), TransferError> {
        self.ensure_live("complete")?;
        self.state = TransferState::Complete;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransferError> {
        self.ensure_live("fail")?;
        self.state = TransferState::Failed;
        self.failure = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransferError> {
        self.ensure_live("cancel")?;
        self.state = TransferState::Cancelled;
        Ok(())
    }
}

// ── Disk I/O ──────────────────────────────────────────────────────────────────

/// Reduce an offered filename to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim().to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// First path in `dir` named `filename`, `filename (1)`, `filename (2)`, …
/// that does not exist yet.
pub fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
    let ext = path.extension().and_then(|e| e.to_str());
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Receiving side: a pre-sized `.part` file written at chunk offsets.
pub struct FileSink {
    file: File,
    part_path: PathBuf,
    dir: PathBuf,
    filename: String,
    chunk_size: u32,
}

impl FileSink {
    pub async fn create(dir: &Path, offer: &TransferOffer) -> Result<Self, TransferError> {
        tokio::fs::create_dir_all(dir).await?;
        let part_path = dir.join(format!(".{}.part", offer.job_id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&part_path)
            .await?;
        file.set_len(offer.total_size).await?;
        Ok(Self {
            file,
            part_path,
            dir: dir.to_path_buf(),
            filename: sanitize_filename(&offer.filename),
            chunk_size: offer.chunk_size,
        })
    }

    pub async fn write_chunk(&mut self, index: u32, data: &[u8]) -> Result<(), TransferError> {
        let offset = index as u64 * self.chunk_size as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    /// Flush and move the finished file to its final name.
    pub async fn finish(mut self) -> Result<PathBuf, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        let dest = unique_destination(&self.dir, &self.filename);
        tokio::fs::rename(&self.part_path, &dest).await?;
        Ok(dest)
    }

    /// Drop partial data.
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            tracing::debug!(path = %self.part_path.display(), error = %e, "failed to remove partial file");
        }
    }
}

/// Sending side: random access reads by chunk index.
pub struct FileSource {
    file: File,
    total_size: u64,
    chunk_size: u32,
}

impl FileSource {
    pub async fn open(path: &Path, chunk_size: u32) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let total_size = file.metadata().await?.len();
        Ok(Self {
            file,
            total_size,
            chunk_size,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub async fn read_chunk(&mut self, index: u32) -> Result<Bytes, TransferError> {
        let len = chunk_len(self.total_size, self.chunk_size, index);
        let mut buf = vec![0u8; len];
        self.file
            .seek(SeekFrom::Start(index as u64 * self.chunk_size as u64))
            .await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
