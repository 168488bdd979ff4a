//! File transfer payloads.
//!
//! Offer, ack and end are JSON bodies. Chunks are binary: a fixed 20-byte
//! prefix (job id + big-endian index) followed by the chunk bytes.

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::WireError;

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Largest chunk size a receiver will agree to.
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// Length of a job id in bytes.
pub const JOB_ID_LEN: usize = 16;

/// Random transfer identifier. Serialises as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub [u8; JOB_ID_LEN]);

impl JobId {
    pub fn random() -> Self {
        let mut id = [0u8; JOB_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn matches_prefix(&self, prefix: &str) -> bool {
        hex::encode(self.0).starts_with(&prefix.to_ascii_lowercase())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.short())
    }
}

impl FromStr for JobId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; JOB_ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Number of chunks a file of `total_size` bytes splits into.
/// An empty file still has zero chunks.
pub fn chunk_count(total_size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size as u64) as u32
}

/// Exact length of chunk `index`; the last chunk may be short.
pub fn chunk_len(total_size: u64, chunk_size: u32, index: u32) -> usize {
    let start = index as u64 * chunk_size as u64;
    if start >= total_size {
        return 0;
    }
    (total_size - start).min(chunk_size as u64) as usize
}

/// Sender → receiver: proposes a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub job_id: JobId,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u32,
}

impl TransferOffer {
    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.total_size, self.chunk_size)
    }

    pub fn chunk_len(&self, index: u32) -> usize {
        chunk_len(self.total_size, self.chunk_size, index)
    }

    /// Reject offers no receiver should act on.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.filename.trim().is_empty() {
            return Err(WireError::InvalidPayload("empty filename".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(WireError::InvalidPayload(format!(
                "chunk size {} out of range",
                self.chunk_size
            )));
        }
        if self.total_size.div_ceil(self.chunk_size as u64) > u32::MAX as u64 {
            return Err(WireError::InvalidPayload("too many chunks".into()));
        }
        Ok(())
    }
}

/// Receiver → sender: accept/reject decision, or a re-request of the
/// listed chunk indices once the sender has finished streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    pub job_id: JobId,
    pub accept: bool,
    #[serde(default)]
    pub missing: Vec<u32>,
}

/// Either direction: the sender has streamed every chunk, the receiver has
/// every chunk, or (with `cancelled`) the job is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnd {
    pub job_id: JobId,
    #[serde(default)]
    pub cancelled: bool,
}

/// On-wire chunk prefix.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkPrefix {
    pub job_id: [u8; JOB_ID_LEN],
    /// Big-endian chunk index.
    pub index: [u8; 4],
}

assert_eq_size!(ChunkPrefix, [u8; 20]);

pub const CHUNK_PREFIX_LEN: usize = std::mem::size_of::<ChunkPrefix>();

/// One slice of a file, addressed by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferChunk {
    pub job_id: JobId,
    pub index: u32,
    pub data: Bytes,
}

impl TransferChunk {
    pub fn encode(&self) -> Bytes {
        let prefix = ChunkPrefix {
            job_id: self.job_id.0,
            index: self.index.to_be_bytes(),
        };
        let mut buf = BytesMut::with_capacity(CHUNK_PREFIX_LEN + self.data.len());
        buf.extend_from_slice(prefix.as_bytes());
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, WireError> {
        let prefix = ChunkPrefix::read_from_prefix(payload)
            .ok_or(WireError::MalformedMessage("short chunk prefix"))?;
        Ok(Self {
            job_id: JobId(prefix.job_id),
            index: u32::from_be_bytes(prefix.index),
            data: payload.slice(CHUNK_PREFIX_LEN..),
        })
    }
}
