//! Framing: 4-byte big-endian length prefix + message bytes.
//!
//! The length is checked against the configured maximum as soon as the
//! prefix is buffered, so an oversized declaration is rejected before any
//! of its body is collected.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const LEN_SIZE: usize = 4;

/// Default maximum frame body: 16 MiB.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec with a per-connection size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max: usize,
}

impl FrameCodec {
    pub fn new(max: usize) -> Self {
        Self { max }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    fn declared_len(src: &BytesMut) -> Option<usize> {
        let mut prefix = [0u8; LEN_SIZE];
        prefix.copy_from_slice(src.get(..LEN_SIZE)?);
        Some(u32::from_be_bytes(prefix) as usize)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(len) = Self::declared_len(src) else {
            return Ok(None);
        };
        if len > self.max {
            return Err(FrameError::FrameTooLarge { len, max: self.max });
        }
        if src.len() < LEN_SIZE + len {
            src.reserve(LEN_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let err = match Self::declared_len(src) {
            Some(len) => FrameError::TruncatedFrame {
                expected: len,
                got: src.len() - LEN_SIZE,
            },
            None => FrameError::TruncatedFrame {
                expected: LEN_SIZE,
                got: src.len(),
            },
        };
        src.clear();
        Err(err)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if body.len() > self.max {
            return Err(FrameError::FrameTooLarge {
                len: body.len(),
                max: self.max,
            });
        }
        dst.reserve(LEN_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
