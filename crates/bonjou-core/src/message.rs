//! Session messages, one per frame.
//!
//! Every message is a fixed 28-byte header followed by a kind-specific
//! payload. Control payloads (presence, offer, ack, end) are JSON; chat is
//! raw UTF-8; chunks are binary (see `transfer::TransferChunk`).

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::{NodeId, NODE_ID_LEN};
use crate::wire::WireError;

/// Current message header version.
pub const MESSAGE_VERSION: u8 = 0x01;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Chat = 1,
    Presence = 2,
    TransferOffer = 3,
    TransferChunk = 4,
    TransferAck = 5,
    TransferEnd = 6,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Chat),
            2 => Ok(Self::Presence),
            3 => Ok(Self::TransferOffer),
            4 => Ok(Self::TransferChunk),
            5 => Ok(Self::TransferAck),
            6 => Ok(Self::TransferEnd),
            other => Err(WireError::UnknownMessageKind(other)),
        }
    }
}

/// On-wire message header.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    pub version: u8,
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub reserved: u8,
    pub sender_id: [u8; NODE_ID_LEN],
    /// Per-session, per-direction counter (big-endian).
    pub seq: [u8; 8],
}

assert_eq_size!(MessageHeader, [u8; 28]);

/// Wire size of a message header.
pub const HEADER_LEN: usize = std::mem::size_of::<MessageHeader>();

/// A decoded session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub sender_id: NodeId,
    pub seq: u64,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, sender_id: NodeId, seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            sender_id,
            seq,
            payload: payload.into(),
        }
    }

    pub fn chat(sender_id: NodeId, seq: u64, text: &str) -> Self {
        Self::new(MessageKind::Chat, sender_id, seq, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Build a message whose payload is `body` serialised as JSON.
    pub fn with_control<T: Serialize>(
        kind: MessageKind,
        sender_id: NodeId,
        seq: u64,
        body: &T,
    ) -> Result<Self, WireError> {
        let payload = encode_control(body)?;
        Ok(Self::new(kind, sender_id, seq, payload))
    }

    pub fn to_bytes(&self) -> Bytes {
        let header = MessageHeader {
            version: MESSAGE_VERSION,
            kind: self.kind as u8,
            flags: 0,
            reserved: 0,
            sender_id: self.sender_id.0,
            seq: self.seq.to_be_bytes(),
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let header = MessageHeader::read_from_prefix(data)
            .ok_or(WireError::MalformedMessage("short header"))?;
        if header.version != MESSAGE_VERSION {
            return Err(WireError::MalformedMessage("unsupported version"));
        }
        if header.flags != 0 {
            return Err(WireError::MalformedMessage("reserved flags set"));
        }
        let kind = MessageKind::try_from(header.kind)?;
        Ok(Self {
            kind,
            sender_id: NodeId(header.sender_id),
            seq: u64::from_be_bytes(header.seq),
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }

    /// Chat text. Invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Parse a JSON control payload.
    pub fn control<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        serde_json::from_slice(&self.payload).map_err(|e| WireError::InvalidPayload(e.to_string()))
    }
}

/// Serialise a control body to JSON bytes.
pub fn encode_control<T: Serialize>(body: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|e| WireError::InvalidPayload(e.to_string()))
}

/// First message on every session, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub display_name: String,
    pub listen_port: u16,
}
