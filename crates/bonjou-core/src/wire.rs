//! bonjou wire format: discovery beacons and protocol constants.
//!
//! These types ARE the discovery protocol. Every field, every size, every
//! reserved byte is part of the wire format.
//!
//! `BeaconWire` is #[repr(C, packed)] with byte-array fields only, so the
//! layout is deterministic and multi-byte integers are explicitly
//! big-endian. zerocopy derives give allocation-free (de)serialization.
//! There is no unsafe code in this module.

use static_assertions::{assert_eq_size, const_assert};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::{NodeId, MAX_DISPLAY_NAME, NODE_ID_LEN};

// ── Constants ─────────────────────────────────────────────────────────────────

/// UDP port for discovery beacons.
pub const DISCOVERY_PORT: u16 = 46320;

/// TCP port for message sessions.
pub const SESSION_PORT: u16 = 46321;

/// Default beacon interval in milliseconds.
pub const BEACON_INTERVAL_MS: u64 = 2000;

/// Peer TTL as a multiple of the beacon interval.
pub const PEER_TTL_FACTOR: u32 = 3;

/// Largest datagram a beacon may occupy. Keeps beacons clear of IP fragmentation.
pub const MAX_BEACON_DATAGRAM: usize = 512;

/// Leading bytes of every beacon.
pub const BEACON_MAGIC: [u8; 4] = *b"BNJU";

/// Current beacon format version.
pub const BEACON_VERSION: u8 = 0x01;

/// Beacon flag: the sender is leaving the network.
pub const FLAG_DEPARTURE: u8 = 0x01;

// ── Beacon ────────────────────────────────────────────────────────────────────

/// On-wire beacon datagram.
///
/// Wire size: 98 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct BeaconWire {
    /// Always `BEACON_MAGIC`.
    pub magic: [u8; 4],
    /// Format version. A receiver seeing an unknown version drops the datagram.
    pub version: u8,
    /// bit 0: departure. bits 1-7: reserved, must be zero.
    pub flags: u8,
    /// Number of meaningful bytes in `display_name`.
    pub name_len: u8,
    /// Reserved, must be zero.
    pub reserved: u8,
    /// Sender's node id.
    pub node_id: [u8; NODE_ID_LEN],
    /// TCP port on which the sender accepts sessions (big-endian).
    pub listen_port: [u8; 2],
    /// Per-process beacon counter (big-endian). Strictly increasing.
    pub sequence: [u8; 8],
    /// UTF-8 display name, zero padded.
    pub display_name: [u8; MAX_DISPLAY_NAME],
}

assert_eq_size!(BeaconWire, [u8; 98]);
const_assert!(std::mem::size_of::<BeaconWire>() <= MAX_BEACON_DATAGRAM);

/// Wire size of a beacon datagram.
pub const BEACON_LEN: usize = std::mem::size_of::<BeaconWire>();

/// A decoded presence announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub id: NodeId,
    pub display_name: String,
    pub listen_port: u16,
    pub sequence: u64,
    /// Final beacon sent on clean shutdown.
    pub departing: bool,
}

impl Beacon {
    /// Encode into a fixed-layout datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let name = self.display_name.as_bytes();
        if name.len() > MAX_DISPLAY_NAME {
            return Err(WireError::DisplayNameTooLong(name.len()));
        }
        let mut display_name = [0u8; MAX_DISPLAY_NAME];
        display_name[..name.len()].copy_from_slice(name);

        let wire = BeaconWire {
            magic: BEACON_MAGIC,
            version: BEACON_VERSION,
            flags: if self.departing { FLAG_DEPARTURE } else { 0 },
            name_len: name.len() as u8,
            reserved: 0,
            node_id: self.id.0,
            listen_port: self.listen_port.to_be_bytes(),
            sequence: self.sequence.to_be_bytes(),
            display_name,
        };
        Ok(wire.as_bytes().to_vec())
    }

    /// Decode an inbound datagram. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = BeaconWire::read_from_prefix(bytes)
            .ok_or(WireError::MalformedBeacon("short datagram"))?;

        if wire.magic != BEACON_MAGIC {
            return Err(WireError::MalformedBeacon("bad magic"));
        }
        if wire.version != BEACON_VERSION {
            return Err(WireError::MalformedBeacon("unsupported version"));
        }
        if wire.flags & !FLAG_DEPARTURE != 0 {
            return Err(WireError::MalformedBeacon("reserved flags set"));
        }
        let name_len = wire.name_len as usize;
        if name_len > MAX_DISPLAY_NAME {
            return Err(WireError::MalformedBeacon("name length out of range"));
        }
        let name_bytes = wire.display_name;
        let display_name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| WireError::MalformedBeacon("display name is not UTF-8"))?
            .to_string();
        let listen_port = u16::from_be_bytes(wire.listen_port);
        if listen_port == 0 {
            return Err(WireError::MalformedBeacon("listen port is zero"));
        }

        Ok(Self {
            id: NodeId(wire.node_id),
            display_name,
            listen_port,
            sequence: u64::from_be_bytes(wire.sequence),
            departing: wire.flags & FLAG_DEPARTURE != 0,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed beacon: {0}")]
    MalformedBeacon(&'static str),

    #[error("display name is {0} bytes, maximum is {}", MAX_DISPLAY_NAME)]
    DisplayNameTooLong(usize),

    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownMessageKind(u8),

    #[error("invalid message payload: {0}")]
    InvalidPayload(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
