//! Node identity.
//!
//! A node id is generated once per process from the node's address and a
//! random session nonce. It is the only identity the protocol knows: a peer
//! that restarts comes back with a new id, and a peer that changes address
//! keeps its id for the lifetime of its process.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;

/// Length of a node id in bytes.
pub const NODE_ID_LEN: usize = 16;

/// Maximum display name length in bytes (UTF-8).
pub const MAX_DISPLAY_NAME: usize = 64;

/// Opaque node identifier carried in every beacon and message header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive an id from an address and a session nonce.
    ///
    ///   id = BLAKE3(address || nonce)[..16]
    pub fn derive(addr: &SocketAddr, nonce: &[u8; 16]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(addr.to_string().as_bytes());
        hasher.update(nonce);
        let digest = hasher.finalize();
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..NODE_ID_LEN]);
        Self(id)
    }

    /// Derive an id for `addr` with a fresh random nonce.
    pub fn generate(addr: &SocketAddr) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::derive(addr, &nonce)
    }

    /// First 8 hex characters, as shown in the terminal.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Does the hex form of this id start with `prefix` (case-insensitive)?
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        let full = hex::encode(self.0);
        full.starts_with(&prefix.to_ascii_lowercase())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

/// Process-scoped identity of the local node.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub display_name: String,
}

impl NodeIdentity {
    /// Generate the local identity. Called once at startup.
    pub fn generate(display_name: &str, addr: &SocketAddr) -> Self {
        Self {
            id: NodeId::generate(addr),
            display_name: clamp_display_name(display_name),
        }
    }
}

/// Trim whitespace and cut a display name to `MAX_DISPLAY_NAME` bytes on a
/// char boundary. An empty result becomes "anonymous".
pub fn clamp_display_name(name: &str) -> String {
    let name = name.trim();
    let mut end = name.len().min(MAX_DISPLAY_NAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        return "anonymous".to_string();
    }
    name[..end].to_string()
}
