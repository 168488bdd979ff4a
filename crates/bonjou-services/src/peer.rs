//! Peer registry: the node's live view of who is on the LAN.
//!
//! Written by the discovery listener and expiry sweep, read by everything
//! else. Mutation goes through `DashMap` entry locks so each peer's record
//! is updated by one writer at a time; readers only ever get cloned
//! snapshots.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bonjou_core::{Beacon, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Capacity of the peer event channel. Slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Minimum id-prefix length accepted by `resolve`.
pub const MIN_ID_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Active,
    /// TTL elapsed without a beacon. Never listed.
    Stale,
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub display_name: String,
    /// Beacon source IP + advertised listen port.
    pub address: SocketAddr,
    pub last_seen_at: Instant,
    pub last_sequence: u64,
    pub state: PeerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartReason {
    /// The peer sent a departure beacon.
    Announced,
    /// The peer went silent for longer than the TTL.
    Expired,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Joined(Peer),
    Departed { peer: Peer, reason: DepartReason },
}

/// What `upsert` did with a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Joined,
    Refreshed,
    /// Sequence not newer than the last one seen. Dropped.
    Ignored,
    Departed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no peer matches {0:?}")]
    NotFound(String),

    #[error("{target:?} matches several peers: {}", candidates.join(", "))]
    Ambiguous {
        target: String,
        candidates: Vec<String>,
    },
}

/// The peer registry, shared between the discovery tasks, the session
/// layer and the command dispatcher. Keyed on node id.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<DashMap<NodeId, Peer>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn upsert(&self, beacon: &Beacon, source: SocketAddr) -> Upsert {
        self.upsert_at(beacon, source.ip(), Instant::now())
    }

    /// Insert or refresh the peer announced by `beacon`.
    ///
    /// The routable address is always the observed source IP with the
    /// advertised listen port. `last_seen_at` never moves backwards.
    pub fn upsert_at(&self, beacon: &Beacon, source_ip: IpAddr, now: Instant) -> Upsert {
        if beacon.departing {
            return if self.mark_departed(&beacon.id) {
                Upsert::Departed
            } else {
                Upsert::Ignored
            };
        }

        let address = SocketAddr::new(source_ip, beacon.listen_port);
        match self.peers.entry(beacon.id) {
            Entry::Occupied(mut slot) => {
                let peer = slot.get_mut();
                if beacon.sequence <= peer.last_sequence {
                    return Upsert::Ignored;
                }
                if peer.address != address {
                    tracing::info!(
                        peer = %peer.id.short(),
                        old = %peer.address,
                        new = %address,
                        "peer address changed"
                    );
                }
                peer.address = address;
                peer.display_name = beacon.display_name.clone();
                peer.last_sequence = beacon.sequence;
                peer.last_seen_at = peer.last_seen_at.max(now);
                peer.state = PeerState::Active;
                Upsert::Refreshed
            }
            Entry::Vacant(slot) => {
                let peer = Peer {
                    id: beacon.id,
                    display_name: beacon.display_name.clone(),
                    address,
                    last_seen_at: now,
                    last_sequence: beacon.sequence,
                    state: PeerState::Active,
                };
                slot.insert(peer.clone());
                tracing::info!(
                    peer = %peer.id.short(),
                    name = %peer.display_name,
                    addr = %peer.address,
                    "peer joined"
                );
                let _ = self.events.send(PeerEvent::Joined(peer));
                Upsert::Joined
            }
        }
    }

    /// Remove a peer that announced its departure. Returns false if unknown.
    pub fn mark_departed(&self, id: &NodeId) -> bool {
        match self.peers.remove(id) {
            Some((_, peer)) => {
                tracing::info!(peer = %peer.id.short(), name = %peer.display_name, "peer departed");
                let _ = self.events.send(PeerEvent::Departed {
                    peer,
                    reason: DepartReason::Announced,
                });
                true
            }
            None => false,
        }
    }

    /// Evict every peer not heard from within `ttl`. Returns the evicted
    /// peers, marked `Stale`.
    pub fn sweep_stale(&self, now: Instant, ttl: Duration) -> Vec<Peer> {
        let is_stale = |peer: &Peer| now.saturating_duration_since(peer.last_seen_at) > ttl;

        let candidates: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::new();
        for id in candidates {
            // A beacon may have landed between the scan and the removal.
            if let Some((_, mut peer)) = self.peers.remove_if(&id, |_, peer| is_stale(peer)) {
                peer.state = PeerState::Stale;
                tracing::info!(peer = %peer.id.short(), name = %peer.display_name, "peer expired");
                let _ = self.events.send(PeerEvent::Departed {
                    peer: peer.clone(),
                    reason: DepartReason::Expired,
                });
                evicted.push(peer);
            }
        }
        evicted
    }

    /// Snapshot of all active peers, ordered by display name then id.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .filter(|entry| entry.state == PeerState::Active)
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn lookup(&self, id: &NodeId) -> Option<Peer> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Find a single peer by display name, id prefix, IP, or `ip:port`.
    pub fn resolve(&self, target: &str) -> Result<Peer, ResolveError> {
        let target = target.trim();
        let peers = self.list();

        let by_name: Vec<&Peer> = peers.iter().filter(|p| p.display_name == target).collect();
        if !by_name.is_empty() {
            return single(target, by_name);
        }

        if target.len() >= MIN_ID_PREFIX && target.chars().all(|c| c.is_ascii_hexdigit()) {
            let by_id: Vec<&Peer> = peers.iter().filter(|p| p.id.matches_prefix(target)).collect();
            if !by_id.is_empty() {
                return single(target, by_id);
            }
        }

        if let Ok(addr) = target.parse::<SocketAddr>() {
            let by_addr: Vec<&Peer> = peers.iter().filter(|p| p.address == addr).collect();
            return single(target, by_addr);
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            let by_ip: Vec<&Peer> = peers.iter().filter(|p| p.address.ip() == ip).collect();
            return single(target, by_ip);
        }

        Err(ResolveError::NotFound(target.to_string()))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn single(target: &str, matches: Vec<&Peer>) -> Result<Peer, ResolveError> {
    match matches.as_slice() {
        [] => Err(ResolveError::NotFound(target.to_string())),
        [one] => Ok((*one).clone()),
        many => Err(ResolveError::Ambiguous {
            target: target.to_string(),
            candidates: many
                .iter()
                .map(|p| format!("{} ({} @ {})", p.display_name, p.id.short(), p.address))
                .collect(),
        }),
    }
}
