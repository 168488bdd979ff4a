//! Beacon listener and registry expiry.
//!
//! Valid beacons from other nodes are upserted into the peer registry.
//! Malformed datagrams and beacons from outside the local subnet are
//! logged and dropped.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use bonjou_core::wire::MAX_BEACON_DATAGRAM;
use bonjou_core::{Beacon, NodeId};
use bonjou_services::{PeerRegistry, Upsert};

use super::interfaces::{same_subnet, LocalNetworks};
use super::{DiscoveryContext, TargetSet};

/// Decides which datagram sources are heard at all.
///
/// Loopback and explicitly targeted addresses always are. Other IPv4
/// sources must share this node's subnet.
pub struct SourceFilter {
    enabled: bool,
    local_ip: Option<Ipv4Addr>,
    targets: TargetSet,
    networks: LocalNetworks,
}

impl SourceFilter {
    pub fn new(ctx: &DiscoveryContext, targets: TargetSet) -> Self {
        Self {
            enabled: ctx.same_subnet_only,
            local_ip: ctx.local_ip,
            targets,
            networks: LocalNetworks::new(ctx.interval),
        }
    }

    pub fn admits(&mut self, source: IpAddr) -> bool {
        if !self.enabled || source.is_loopback() || self.targets.iter().any(|t| t.ip() == source) {
            return true;
        }
        match source {
            IpAddr::V4(ip) => same_subnet(self.networks.current(), self.local_ip, ip),
            IpAddr::V6(_) => true,
        }
    }
}

pub async fn listener_loop(
    socket: Arc<UdpSocket>,
    registry: PeerRegistry,
    local_id: NodeId,
    mut filter: SourceFilter,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_BEACON_DATAGRAM * 2];

    tracing::info!("beacon listener starting");

    loop {
        let (len, source) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
            _ = shutdown.recv() => {
                tracing::debug!("beacon listener shutting down");
                return;
            }
        };

        if !filter.admits(source.ip()) {
            tracing::trace!(%source, "beacon from outside the local subnet ignored");
            continue;
        }

        let beacon = match Beacon::decode(&buf[..len]) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(%source, error = %e, "dropping malformed beacon");
                continue;
            }
        };

        if beacon.id == local_id {
            tracing::trace!("ignoring own beacon");
            continue;
        }

        match registry.upsert(&beacon, source) {
            Upsert::Ignored => tracing::trace!(
                peer = %beacon.id.short(),
                seq = beacon.sequence,
                "stale beacon ignored"
            ),
            outcome => tracing::trace!(peer = %beacon.id.short(), ?outcome, "beacon applied"),
        }
    }
}

/// Evict peers that have not beaconed within `ttl`.
pub async fn expiry_loop(
    registry: PeerRegistry,
    ttl: Duration,
    check_every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(check_every);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = registry.sweep_stale(Instant::now(), ttl);
                if !removed.is_empty() {
                    tracing::debug!(removed = removed.len(), "expired peer registry entries");
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}
