//! Beacon broadcast.
//!
//! Sends this node's beacon to every target once per interval, with a
//! strictly increasing sequence. On shutdown sends one final beacon
//! flagged as a departure.
//!
//! Targets are the configured set plus, when enabled, the directed
//! broadcast of each interface, recomputed for every beacon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;

use bonjou_core::Beacon;

use super::interfaces::{broadcast_networks, directed_broadcasts};
use super::{DiscoveryContext, TargetSet};

pub async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    ctx: DiscoveryContext,
    targets: TargetSet,
    discovery_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut beacon = Beacon {
        id: ctx.identity.id,
        display_name: ctx.identity.display_name.clone(),
        listen_port: ctx.listen_port,
        sequence: 0,
        departing: false,
    };
    let mut interval = time::interval(ctx.interval);

    tracing::info!(
        interval_ms = ctx.interval.as_millis() as u64,
        listen_port = ctx.listen_port,
        interface_broadcast = ctx.interface_broadcast,
        "beacon broadcast starting"
    );
    let destinations = || {
        let mut dests: Vec<SocketAddr> = targets.iter().map(|t| *t).collect();
        if ctx.interface_broadcast {
            for dest in directed_broadcasts(&broadcast_networks(), discovery_port) {
                if !dests.contains(&dest) {
                    dests.push(dest);
                }
            }
        }
        dests
    };

    loop {
        tokio::select! {
            _ = interval.tick() => {
                beacon.sequence += 1;
                send_beacon(&socket, &beacon, &destinations()).await?;
            }
            _ = shutdown.recv() => {
                beacon.sequence += 1;
                beacon.departing = true;
                send_beacon(&socket, &beacon, &destinations()).await?;
                tracing::info!(sequence = beacon.sequence, "departure beacon sent");
                return Ok(());
            }
        }
    }
}

/// Send one beacon to every destination. A failing one does not stop the others.
async fn send_beacon(socket: &UdpSocket, beacon: &Beacon, dests: &[SocketAddr]) -> Result<()> {
    let bytes = beacon.encode().context("failed to encode beacon")?;
    for &dest in dests {
        match socket.send_to(&bytes, dest).await {
            Ok(n) => tracing::trace!(%dest, bytes = n, seq = beacon.sequence, "beacon sent"),
            Err(e) => tracing::warn!(%dest, error = %e, "beacon send failed"),
        }
    }
    Ok(())
}
