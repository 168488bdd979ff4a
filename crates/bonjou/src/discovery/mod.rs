//! Discovery via periodic presence beacons over UDP broadcast.
//!
//! One UDP socket per node, shared by the broadcast and listener tasks, so
//! beacons leave from the port peers are listening on. A third task sweeps
//! the registry for peers that went silent.
//!
//! Beacons go to the configured targets and, unless disabled, to the
//! directed broadcast address of every up IPv4 interface, re-read on each
//! tick. Beacons from outside the local subnet are ignored.
//!
//! Lifecycle: `Starting → Running → Stopped`. While running, broadcasting
//! and listening proceed concurrently.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use bonjou_core::NodeIdentity;
use bonjou_services::PeerRegistry;

pub mod broadcast_loop;
pub mod interfaces;
pub mod listener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Starting,
    Running,
    Stopped,
}

/// Timing and identity the discovery tasks run with.
#[derive(Clone)]
pub struct DiscoveryContext {
    pub identity: Arc<NodeIdentity>,
    pub registry: PeerRegistry,
    /// TCP port advertised in every beacon.
    pub listen_port: u16,
    pub interval: Duration,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Address this node beacons from, for the same-subnet check.
    pub local_ip: Option<Ipv4Addr>,
    /// Also beacon to each interface's directed broadcast address.
    pub interface_broadcast: bool,
    /// Ignore beacons from outside the local subnet.
    pub same_subnet_only: bool,
}

/// Beacon destinations, shared with the running broadcast task.
pub type TargetSet = Arc<DashSet<SocketAddr>>;

/// A bound, not yet running discovery service.
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    targets: TargetSet,
}

impl DiscoveryService {
    /// Bind the discovery socket. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, targets: &[SocketAddr]) -> std::io::Result<Self> {
        let socket = make_discovery_socket(addr)?;
        let socket = UdpSocket::from_std(socket)?;
        let local_addr = socket.local_addr()?;
        let set = DashSet::new();
        for target in targets {
            set.insert(*target);
        }
        tracing::info!(addr = %local_addr, targets = set.len(), "discovery socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            targets: Arc::new(set),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the broadcast, listener and expiry tasks.
    pub fn start(self, ctx: DiscoveryContext) -> DiscoveryHandle {
        let (state_tx, state_rx) = watch::channel(DiscoveryState::Starting);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let broadcast_task = {
            let socket = self.socket.clone();
            let ctx = ctx.clone();
            let targets = self.targets.clone();
            let port = self.local_addr.port();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = broadcast_loop::broadcast_loop(socket, ctx, targets, port, shutdown).await {
                    tracing::error!(error = %e, "beacon broadcast failed");
                }
            })
        };

        let listener_task = {
            let socket = self.socket.clone();
            let registry = ctx.registry.clone();
            let local_id = ctx.identity.id;
            let filter = listener::SourceFilter::new(&ctx, self.targets.clone());
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                listener::listener_loop(socket, registry, local_id, filter, shutdown).await;
            })
        };

        let expiry_task = {
            let registry = ctx.registry.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                listener::expiry_loop(registry, ctx.ttl, ctx.sweep_interval, shutdown).await;
            })
        };

        let _ = state_tx.send(DiscoveryState::Running);

        DiscoveryHandle {
            local_addr: self.local_addr,
            targets: self.targets,
            shutdown: shutdown_tx,
            state: state_tx,
            state_rx,
            tasks: vec![broadcast_task, listener_task, expiry_task],
        }
    }
}

/// Control surface of a running discovery service.
pub struct DiscoveryHandle {
    local_addr: SocketAddr,
    targets: TargetSet,
    shutdown: broadcast::Sender<()>,
    state: watch::Sender<DiscoveryState>,
    state_rx: watch::Receiver<DiscoveryState>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn targets(&self) -> TargetSet {
        self.targets.clone()
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state_rx.clone()
    }

    /// Send the departure beacon and wait for every task to end.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let _ = self.shutdown.send(());
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "discovery task panicked");
            }
        }
        let _ = self.state.send(DiscoveryState::Stopped);
        tracing::info!("discovery stopped");
    }
}

/// Create the UDP socket used for both sending and receiving beacons.
fn make_discovery_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
