//! The node binds both ports, wires discovery, sessions and transfers
//! together, and owns the shutdown sequence.
//!
//! Everything the user should see is sent as a `NodeEvent` on the channel
//! returned by `Node::start`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use bonjou_core::{BonjouConfig, ConfigError, MessageKind, NodeId, NodeIdentity};
use bonjou_services::{
    ChatDirection, ChatLine, MessageStore, NodeEvent, Peer, PeerEvent, PeerRegistry, ResolveError,
    TransferError, TransferJob,
};

use crate::discovery::{DiscoveryContext, DiscoveryHandle, DiscoveryService, DiscoveryState, TargetSet};
use crate::session::listener::SessionListener;
use crate::session::{
    initiator, MessageSession, OpenedSession, SessionContext, SessionError, SessionEvent, SessionHub,
};
use crate::transfer::TransferManager;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {proto} {addr}: {source}")]
    PortBindFailure {
        proto: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node is shutting down")]
    ShuttingDown,
}

pub struct Node {
    identity: Arc<NodeIdentity>,
    registry: PeerRegistry,
    hub: Arc<SessionHub>,
    transfers: TransferManager,
    history: MessageStore,
    session_addr: SocketAddr,
    discovery_addr: SocketAddr,
    targets: TargetSet,
    discovery_state: watch::Receiver<DiscoveryState>,
    discovery: Mutex<Option<DiscoveryHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Node {
    /// Bind the session and discovery ports and start every task.
    /// Either port failing to bind is fatal.
    pub async fn start(config: BonjouConfig) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let net = &config.network;
        let targets = net.broadcast_targets()?;

        let session_bind = SocketAddr::new(net.bind_addr, net.session_port);
        let bind_err = |proto: &'static str, addr: SocketAddr| {
            move |source: std::io::Error| NodeError::PortBindFailure { proto, addr, source }
        };
        let listener = TcpListener::bind(session_bind)
            .await
            .map_err(bind_err("tcp", session_bind))?;
        let session_addr = listener.local_addr().map_err(bind_err("tcp", session_bind))?;

        let discovery_bind = SocketAddr::new(net.bind_addr, net.discovery_port);
        let discovery = DiscoveryService::bind(discovery_bind, &targets).map_err(bind_err("udp", discovery_bind))?;
        let discovery_addr = discovery.local_addr();

        let local_ip = route_local_ip(&targets).unwrap_or(net.bind_addr);
        let identity = Arc::new(NodeIdentity::generate(
            &config.identity.display_name,
            &SocketAddr::new(local_ip, session_addr.port()),
        ));
        tracing::info!(
            id = %identity.id,
            name = %identity.display_name,
            session = %session_addr,
            discovery = %discovery_addr,
            "node starting"
        );

        let registry = PeerRegistry::new();
        let history = MessageStore::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let hub = SessionHub::new(
            SessionContext {
                identity: identity.clone(),
                listen_port: session_addr.port(),
                max_frame_len: net.max_frame_len,
            },
            opened_tx,
        );
        let transfers = TransferManager::new(
            config.transfer.download_dir.clone(),
            config.transfer.chunk_size,
            events_tx.clone(),
        );

        let peer_task = tokio::spawn(forward_peer_events(
            registry.subscribe(),
            events_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let router_task = tokio::spawn(
            Router {
                transfers: transfers.clone(),
                history: history.clone(),
                events: events_tx,
            }
            .run(opened_rx, shutdown_tx.subscribe()),
        );

        let listener_task = {
            let listener = SessionListener::new(listener, hub.clone(), shutdown_tx.subscribe());
            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    tracing::error!(error = %e, "session listener failed");
                }
            })
        };

        let discovery = discovery.start(DiscoveryContext {
            identity: identity.clone(),
            registry: registry.clone(),
            listen_port: session_addr.port(),
            interval: net.beacon_interval(),
            ttl: net.peer_ttl(),
            sweep_interval: net.sweep_interval(),
            local_ip: match local_ip {
                IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
                _ => None,
            },
            interface_broadcast: net.interface_broadcast,
            same_subnet_only: net.same_subnet_only,
        });

        let node = Self {
            identity,
            registry,
            hub,
            transfers,
            history,
            session_addr,
            discovery_addr,
            targets: discovery.targets(),
            discovery_state: discovery.watch_state(),
            discovery: Mutex::new(Some(discovery)),
            shutdown_tx,
            tasks: Mutex::new(vec![peer_task, router_task, listener_task]),
            stopping: AtomicBool::new(false),
        };
        Ok((node, events_rx))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn id(&self) -> NodeId {
        self.identity.id
    }

    pub fn session_addr(&self) -> SocketAddr {
        self.session_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        *self.discovery_state.borrow()
    }

    /// Also beacon to `target`.
    pub fn add_discovery_target(&self, target: SocketAddr) {
        self.targets.insert(target);
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.list()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> Vec<MessageSession> {
        self.hub.list()
    }

    pub fn is_running(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NodeError::ShuttingDown)
        }
    }

    pub fn resolve(&self, target: &str) -> Result<Peer, NodeError> {
        Ok(self.registry.resolve(target)?)
    }

    /// Open (or reuse) a session with `target`. A target that no beacon
    /// has announced can still be reached as `ip:port`.
    pub async fn connect(&self, target: &str) -> Result<MessageSession, NodeError> {
        self.ensure_running()?;
        match self.registry.resolve(target) {
            Ok(peer) => Ok(self.hub.connect(&peer).await?),
            Err(ResolveError::NotFound(t)) => match target.parse::<SocketAddr>() {
                Ok(addr) => {
                    let pending = initiator::dial(addr, self.hub.context()).await?;
                    Ok(self.hub.register(pending).await?)
                }
                Err(_) => Err(ResolveError::NotFound(t).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn disconnect(&self, target: &str) -> Result<bool, NodeError> {
        let peer = self.resolve_session_peer(target)?;
        Ok(self.hub.disconnect(&peer).await)
    }

    /// A peer id from the registry, or from an open session whose peer
    /// stopped beaconing.
    fn resolve_session_peer(&self, target: &str) -> Result<NodeId, NodeError> {
        match self.registry.resolve(target) {
            Ok(peer) => Ok(peer.id),
            Err(e) => self
                .hub
                .list()
                .into_iter()
                .find(|s| {
                    s.peer_name == target
                        || s.peer.matches_prefix(target)
                        || s.peer_addr.to_string() == target
                })
                .map(|s| s.peer)
                .ok_or_else(|| e.into()),
        }
    }

    pub async fn send_chat(&self, target: &str, text: &str) -> Result<MessageSession, NodeError> {
        let session = self.connect(target).await?;
        session.send_chat(text).await?;
        self.history
            .record(session.peer, &session.peer_name, ChatDirection::Outgoing, text);
        Ok(session)
    }

    /// Chat to every listed peer. Per-peer failures are returned, not raised.
    pub async fn broadcast_chat(&self, text: &str) -> Result<Vec<(Peer, Result<(), NodeError>)>, NodeError> {
        self.ensure_running()?;
        let mut results = Vec::new();
        for peer in self.registry.list() {
            let outcome = async {
                let session = self.hub.connect(&peer).await?;
                session.send_chat(text).await?;
                self.history
                    .record(session.peer, &session.peer_name, ChatDirection::Outgoing, text);
                Ok::<(), NodeError>(())
            }
            .await;
            results.push((peer, outcome));
        }
        Ok(results)
    }

    pub async fn send_file(&self, target: &str, path: &Path) -> Result<TransferJob, NodeError> {
        let session = self.connect(target).await?;
        Ok(self.transfers.offer(&session, path).await?)
    }

    pub async fn accept(&self, job: &str) -> Result<TransferJob, NodeError> {
        self.ensure_running()?;
        Ok(self.transfers.accept(job).await?)
    }

    pub async fn reject(&self, job: &str) -> Result<TransferJob, NodeError> {
        Ok(self.transfers.reject(job).await?)
    }

    pub async fn cancel(&self, job: &str) -> Result<TransferJob, NodeError> {
        Ok(self.transfers.cancel(job).await?)
    }

    pub async fn transfers(&self) -> Vec<TransferJob> {
        self.transfers.list().await
    }

    /// Chat history with one peer, or with everyone.
    pub fn history(&self, target: Option<&str>) -> Result<Vec<(NodeId, ChatLine)>, NodeError> {
        match target {
            Some(target) => {
                let peer = self.resolve_session_peer(target)?;
                Ok(self.history.get(&peer).into_iter().map(|l| (peer, l)).collect())
            }
            None => Ok(self.history.all()),
        }
    }

    /// Stop discovery (with a departure beacon), cancel unfinished
    /// transfers, refuse new sessions and close the open ones, then stop
    /// the remaining tasks.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("node shutting down");

        if let Some(mut discovery) = self.discovery.lock().await.take() {
            discovery.stop().await;
        }
        self.transfers.cancel_all().await;
        self.hub.close_all().await;

        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "node task panicked");
            }
        }
        self.history.clear();
        tracing::info!("node stopped");
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn forward_peer_events(
    mut peers: broadcast::Receiver<PeerEvent>,
    events: mpsc::UnboundedSender<NodeEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            e = peers.recv() => e,
            _ = shutdown.recv() => return,
        };
        let event = match event {
            Ok(PeerEvent::Joined(peer)) => NodeEvent::PeerJoined {
                id: peer.id,
                name: peer.display_name,
                address: peer.address,
            },
            Ok(PeerEvent::Departed { peer, reason }) => NodeEvent::PeerDeparted {
                id: peer.id,
                name: peer.display_name,
                reason,
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "peer events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

/// Dispatches what sessions report: chat to history and the user,
/// transfer messages to the transfer manager, closures to both.
///
/// Each session is served by its own delivery task, so a slow session
/// only holds up its own reader.
#[derive(Clone)]
struct Router {
    transfers: TransferManager,
    history: MessageStore,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Router {
    async fn run(self, mut opened: mpsc::UnboundedReceiver<OpenedSession>, mut shutdown: broadcast::Receiver<()>) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                o = opened.recv() => match o {
                    Some(o) => self.open(&mut sessions, o),
                    None => break,
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.recv() => {
                    tracing::debug!("router shutting down");
                    break;
                }
            }
        }

        // Sessions are closed by now; let each report its closure.
        while let Ok(o) = opened.try_recv() {
            self.open(&mut sessions, o);
        }
        while sessions.join_next().await.is_some() {}
    }

    fn open(&self, sessions: &mut JoinSet<()>, opened: OpenedSession) {
        let OpenedSession { session, inbox } = opened;
        let _ = self.events.send(NodeEvent::SessionOpened {
            peer: session.peer,
            name: session.peer_name.clone(),
            address: session.peer_addr,
        });
        sessions.spawn(self.clone().deliver(session, inbox));
    }

    async fn deliver(self, session: MessageSession, mut inbox: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = inbox.recv().await {
            match event {
                SessionEvent::Message(message) => match message.kind {
                    MessageKind::Chat => {
                        let text = message.text();
                        self.history
                            .record(session.peer, &session.peer_name, ChatDirection::Incoming, &text);
                        let _ = self.events.send(NodeEvent::Chat {
                            from: session.peer,
                            name: session.peer_name.clone(),
                            text,
                        });
                    }
                    MessageKind::Presence => {
                        tracing::debug!(peer = %session.peer.short(), "presence after handshake ignored");
                    }
                    _ => self.transfers.handle_message(&session, &message).await,
                },
                SessionEvent::Closed { reason } => {
                    self.transfers.on_session_closed(session.peer, session.serial).await;
                    let _ = self.events.send(NodeEvent::SessionClosed {
                        peer: session.peer,
                        name: session.peer_name.clone(),
                        reason,
                    });
                }
            }
        }
    }
}

/// The local address the OS would route beacons from.
fn route_local_ip(targets: &[SocketAddr]) -> Option<IpAddr> {
    let target = targets.first()?;
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = std::net::UdpSocket::bind(bind).ok()?;
    let _ = socket.set_broadcast(true);
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
