//! Router shell: the peer registry, the single-actor event loop and the
//! public API.
//!
//! Every mutation of routing state — tree election, snake paths, peer
//! slots — happens inside one actor task fed by a bounded command channel,
//! so decisions are never observed mid-update. Peer tasks and the public
//! API only ever talk to the actor through [`Command`] messages; reads come
//! back as owned snapshots over oneshot channels. The only state readable
//! without a round-trip is the atomic flag/counter block on each peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::crypto::Identity;
use crate::error::RouterError;
use crate::peer::{self, PeerShared, PeerStatistics};
use crate::queues::BufferPool;
use crate::snake::{
    teardown_path_id, BootstrapAckPayload, BootstrapPayload, SnakeEntry, SnakeIndex, SnakeState,
    TreeView,
};
use crate::tree::{TreeState, TreeUpdate};
use crate::types::{Coordinates, PathId, Port, PublicKey, RootAnnouncement, Watermark};
use crate::wire::Frame;

/// Number of peer slots, including the reserved local port 0.
pub const PORT_COUNT: usize = 64;

/// Tunable timers and capacities. The defaults are the protocol defaults;
/// simulations shrink them to converge faster.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How often the root re-signs and re-broadcasts its announcement.
    pub announcement_interval: Duration,
    /// Age beyond which a peer's announcement no longer counts.
    pub announcement_timeout: Duration,
    /// Parent silence that forces re-selection.
    pub parent_timeout: Duration,
    /// Age beyond which an unrefreshed snake path is torn down.
    pub path_timeout: Duration,
    /// Cadence of snake bootstrap attempts.
    pub bootstrap_interval: Duration,
    /// Actor housekeeping tick.
    pub maintenance_interval: Duration,
    /// How long a ping waits for its pong.
    pub ping_timeout: Duration,
    /// Capacity of the locally-delivered traffic channel.
    pub delivered_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            announcement_interval: Duration::from_secs(30),
            announcement_timeout: Duration::from_secs(45),
            parent_timeout: Duration::from_secs(60),
            path_timeout: Duration::from_secs(300),
            bootstrap_interval: Duration::from_secs(5),
            maintenance_interval: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(10),
            delivered_capacity: 128,
        }
    }
}

/// Options for attaching one peer connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// The remote key we expect, supplied out-of-band (e.g. by a
    /// simulator). The first announcement signed by any other key fails
    /// the link.
    pub expected_key: Option<PublicKey>,
    /// Send keepalives and enforce a read deadline on this link. Off is
    /// useful for in-memory pipes.
    pub keepalives: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            expected_key: None,
            keepalives: true,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_key(mut self, key: PublicKey) -> Self {
        self.expected_key = Some(key);
        self
    }

    pub fn keepalives(mut self, enabled: bool) -> Self {
        self.keepalives = enabled;
        self
    }
}

/// Snapshot of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub port: Port,
    /// Learned from the peer's first valid announcement.
    pub public_key: Option<PublicKey>,
    /// The root the peer last announced, or our root if it never has.
    pub root_public_key: PublicKey,
    pub alive: bool,
    pub statistics: PeerStatistics,
}

/// Snapshot of one keyspace neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnakeNeighbour {
    pub public_key: PublicKey,
    pub path_id: PathId,
}

/// Snapshot of one installed snake path.
#[derive(Debug, Clone)]
pub struct SnakePathInfo {
    pub public_key: PublicKey,
    pub path_id: PathId,
    pub source_port: Port,
    pub destination_port: Port,
    pub root_public_key: PublicKey,
    pub root_sequence: u64,
}

/// Read-only view of the snake state.
#[derive(Debug, Clone, Default)]
pub struct DhtInfo {
    pub ascending: Option<SnakeNeighbour>,
    pub descending: Option<SnakeNeighbour>,
    pub table: Vec<SnakePathInfo>,
    /// Entries whose root or sequence lags the current announcement, plus
    /// duplicate-owner entries.
    pub stale: usize,
}

/// Topology hooks consumed by simulators. Every method has a default
/// no-op body; the router works identically with no observer registered.
pub trait RouterObserver: Send + Sync {
    fn link_up(&self, _local: PublicKey, _remote: PublicKey) {}
    fn link_down(&self, _local: PublicKey, _remote: PublicKey) {}
    fn distance(&self, _local: PublicKey, _remote: PublicKey, _rtt: Duration) {}
}

/// Messages processed by the router actor.
pub(crate) enum Command {
    FrameReceived {
        port: Port,
        peer_id: u64,
        frame: Frame,
    },
    GenerateAnnouncement {
        port: Port,
        peer_id: u64,
    },
    Attach {
        options: ConnectOptions,
        reply: oneshot::Sender<Result<(Port, Arc<PeerShared>), RouterError>>,
    },
    Disconnect {
        port: Port,
        peer_id: u64,
        reason: String,
    },
    DisconnectPort {
        port: Port,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    Inject {
        frame: Frame,
    },
    Ping {
        target: PingTarget,
        resolve: oneshot::Sender<Duration>,
    },
    Coords {
        reply: oneshot::Sender<Coordinates>,
    },
    RootPublicKey {
        reply: oneshot::Sender<PublicKey>,
    },
    ParentPublicKey {
        reply: oneshot::Sender<PublicKey>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Dht {
        reply: oneshot::Sender<DhtInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum PingTarget {
    Tree(Coordinates),
    Snek(PublicKey),
}

/// An overlay router bound to one Ed25519 identity.
///
/// Dropping the handle shuts the actor down; [`Router::shutdown`] does the
/// same gracefully, stopping every peer first.
pub struct Router {
    identity: Identity,
    commands: mpsc::Sender<Command>,
    delivered: mpsc::Receiver<Frame>,
    tree_changed: watch::Receiver<u64>,
    pool: Arc<BufferPool>,
    actor: JoinHandle<()>,
}

/// Builder for a router with non-default wiring.
pub struct RouterBuilder {
    identity: Identity,
    config: RouterConfig,
    observer: Option<Arc<dyn RouterObserver>>,
}

impl RouterBuilder {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            config: RouterConfig::default(),
            observer: None,
        }
    }

    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RouterObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spawn the actor task. Must be called inside a tokio runtime.
    pub fn build(self) -> Router {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (delivered_tx, delivered_rx) = mpsc::channel(self.config.delivered_capacity);
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let pool = Arc::new(BufferPool::new(PORT_COUNT));

        tracing::info!(
            public_key = %self.identity.public_key,
            "router starting"
        );

        let state = RouterState::new(
            self.identity.clone(),
            self.config,
            epoch_tx,
            delivered_tx,
            self.observer,
        );
        let actor = tokio::spawn(state.run(command_rx));

        Router {
            identity: self.identity,
            commands: command_tx,
            delivered: delivered_rx,
            tree_changed: epoch_rx,
            pool,
            actor,
        }
    }
}

impl Router {
    /// Create a router with default configuration and no observer.
    pub fn new(identity: Identity) -> Self {
        RouterBuilder::new(identity).build()
    }

    pub fn builder(identity: Identity) -> RouterBuilder {
        RouterBuilder::new(identity)
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Attach a peer over any duplex byte stream. Returns the allocated
    /// port once the peer tasks are running; liveness follows with the
    /// peer's first valid announcement.
    pub async fn connect<S>(&self, stream: S, options: ConnectOptions) -> Result<Port, RouterError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let keepalives = options.keepalives;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Attach {
                options,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RouterError::Shutdown)?;
        let (port, shared) = reply_rx.await.map_err(|_| RouterError::Shutdown)??;

        let (read_half, write_half) = tokio::io::split(stream);
        peer::spawn(
            shared,
            read_half,
            write_half,
            self.commands.clone(),
            self.tree_changed.clone(),
            self.pool.clone(),
            keepalives,
        );
        Ok(port)
    }

    /// Stop the peer on `port` and invalidate the paths through it.
    pub async fn disconnect(&self, port: Port) -> Result<(), RouterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::DisconnectPort {
                port,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RouterError::Shutdown)?;
        reply_rx.await.map_err(|_| RouterError::Shutdown)?
    }

    /// Inject an origin-local frame at port 0.
    pub async fn send(&self, frame: Frame) -> Result<(), RouterError> {
        self.commands
            .send(Command::Inject { frame })
            .await
            .map_err(|_| RouterError::Shutdown)
    }

    /// Receive the next locally-delivered traffic frame.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.delivered.recv().await
    }

    pub async fn coords(&self) -> Coordinates {
        self.query(|reply| Command::Coords { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn root_public_key(&self) -> PublicKey {
        self.query(|reply| Command::RootPublicKey { reply })
            .await
            .unwrap_or(self.identity.public_key)
    }

    pub async fn parent_public_key(&self) -> PublicKey {
        self.query(|reply| Command::ParentPublicKey { reply })
            .await
            .unwrap_or(self.identity.public_key)
    }

    pub async fn is_root(&self) -> bool {
        self.root_public_key().await == self.identity.public_key
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.query(|reply| Command::Peers { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn dht_info(&self) -> DhtInfo {
        self.query(|reply| Command::Dht { reply })
            .await
            .unwrap_or_default()
    }

    /// Round-trip a ping to a tree coordinate.
    pub async fn tree_ping(&self, destination: Coordinates) -> Result<Duration, RouterError> {
        self.ping(PingTarget::Tree(destination)).await
    }

    /// Round-trip a ping to a keyspace destination.
    pub async fn snek_ping(&self, destination: PublicKey) -> Result<Duration, RouterError> {
        self.ping(PingTarget::Snek(destination)).await
    }

    /// Stop every peer and the actor.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    async fn ping(&self, target: PingTarget) -> Result<Duration, RouterError> {
        let (resolve_tx, resolve_rx) = oneshot::channel();
        // The actor prunes pending pings on its own configured timeout;
        // this is just a generous upper bound for the caller.
        let timeout = Duration::from_secs(30);
        self.commands
            .send(Command::Ping {
                target,
                resolve: resolve_tx,
            })
            .await
            .map_err(|_| RouterError::Shutdown)?;
        match tokio::time::timeout(timeout, resolve_rx).await {
            Ok(Ok(rtt)) => Ok(rtt),
            _ => Err(RouterError::PingTimeout),
        }
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RouterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| RouterError::Shutdown)?;
        reply_rx.await.map_err(|_| RouterError::Shutdown)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

// ── Actor ────────────────────────────────────────────────────────────

struct PeerSlot {
    shared: Arc<PeerShared>,
    options: ConnectOptions,
    public_key: Option<PublicKey>,
    /// Last watermark sequence forwarded out this port, per (ascending
    /// direction, watermark key).
    watermarks: HashMap<(bool, PublicKey), u64>,
}

struct PendingPing {
    resolve: oneshot::Sender<Duration>,
    sent_at: Instant,
    remote: Option<PublicKey>,
}

struct RouterState {
    identity: Identity,
    config: RouterConfig,
    tree: TreeState,
    snake: SnakeState,
    ports: Vec<Option<PeerSlot>>,
    next_peer_id: u64,
    /// Monotone counter feeding watermarks and bootstrap sequences.
    sequence: u64,
    epoch: watch::Sender<u64>,
    delivered: mpsc::Sender<Frame>,
    observer: Option<Arc<dyn RouterObserver>>,
    pending_pings: HashMap<u64, PendingPing>,
    current_bootstrap: Option<PathId>,
    last_bootstrap: Option<Instant>,
    last_root_announcement: Instant,
    shutting_down: bool,
}

impl RouterState {
    fn new(
        identity: Identity,
        config: RouterConfig,
        epoch: watch::Sender<u64>,
        delivered: mpsc::Sender<Frame>,
        observer: Option<Arc<dyn RouterObserver>>,
    ) -> Self {
        let our_key = identity.public_key;
        let tree = TreeState::new(our_key, config.announcement_timeout, config.parent_timeout);
        let snake = SnakeState::new(our_key, config.path_timeout);
        let mut ports = Vec::with_capacity(PORT_COUNT);
        ports.resize_with(PORT_COUNT, || None);
        Self {
            identity,
            config,
            tree,
            snake,
            ports,
            next_peer_id: 1,
            sequence: 0,
            epoch,
            delivered,
            observer,
            pending_pings: HashMap::new(),
            current_bootstrap: None,
            last_bootstrap: None,
            last_root_announcement: Instant::now(),
            shutting_down: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = maintenance.tick() => self.maintenance(),
            }
            if self.shutting_down {
                break;
            }
        }
        tracing::debug!(public_key = %self.identity.public_key, "router actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::FrameReceived {
                port,
                peer_id,
                frame,
            } => {
                if self.slot_matches(port, peer_id) {
                    self.handle_frame(port, frame);
                }
            }
            Command::GenerateAnnouncement { port, peer_id } => {
                if self.slot_matches(port, peer_id) {
                    self.push_announcement(port);
                }
            }
            Command::Attach { options, reply } => {
                let _ = reply.send(self.attach(options));
            }
            Command::Disconnect {
                port,
                peer_id,
                reason,
            } => {
                if self.slot_matches(port, peer_id) {
                    self.disconnect(port, &reason);
                }
            }
            Command::DisconnectPort { port, reply } => {
                let result = if self.slot(port).is_some() {
                    self.disconnect(port, "requested by caller");
                    Ok(())
                } else {
                    Err(RouterError::PeerNotFound(port))
                };
                let _ = reply.send(result);
            }
            Command::Inject { frame } => self.inject(frame),
            Command::Ping { target, resolve } => self.start_ping(target, resolve),
            Command::Coords { reply } => {
                let _ = reply.send(self.tree.coords());
            }
            Command::RootPublicKey { reply } => {
                let _ = reply.send(self.tree.root_public_key());
            }
            Command::ParentPublicKey { reply } => {
                let key = self
                    .tree
                    .parent()
                    .and_then(|p| self.tree.peer_key(p))
                    .unwrap_or(self.identity.public_key);
                let _ = reply.send(key);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.peer_infos());
            }
            Command::Dht { reply } => {
                let _ = reply.send(self.dht_info());
            }
            Command::Shutdown { reply } => {
                let ports: Vec<Port> = (1..PORT_COUNT as Port)
                    .filter(|p| self.slot(*p).is_some())
                    .collect();
                for port in ports {
                    self.disconnect(port, "router shutting down");
                }
                self.shutting_down = true;
                let _ = reply.send(());
            }
        }
    }

    // ── Peer lifecycle ───────────────────────────────────────────────

    fn attach(&mut self, options: ConnectOptions) -> Result<(Port, Arc<PeerShared>), RouterError> {
        let port = (1..PORT_COUNT as Port)
            .find(|p| self.ports[*p as usize].is_none())
            .ok_or(RouterError::TooManyPeers(PORT_COUNT - 1))?;
        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;
        let shared = PeerShared::new(peer_id, port);
        self.ports[port as usize] = Some(PeerSlot {
            shared: shared.clone(),
            options,
            public_key: None,
            watermarks: HashMap::new(),
        });
        tracing::info!(port, "peer attached");
        // Topology changed: everyone re-announces, which also tells the
        // newcomer who we think the root is.
        self.bump_epoch();
        Ok((port, shared))
    }

    fn disconnect(&mut self, port: Port, reason: &str) {
        let Some(slot) = self.ports[port as usize].take() else {
            return;
        };
        let was_alive = slot.shared.alive.load(std::sync::atomic::Ordering::Acquire);
        slot.shared.stop();
        tracing::info!(port, reason, "peer disconnected");

        if was_alive {
            if let (Some(observer), Some(remote)) = (&self.observer, slot.public_key) {
                observer.link_down(self.identity.public_key, remote);
            }
        }

        // Tear down every snake path that ran through the dead link.
        for index in self.snake.paths_via_port(port) {
            if let Some(entry) = self.snake.remove(&index) {
                let other = if entry.source_port == port {
                    entry.destination_port
                } else {
                    entry.source_port
                };
                self.send_teardown(&index, other);
            }
        }

        let now = Instant::now();
        if self.tree.remove_peer(port, now) {
            self.handle_root_change();
        }
        self.bump_epoch();
    }

    fn slot(&self, port: Port) -> Option<&PeerSlot> {
        self.ports.get(port as usize).and_then(|s| s.as_ref())
    }

    fn slot_matches(&self, port: Port, peer_id: u64) -> bool {
        self.slot(port).map(|s| s.shared.id == peer_id).unwrap_or(false)
    }

    fn peer_usable(&self, port: Port) -> bool {
        self.slot(port)
            .map(|s| {
                s.shared.started.load(std::sync::atomic::Ordering::Acquire)
                    && s.shared.alive.load(std::sync::atomic::Ordering::Acquire)
            })
            .unwrap_or(false)
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut infos = Vec::new();
        for port in 1..PORT_COUNT as Port {
            let Some(slot) = self.slot(port) else { continue };
            infos.push(PeerInfo {
                port,
                public_key: slot.public_key,
                root_public_key: self
                    .tree
                    .peer_root(port)
                    .unwrap_or(self.tree.root_public_key()),
                alive: slot.shared.alive.load(std::sync::atomic::Ordering::Acquire),
                statistics: slot.shared.stats.snapshot(),
            });
        }
        infos
    }

    fn dht_info(&self) -> DhtInfo {
        let root = self.tree.root_announcement();
        let ascending = self.snake.ascending().and_then(|idx| {
            self.snake.entry(idx).map(|e| SnakeNeighbour {
                public_key: e.target,
                path_id: idx.path_id,
            })
        });
        let descending = self.snake.descending().map(|idx| SnakeNeighbour {
            public_key: idx.public_key,
            path_id: idx.path_id,
        });
        let table = self
            .snake
            .entries()
            .map(|(idx, e)| SnakePathInfo {
                public_key: idx.public_key,
                path_id: idx.path_id,
                source_port: e.source_port,
                destination_port: e.destination_port,
                root_public_key: e.root_public_key,
                root_sequence: e.root_sequence,
            })
            .collect();
        DhtInfo {
            ascending,
            descending,
            table,
            stale: self
                .snake
                .stale_count(&root.root_public_key, root.root_sequence),
        }
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn tree_view(&self) -> TreeView {
        let now = Instant::now();
        let ann = self.tree.root_announcement();
        let mut peers = Vec::new();
        for port in 1..PORT_COUNT as Port {
            if !self.peer_usable(port) || !self.tree.seen_common_root_recently(port, now) {
                continue;
            }
            if let Some(key) = self.tree.peer_key(port) {
                peers.push((port, key));
            }
        }
        TreeView {
            root_public_key: ann.root_public_key,
            parent: self.tree.parent(),
            ancestors: self.tree.ancestors(),
            peers,
        }
    }

    // ── Announcements ────────────────────────────────────────────────

    fn push_announcement(&mut self, port: Port) {
        let Some(slot) = self.slot(port) else { return };
        if !slot.shared.started.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        if let Some(announcement) = self.tree.generate_announcement(&self.identity, port) {
            if let Some(slot) = self.slot(port) {
                slot.shared
                    .announce
                    .put(Frame::TreeAnnouncement(announcement));
            }
        }
    }

    fn handle_announcement(&mut self, port: Port, announcement: RootAnnouncement) {
        if announcement.signatures.is_empty() || !announcement.verify() {
            tracing::warn!(port, "invalid tree announcement, peer marked dead");
            if let Some(slot) = self.slot(port) {
                slot.shared
                    .alive
                    .store(false, std::sync::atomic::Ordering::Release);
            }
            return;
        }
        let announcer = announcement.announcer();

        enum KeyCheck {
            Accepted { newly_alive: bool },
            HandshakeFailed,
            KeyChanged,
        }
        let check = {
            let Some(slot) = self.ports[port as usize].as_mut() else {
                return;
            };
            match (slot.options.expected_key, slot.public_key) {
                (Some(expected), _) if expected != announcer => KeyCheck::HandshakeFailed,
                (_, Some(known)) if known != announcer => KeyCheck::KeyChanged,
                _ => {
                    slot.public_key = Some(announcer);
                    let newly_alive = !slot
                        .shared
                        .alive
                        .swap(true, std::sync::atomic::Ordering::AcqRel);
                    KeyCheck::Accepted { newly_alive }
                }
            }
        };
        match check {
            KeyCheck::HandshakeFailed => {
                let reason = format!("handshake failed: unexpected remote key {announcer}");
                self.disconnect(port, &reason);
                return;
            }
            KeyCheck::KeyChanged => {
                self.disconnect(port, "peer changed public key mid-session");
                return;
            }
            KeyCheck::Accepted { newly_alive } => {
                if newly_alive {
                    tracing::info!(port, remote = %announcer, "peer alive");
                    if let Some(observer) = &self.observer {
                        observer.link_up(self.identity.public_key, announcer);
                    }
                }
            }
        }

        let now = Instant::now();
        match self.tree.update_announcement(port, announcement, now) {
            TreeUpdate::RootChanged => {
                tracing::debug!(
                    port,
                    root = %self.tree.root_public_key(),
                    coords = %self.tree.coords(),
                    "adopted new root"
                );
                self.handle_root_change();
                self.bump_epoch();
            }
            TreeUpdate::Advanced => {
                self.bump_epoch();
            }
            TreeUpdate::Looped | TreeUpdate::Stored => {}
        }
    }

    /// The root key changed: every snake path is invalid, watermark
    /// history is meaningless and a fresh bootstrap is due.
    fn handle_root_change(&mut self) {
        for (index, entry) in self.snake.clear() {
            self.send_teardown(&index, entry.source_port);
            self.send_teardown(&index, entry.destination_port);
        }
        for slot in self.ports.iter_mut().flatten() {
            slot.watermarks.clear();
        }
        self.current_bootstrap = None;
        self.last_bootstrap = None;
    }

    // ── Frame dispatch ───────────────────────────────────────────────

    fn handle_frame(&mut self, from_port: Port, frame: Frame) {
        match frame {
            Frame::Keepalive => {}
            Frame::TreeAnnouncement(announcement) => {
                self.handle_announcement(from_port, announcement)
            }
            Frame::Bootstrap { .. } => self.handle_bootstrap(from_port, frame),
            Frame::BootstrapAck { .. } => self.handle_bootstrap_ack(from_port, frame),
            Frame::Teardown {
                destination_key,
                ref payload,
            } => self.handle_teardown(from_port, destination_key, payload),
            Frame::TreeRouted { .. } | Frame::TreePing { .. } | Frame::TreePong { .. } => {
                self.forward_tree(from_port, frame)
            }
            Frame::SnekRouted { .. } | Frame::SnekPing { .. } | Frame::SnekPong { .. } => {
                self.forward_snek(from_port, frame)
            }
        }
    }

    fn inject(&mut self, frame: Frame) {
        match frame {
            Frame::TreeRouted { .. } | Frame::TreePing { .. } => self.forward_tree(0, frame),
            Frame::SnekRouted {
                destination_key,
                source_key,
                payload,
                ..
            } => {
                // Stamp a fresh watermark at the origin.
                let watermark = Watermark {
                    public_key: self.identity.public_key,
                    sequence: self.next_sequence(),
                };
                self.forward_snek(
                    0,
                    Frame::SnekRouted {
                        destination_key,
                        source_key,
                        watermark,
                        payload,
                    },
                );
            }
            other => {
                tracing::debug!(frame_type = ?other.frame_type(), "refusing to inject frame type");
            }
        }
    }

    fn forward_tree(&mut self, from_port: Port, frame: Frame) {
        let destination = match &frame {
            Frame::TreeRouted { destination, .. }
            | Frame::TreePing { destination, .. }
            | Frame::TreePong { destination, .. }
            | Frame::BootstrapAck { destination, .. } => destination.clone(),
            _ => return,
        };
        let now = Instant::now();
        let next = self
            .tree
            .next_hop(&destination, now, |port| self.peer_usable(port));
        match next {
            Some(0) => self.deliver_local(from_port, frame),
            Some(port) => self.enqueue(from_port, port, frame),
            None => {
                tracing::debug!(
                    from_port,
                    destination = %destination,
                    frame_type = ?frame.frame_type(),
                    "no route to destination"
                );
                self.count_rx_dropped(from_port);
            }
        }
    }

    fn forward_snek(&mut self, from_port: Port, frame: Frame) {
        let destination_key = match &frame {
            Frame::SnekRouted {
                destination_key, ..
            }
            | Frame::SnekPing {
                destination_key, ..
            }
            | Frame::SnekPong {
                destination_key, ..
            } => *destination_key,
            _ => return,
        };
        let view = self.tree_view();
        let next = self
            .snake
            .next_hop(&destination_key, false, &view, Instant::now());
        if next == 0 {
            self.deliver_local(from_port, frame);
        } else {
            self.enqueue(from_port, next, frame);
        }
    }

    // ── SNEK protocol ────────────────────────────────────────────────

    fn handle_bootstrap(&mut self, from_port: Port, frame: Frame) {
        let Frame::Bootstrap {
            destination_key,
            ref payload,
            ..
        } = frame
        else {
            return;
        };
        let Ok(bootstrap) = BootstrapPayload::unmarshal(payload) else {
            tracing::debug!(from_port, "malformed bootstrap payload");
            return;
        };
        let root = self.tree.root_announcement();
        if bootstrap.root_public_key != root.root_public_key {
            // The sender lives under a different root; coordinates and
            // keyspace decisions would not line up. It will retry.
            return;
        }

        let view = self.tree_view();
        let now = Instant::now();
        let next = self.snake.next_hop(&destination_key, true, &view, now);
        if next != 0 {
            self.enqueue(from_port, next, frame);
            return;
        }

        // The bootstrap terminates with us: we are the closest candidate
        // successor for the bootstrapping key.
        if destination_key == self.identity.public_key {
            return;
        }
        if !bootstrap.verify(&destination_key) {
            tracing::warn!(from_port, "bootstrap signature check failed");
            return;
        }
        if !self
            .snake
            .accepts_descending(&destination_key, &root.root_public_key, now)
        {
            // Not a better predecessor than what we have; let it die and
            // the requester retry after the next interval.
            return;
        }

        // Work out the return route before touching any state.
        let ack_next = self
            .tree
            .next_hop(&bootstrap.source_coords, now, |port| self.peer_usable(port));
        let Some(ack_port) = ack_next.filter(|p| *p != 0) else {
            tracing::debug!(
                from_port,
                coords = %bootstrap.source_coords,
                "no return route for bootstrap"
            );
            return;
        };

        let index = SnakeIndex {
            public_key: destination_key,
            path_id: bootstrap.path_id,
        };
        if let Some(previous) = self.snake.descending().copied() {
            if previous != index {
                self.teardown_local(&previous);
            }
        }
        self.snake.install(
            index,
            SnakeEntry {
                origin: destination_key,
                target: self.identity.public_key,
                source_port: ack_port,
                destination_port: 0,
                root_public_key: root.root_public_key,
                root_sequence: root.root_sequence,
                last_seen: now,
            },
        );
        self.snake.set_descending(index);
        tracing::debug!(
            descending = %destination_key,
            path_id = %bootstrap.path_id,
            "descending neighbour updated"
        );

        let mut ack = BootstrapAckPayload {
            path_id: bootstrap.path_id,
            sequence: bootstrap.sequence,
            destination_key,
            source_key: self.identity.public_key,
            root_public_key: root.root_public_key,
            root_sequence: root.root_sequence,
            signature: [0; 64],
        };
        ack.sign(&self.identity);
        let ack_frame = Frame::BootstrapAck {
            destination: bootstrap.source_coords.clone(),
            source: self.tree.coords(),
            payload: ack.marshal(),
        };
        self.enqueue(0, ack_port, ack_frame);
    }

    fn handle_bootstrap_ack(&mut self, from_port: Port, frame: Frame) {
        let Frame::BootstrapAck {
            ref destination,
            ref payload,
            ..
        } = frame
        else {
            return;
        };
        let Ok(ack) = BootstrapAckPayload::unmarshal(payload) else {
            tracing::debug!(from_port, "malformed bootstrap-ack payload");
            return;
        };
        let root = self.tree.root_announcement();
        if ack.root_public_key != root.root_public_key {
            return;
        }
        let now = Instant::now();
        let index = SnakeIndex {
            public_key: ack.destination_key,
            path_id: ack.path_id,
        };

        if ack.destination_key == self.identity.public_key {
            // We are the bootstrapping requester.
            if !ack.verify() {
                tracing::debug!(from_port, "bootstrap-ack signature check failed");
                return;
            }
            if self.current_bootstrap != Some(ack.path_id)
                || !self
                    .snake
                    .accepts_ascending(&ack.source_key, &root.root_public_key, now)
            {
                // A stale or unwanted acknowledgement: dismantle the path
                // state it just installed on its way here.
                self.send_teardown(&index, from_port);
                return;
            }
            if let Some(previous) = self.snake.ascending().copied() {
                if previous != index {
                    self.teardown_local(&previous);
                }
            }
            self.snake.install(
                index,
                SnakeEntry {
                    origin: self.identity.public_key,
                    target: ack.source_key,
                    source_port: 0,
                    destination_port: from_port,
                    root_public_key: root.root_public_key,
                    root_sequence: root.root_sequence,
                    last_seen: now,
                },
            );
            self.snake.set_ascending(index);
            tracing::debug!(
                ascending = %ack.source_key,
                path_id = %ack.path_id,
                "ascending neighbour updated"
            );
            return;
        }

        // Intermediate hop: install forwarding state and pass it along.
        let next = self
            .tree
            .next_hop(destination, now, |port| self.peer_usable(port));
        let Some(next_port) = next.filter(|p| *p != 0) else {
            tracing::debug!(from_port, "no route to forward bootstrap-ack");
            self.count_rx_dropped(from_port);
            return;
        };
        self.snake.install(
            index,
            SnakeEntry {
                origin: ack.destination_key,
                target: ack.source_key,
                source_port: next_port,
                destination_port: from_port,
                root_public_key: root.root_public_key,
                root_sequence: root.root_sequence,
                last_seen: now,
            },
        );
        self.enqueue(from_port, next_port, frame);
    }

    fn handle_teardown(&mut self, from_port: Port, destination_key: PublicKey, payload: &[u8]) {
        let Ok(path_id) = teardown_path_id(payload) else {
            tracing::debug!(from_port, "malformed teardown payload");
            return;
        };
        let index = SnakeIndex {
            public_key: destination_key,
            path_id,
        };
        let Some(entry) = self.snake.remove(&index) else {
            return;
        };
        // Forward exactly once, along the side we did not hear it from.
        let out = if entry.destination_port == from_port {
            entry.source_port
        } else if entry.source_port == from_port {
            entry.destination_port
        } else {
            0
        };
        self.send_teardown(&index, out);
    }

    /// Remove a locally-held path and notify the far side(s).
    fn teardown_local(&mut self, index: &SnakeIndex) {
        if let Some(entry) = self.snake.remove(index) {
            self.send_teardown(index, entry.source_port);
            self.send_teardown(index, entry.destination_port);
        }
    }

    fn send_teardown(&mut self, index: &SnakeIndex, port: Port) {
        if port == 0 || self.slot(port).is_none() {
            return;
        }
        let frame = Frame::Teardown {
            destination_key: index.public_key,
            payload: index.path_id.0.to_vec(),
        };
        self.enqueue(0, port, frame);
    }

    fn send_bootstrap(&mut self) {
        let root = self.tree.root_announcement();
        let sequence = self.next_sequence();
        let path_id = self
            .snake
            .refresh_path_id(&root.root_public_key, Instant::now())
            .unwrap_or_else(PathId::random);
        let mut payload = BootstrapPayload {
            path_id,
            sequence,
            root_public_key: root.root_public_key,
            root_sequence: root.root_sequence,
            source_coords: self.tree.coords(),
            signature: [0; 64],
        };
        payload.sign(&self.identity);
        let frame = Frame::Bootstrap {
            destination_key: self.identity.public_key,
            watermark: Watermark {
                public_key: self.identity.public_key,
                sequence,
            },
            payload: payload.marshal(),
        };
        let view = self.tree_view();
        let next = self
            .snake
            .next_hop(&self.identity.public_key, true, &view, Instant::now());
        if next != 0 {
            self.current_bootstrap = Some(path_id);
            self.enqueue(0, next, frame);
        }
    }

    // ── Local delivery & queueing ────────────────────────────────────

    fn deliver_local(&mut self, from_port: Port, frame: Frame) {
        match frame {
            Frame::TreeRouted { .. } | Frame::SnekRouted { .. } => {
                if self.delivered.try_send(frame).is_err() {
                    tracing::debug!(from_port, "local delivery channel full, frame dropped");
                    self.count_rx_dropped(from_port);
                }
            }
            Frame::TreePing {
                destination,
                source,
                payload,
            } => {
                let pong = Frame::TreePong {
                    destination: source,
                    source: destination,
                    payload,
                };
                self.forward_tree(0, pong);
            }
            Frame::SnekPing {
                destination_key,
                source_key,
                payload,
                ..
            } => {
                let watermark = Watermark {
                    public_key: self.identity.public_key,
                    sequence: self.next_sequence(),
                };
                let pong = Frame::SnekPong {
                    destination_key: source_key,
                    source_key: destination_key,
                    watermark,
                    payload,
                };
                self.forward_snek(0, pong);
            }
            Frame::TreePong { payload, .. } => self.resolve_ping(&payload, None),
            Frame::SnekPong {
                source_key,
                payload,
                ..
            } => self.resolve_ping(&payload, Some(source_key)),
            _ => {}
        }
    }

    fn resolve_ping(&mut self, payload: &[u8], remote: Option<PublicKey>) {
        let Ok(token_bytes) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        let token = u64::from_be_bytes(token_bytes);
        let Some(pending) = self.pending_pings.remove(&token) else {
            return;
        };
        let rtt = pending.sent_at.elapsed();
        if let Some(observer) = &self.observer {
            if let Some(remote) = remote.or(pending.remote) {
                observer.distance(self.identity.public_key, remote, rtt);
            }
        }
        let _ = pending.resolve.send(rtt);
    }

    fn start_ping(&mut self, target: PingTarget, resolve: oneshot::Sender<Duration>) {
        let token: u64 = rand::random();
        let payload = token.to_be_bytes().to_vec();
        let (frame, remote) = match target {
            PingTarget::Tree(destination) => (
                Frame::TreePing {
                    destination,
                    source: self.tree.coords(),
                    payload,
                },
                None,
            ),
            PingTarget::Snek(destination_key) => (
                Frame::SnekPing {
                    destination_key,
                    source_key: self.identity.public_key,
                    watermark: Watermark {
                        public_key: self.identity.public_key,
                        sequence: self.next_sequence(),
                    },
                    payload,
                },
                Some(destination_key),
            ),
        };
        self.pending_pings.insert(
            token,
            PendingPing {
                resolve,
                sent_at: Instant::now(),
                remote,
            },
        );
        if matches!(frame, Frame::TreePing { .. }) {
            self.forward_tree(0, frame);
        } else {
            self.forward_snek(0, frame);
        }
    }

    /// Push a frame onto the right outbound queue of `port`, applying the
    /// watermark rule to SNEK frames.
    fn enqueue(&mut self, from_port: Port, port: Port, frame: Frame) {
        if port == from_port && from_port != 0 {
            // Never bounce a frame straight back where it came from.
            self.count_rx_dropped(from_port);
            return;
        }
        let our_key = self.identity.public_key;
        let Some(slot) = self.ports[port as usize].as_mut() else {
            self.count_rx_dropped(from_port);
            return;
        };

        if let Some(watermark) = frame.watermark() {
            let destination_key = match &frame {
                Frame::Bootstrap {
                    destination_key, ..
                }
                | Frame::SnekRouted {
                    destination_key, ..
                }
                | Frame::SnekPing {
                    destination_key, ..
                }
                | Frame::SnekPong {
                    destination_key, ..
                } => *destination_key,
                _ => our_key,
            };
            let ascending = destination_key >= our_key;
            let slot_key = (ascending, watermark.public_key);
            if let Some(&last) = slot.watermarks.get(&slot_key) {
                if watermark.sequence <= last {
                    tracing::debug!(
                        port,
                        key = %watermark.public_key,
                        sequence = watermark.sequence,
                        last,
                        "stale watermark, frame dropped"
                    );
                    if frame.is_proto() {
                        slot.shared
                            .stats
                            .tx_proto_dropped
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    } else {
                        slot.shared
                            .stats
                            .tx_traffic_dropped
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    return;
                }
            }
            slot.watermarks.insert(slot_key, watermark.sequence);
        }

        if frame.is_proto() {
            if slot.shared.proto_out.push(frame) {
                slot.shared
                    .stats
                    .tx_proto_successful
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            } else {
                tracing::debug!(port, "proto queue full, frame dropped");
                slot.shared
                    .stats
                    .tx_proto_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        } else {
            let evicted = slot.shared.traffic_out.push(frame);
            slot.shared
                .stats
                .tx_traffic_successful
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if evicted {
                slot.shared
                    .stats
                    .tx_traffic_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    fn count_rx_dropped(&self, from_port: Port) {
        if let Some(slot) = self.slot(from_port) {
            slot.shared
                .stats
                .rx_dropped_no_destination
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────

    fn maintenance(&mut self) {
        let now = Instant::now();

        // A silent parent forces a fresh election.
        if self.tree.parent_timed_out(now) {
            tracing::debug!("parent timed out, reselecting");
            if self.tree.reselect_parent(now) {
                self.handle_root_change();
            }
            self.bump_epoch();
        }

        // Periodic root re-announcement with a fresh sequence.
        if self.tree.is_root()
            && now.duration_since(self.last_root_announcement) >= self.config.announcement_interval
        {
            self.tree.advance_sequence();
            self.last_root_announcement = now;
            self.bump_epoch();
        }

        // Expire stale snake paths.
        for index in self.snake.expired(now) {
            self.teardown_local(&index);
        }

        // Keep the snake fed: re-bootstrap on a fixed cadence, which both
        // repairs a missing ascending edge and refreshes a live one.
        let due = match self.last_bootstrap {
            Some(at) => now.duration_since(at) >= self.config.bootstrap_interval,
            None => true,
        };
        if due {
            self.last_bootstrap = Some(now);
            self.send_bootstrap();
        }

        // Forget pings that will never come back.
        self.pending_pings
            .retain(|_, pending| now.duration_since(pending.sent_at) < self.config.ping_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_tree_delivery() {
        let mut router = Router::new(Identity::generate());
        let frame = Frame::TreeRouted {
            destination: Coordinates::default(),
            source: Coordinates::default(),
            payload: b"to myself".to_vec(),
        };
        router.send(frame.clone()).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(1), router.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, frame);
    }

    #[tokio::test]
    async fn local_snek_ping() {
        let router = Router::new(Identity::generate());
        let key = router.public_key();
        let rtt = router.snek_ping(key).await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn lone_router_is_root() {
        let router = Router::new(Identity::generate());
        assert!(router.is_root().await);
        assert!(router.coords().await.is_empty());
        assert!(router.peers().await.is_empty());
        let dht = router.dht_info().await;
        assert!(dht.ascending.is_none());
        assert!(dht.descending.is_none());
        assert!(dht.table.is_empty());
    }

    #[tokio::test]
    async fn too_many_peers_is_reported() {
        let router = Router::new(Identity::generate());
        let mut ports = Vec::new();
        // Hold the far ends open so EOF does not free slots mid-test.
        let mut remotes = Vec::new();
        for _ in 1..PORT_COUNT {
            let (local, remote) = tokio::io::duplex(256);
            let port = router
                .connect(local, ConnectOptions::default())
                .await
                .unwrap();
            ports.push(port);
            remotes.push(remote);
        }
        let (local, remote) = tokio::io::duplex(256);
        remotes.push(remote);
        let err = router
            .connect(local, ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::TooManyPeers(_)));

        // Disconnecting frees the slot again.
        router.disconnect(ports[0]).await.unwrap();
        let (local, remote) = tokio::io::duplex(256);
        remotes.push(remote);
        assert_eq!(
            router.connect(local, ConnectOptions::default()).await.unwrap(),
            ports[0]
        );
    }

    #[tokio::test]
    async fn disconnect_unknown_port_errors() {
        let router = Router::new(Identity::generate());
        assert!(matches!(
            router.disconnect(7).await,
            Err(RouterError::PeerNotFound(7))
        ));
    }

    /// A router state driven directly, with no actor task behind it.
    fn bare_state() -> RouterState {
        let (epoch_tx, _) = watch::channel(0u64);
        let (delivered_tx, _) = mpsc::channel(8);
        RouterState::new(
            Identity::generate(),
            RouterConfig::default(),
            epoch_tx,
            delivered_tx,
            None,
        )
    }

    #[tokio::test]
    async fn watermarks_are_strictly_monotone_per_link() {
        let mut state = bare_state();
        let (from, _shared_from) = state.attach(ConnectOptions::default()).unwrap();
        let (out, shared_out) = state.attach(ConnectOptions::default()).unwrap();

        let wm_key = PublicKey([7u8; 32]);
        let frame = |seq: u64| Frame::SnekRouted {
            destination_key: PublicKey([1u8; 32]),
            source_key: wm_key,
            watermark: Watermark {
                public_key: wm_key,
                sequence: seq,
            },
            payload: vec![],
        };

        state.enqueue(from, out, frame(5));
        let stats = shared_out.stats.snapshot();
        assert_eq!(stats.tx_traffic_successful, 1);
        assert_eq!(stats.tx_traffic_dropped, 0);

        // Same watermark again: refused — a loop would replay it.
        state.enqueue(from, out, frame(5));
        let stats = shared_out.stats.snapshot();
        assert_eq!(stats.tx_traffic_successful, 1);
        assert_eq!(stats.tx_traffic_dropped, 1);

        // A lower sequence is refused too.
        state.enqueue(from, out, frame(4));
        assert_eq!(shared_out.stats.snapshot().tx_traffic_dropped, 2);

        // Strictly greater passes.
        state.enqueue(from, out, frame(6));
        assert_eq!(shared_out.stats.snapshot().tx_traffic_successful, 2);

        // A different watermark key is tracked independently.
        let other = Frame::SnekRouted {
            destination_key: PublicKey([1u8; 32]),
            source_key: PublicKey([9u8; 32]),
            watermark: Watermark {
                public_key: PublicKey([9u8; 32]),
                sequence: 1,
            },
            payload: vec![],
        };
        state.enqueue(from, out, other);
        assert_eq!(shared_out.stats.snapshot().tx_traffic_successful, 3);
    }

    #[tokio::test]
    async fn proto_queue_overflow_drops_and_counts() {
        let mut state = bare_state();
        let (_, _shared_a) = state.attach(ConnectOptions::default()).unwrap();
        let (out, shared_out) = state.attach(ConnectOptions::default()).unwrap();

        let teardown = |tag: u8| Frame::Teardown {
            destination_key: PublicKey([tag; 32]),
            payload: vec![0; 8],
        };
        for tag in 0..crate::queues::QUEUE_CAPACITY as u8 {
            state.enqueue(0, out, teardown(tag));
        }
        let stats = shared_out.stats.snapshot();
        assert_eq!(stats.tx_proto_successful, crate::queues::QUEUE_CAPACITY as u64);

        // One more proto frame fails the push; nothing is evicted.
        state.enqueue(0, out, teardown(0xff));
        let stats = shared_out.stats.snapshot();
        assert_eq!(stats.tx_proto_successful, crate::queues::QUEUE_CAPACITY as u64);
        assert_eq!(stats.tx_proto_dropped, 1);
    }
}
