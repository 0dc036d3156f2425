//! Per-chain block relay
//!
//! One owner task per chain holds the peer store and the connection table.
//! Everything else (dials, RPC calls, block sends) runs outside it and
//! reports back through the command channel, so no lock is ever held across
//! network I/O and every state change happens on the owner.
//!
//! ```text
//!   RelayHandle ──commands──▶ RelayOwner (PeerStore + ConnectionManager)
//!        │                        ▲
//!        ├─ dial tasks ───────────┤ ConnectFinished
//!        ├─ local node RPC ───────┤ PeerList
//!        └─ fan-out tasks ────────┘ FinishBroadcast
//!   link reader tasks ──────────▶ PeerEvent
//! ```

pub mod broadcast;
pub mod connections;
pub mod discovery;
pub mod health;

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::error::RelayError;
use crate::registry::scoring::adjustments;
use crate::registry::PeerStore;
use crate::transport::{BlockSubmitter, LocalNode, PeerEventSink, PeerLink, PeerTransport};
use crate::types::{
    current_timestamp, BlockHash, BroadcastOutcome, BroadcastReport, GossipAddr, LocalPeerInfo,
    PeerEndpoint, RpcOutcome,
};

use broadcast::{BroadcastStats, BroadcastTarget};
use connections::{ConnectionManager, Disconnect};
use discovery::{DiscoverySummary, PeerListKind};
use health::{HealthInputs, HealthStatus, LowPeerTracker, PeerStatus, StatusSnapshot};

/// External collaborators of one relay
pub struct RelayIo {
    pub transport: Arc<dyn PeerTransport>,
    pub local_node: Arc<dyn LocalNode>,
    /// RPC daemons that also receive every block
    pub submitters: Vec<Arc<dyn BlockSubmitter>>,
}

/// Identity and tuning of one relay
#[derive(Debug, Clone)]
pub struct RelayParams {
    pub chain: String,
    /// The local full node; becomes the protected peer
    pub local_endpoint: PeerEndpoint,
    /// Port assumed for peer-list entries without one
    pub default_port: u16,
    pub settings: RelaySettings,
}

// =============================================================================
// COMMANDS
// =============================================================================

#[derive(Debug)]
enum LinkEvent {
    Gossip(Vec<GossipAddr>),
    BlockInv,
    TxInv,
    Ping,
    Disconnected(String),
}

enum BootstrapTicket {
    /// Caller performs the bootstrap
    Run,
    /// Already bootstrapped
    Done,
    /// Another caller is bootstrapping; resolves when it finishes
    Wait(oneshot::Receiver<()>),
}

struct BroadcastPrep {
    bootstrapped: bool,
    below_min_peers: bool,
}

#[derive(Debug, Clone, Copy)]
enum Maintenance {
    Bootstrap,
    EmergencyRefresh,
    ScheduledRefresh,
    Rotate,
    Fill,
}

enum Command {
    BeginBootstrap {
        reply: oneshot::Sender<BootstrapTicket>,
    },
    PeerList {
        kind: PeerListKind,
        result: Result<Vec<LocalPeerInfo>, RelayError>,
        reply: oneshot::Sender<Result<DiscoverySummary, RelayError>>,
    },
    CheckEmergency {
        reply: oneshot::Sender<bool>,
    },
    PlanConnect {
        rotate: bool,
        reply: oneshot::Sender<Vec<(PeerEndpoint, u64)>>,
    },
    ConnectFinished {
        endpoint: PeerEndpoint,
        link_id: u64,
        result: Result<Arc<dyn PeerLink>, RelayError>,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        endpoint: PeerEndpoint,
        reply: oneshot::Sender<Disconnect>,
    },
    PrepareBroadcast {
        reply: oneshot::Sender<BroadcastPrep>,
    },
    BroadcastTargets {
        reply: oneshot::Sender<Vec<BroadcastTarget>>,
    },
    FinishBroadcast {
        block_hash: Option<String>,
        outcomes: Vec<BroadcastOutcome>,
        rpc_outcomes: Vec<RpcOutcome>,
        elapsed: Duration,
        reply: oneshot::Sender<BroadcastReport>,
    },
    PeerEvent {
        endpoint: PeerEndpoint,
        link_id: u64,
        event: LinkEvent,
    },
    Health {
        reply: oneshot::Sender<HealthStatus>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    Save {
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Shutdown {
        reply: oneshot::Sender<Option<Arc<dyn PeerLink>>>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

struct Shared {
    chain: String,
    settings: RelaySettings,
    io: RelayIo,
}

/// Cheap, cloneable access to one chain's relay
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RelayHandle {
    /// Start the relay for one chain.
    ///
    /// The protected record and the link to the local node are registered
    /// before the owner task starts. If the local node cannot be reached
    /// now, maintenance keeps re-dialling it.
    pub async fn spawn(params: RelayParams, mut store: PeerStore, io: RelayIo) -> RelayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let rpc_endpoints = io.submitters.len();
        let handle = RelayHandle {
            commands: tx,
            shared: Arc::new(Shared {
                chain: params.chain.clone(),
                settings: params.settings.clone(),
                io,
            }),
        };

        let chain = params.chain.clone();
        let local = params.local_endpoint.clone();
        store.register_protected(&local, current_timestamp());

        let mut connections = ConnectionManager::new(&params.settings);
        connections.set_protected(local.clone());

        if let Some(link_id) = connections.begin_dial(&local) {
            let sink = handle.link_sink(&local, link_id);
            let dialled = timeout(
                params.settings.connection_timeout(),
                handle.shared.io.transport.connect(&local, sink),
            )
            .await
            .unwrap_or_else(|_| Err(RelayError::ConnectTimeout(local.clone())));

            match dialled {
                Ok(link) => {
                    connections.on_connected(&local, link_id, link, Instant::now(), current_timestamp());
                    info!("[{}] 🔒 Protected connection to local node {}", chain, local);
                }
                Err(e) => {
                    connections.on_failed(&local, link_id, &e, Instant::now());
                    error!(
                        "[{}] Local node {} unreachable at startup: {} (will keep retrying)",
                        chain, local, e
                    );
                }
            }
        }

        let now = Instant::now();
        let owner = RelayOwner {
            chain: params.chain,
            local: params.local_endpoint,
            default_port: params.default_port,
            // Restored snapshots get a prompt refresh
            last_refresh: None,
            last_rotation: now,
            last_emergency_refresh: None,
            last_bootstrap_attempt: None,
            last_fill: None,
            settings: params.settings,
            store,
            connections,
            broadcast_stats: BroadcastStats::default(),
            low_peers: LowPeerTracker::default(),
            bootstrapping: false,
            bootstrap_waiters: Vec::new(),
            maintenance: None,
            rpc_endpoints,
            commands: handle.commands.downgrade(),
            shared: handle.shared.clone(),
        };
        tokio::spawn(owner.run(rx));

        handle
    }

    pub fn chain(&self) -> &str {
        &self.shared.chain
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.shared.settings
    }

    fn closed(&self) -> RelayError {
        RelayError::Shutdown(self.shared.chain.clone())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn link_sink(&self, endpoint: &PeerEndpoint, link_id: u64) -> Arc<dyn PeerEventSink> {
        Arc::new(LinkEvents {
            endpoint: endpoint.clone(),
            link_id,
            commands: self.commands.downgrade(),
        })
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    /// Seed the store from the local node's peer list and connect.
    /// A second call is a no-op.
    pub async fn bootstrap(&self) -> Result<(), RelayError> {
        match self.request(|reply| Command::BeginBootstrap { reply }).await? {
            BootstrapTicket::Done => Ok(()),
            BootstrapTicket::Wait(done) => {
                let _ = done.await;
                Ok(())
            }
            BootstrapTicket::Run => {
                // Detached so a cancelled caller cannot strand the bootstrap
                let handle = self.clone();
                tokio::spawn(async move { handle.run_bootstrap().await })
                    .await
                    .map_err(|e| RelayError::Shutdown(format!("bootstrap task: {}", e)))?
            }
        }
    }

    async fn run_bootstrap(&self) -> Result<(), RelayError> {
        info!("[{}] 🚀 Bootstrapping from local node", self.chain());

        let result = self.shared.io.local_node.peer_info().await;
        let summary = self
            .request(|reply| Command::PeerList {
                kind: PeerListKind::Bootstrap,
                result,
                reply,
            })
            .await??;

        info!(
            "[{}] ✅ Bootstrap complete: {} new peers, {} filtered",
            self.chain(),
            summary.inserted,
            summary.rejected + summary.malformed
        );

        let connected = self.reconcile().await?;
        info!("[{}] 🔗 Opened {} connections", self.chain(), connected);
        Ok(())
    }

    /// Re-query the local node's peer list
    pub async fn refresh(&self) -> Result<DiscoverySummary, RelayError> {
        let result = self.shared.io.local_node.peer_info().await;
        self.request(|reply| Command::PeerList {
            kind: PeerListKind::Refresh,
            result,
            reply,
        })
        .await?
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Fill free connection slots with the best candidates, refreshing the
    /// peer list first if unprotected connections are below `min_peers`.
    /// Returns the number of new connections.
    pub async fn reconcile(&self) -> Result<usize, RelayError> {
        if self.request(|reply| Command::CheckEmergency { reply }).await? {
            warn!("[{}] ⚠️ Below minimum peers, emergency refresh", self.chain());
            if let Err(e) = self.refresh().await {
                debug!("[{}] Emergency refresh failed: {}", self.chain(), e);
            }
        }
        self.connect_pass(false).await
    }

    /// Replace weak connections with clearly better candidates
    pub async fn rotate(&self) -> Result<usize, RelayError> {
        self.connect_pass(true).await
    }

    async fn connect_pass(&self, rotate: bool) -> Result<usize, RelayError> {
        let dials = self
            .request(|reply| Command::PlanConnect { rotate, reply })
            .await?;
        if dials.is_empty() {
            return Ok(0);
        }

        // Each dial is its own task so an abandoned caller cannot leave a
        // reservation dangling
        let tasks = dials.into_iter().map(|(endpoint, link_id)| {
            let handle = self.clone();
            tokio::spawn(async move { handle.dial(endpoint, link_id).await })
        });

        Ok(join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| matches!(joined, Ok(true)))
            .count())
    }

    async fn dial(&self, endpoint: PeerEndpoint, link_id: u64) -> bool {
        let sink = self.link_sink(&endpoint, link_id);
        let result = timeout(
            self.shared.settings.connection_timeout(),
            self.shared.io.transport.connect(&endpoint, sink),
        )
        .await
        .unwrap_or_else(|_| Err(RelayError::ConnectTimeout(endpoint.clone())));

        let link = result.as_ref().ok().cloned();
        let accepted = self
            .request(|reply| Command::ConnectFinished {
                endpoint: endpoint.clone(),
                link_id,
                result,
                reply,
            })
            .await
            .unwrap_or(false);

        match link {
            Some(link) if accepted => {
                if let Err(e) = link.request_addrs().await {
                    debug!("[{}] getaddr to {} failed: {}", self.chain(), endpoint, e);
                }
                true
            }
            Some(link) => {
                link.close();
                false
            }
            None => false,
        }
    }

    /// Close a connection. Refused for the protected local node.
    pub async fn disconnect(&self, endpoint: &PeerEndpoint) -> Result<Disconnect, RelayError> {
        let endpoint = endpoint.clone();
        self.request(|reply| Command::Disconnect { endpoint, reply })
            .await
    }

    // =========================================================================
    // BROADCAST
    // =========================================================================

    /// Send a block to every live connection and every RPC submitter, all
    /// concurrently. Returns once every send has settled.
    pub async fn broadcast_block(
        &self,
        payload: Vec<u8>,
        block_hash: Option<BlockHash>,
    ) -> Result<BroadcastReport, RelayError> {
        let started = tokio::time::Instant::now();
        let settings = &self.shared.settings;

        let prep = self.request(|reply| Command::PrepareBroadcast { reply }).await?;
        if !prep.bootstrapped {
            if let Err(e) = self.bootstrap().await {
                warn!("[{}] Bootstrap before broadcast failed: {}", self.chain(), e);
            }
        } else if prep.below_min_peers {
            // Best effort: wait at most one connect timeout, let it finish
            // in the background otherwise
            let handle = self.clone();
            let reconcile = tokio::spawn(async move { handle.reconcile().await });
            if timeout(settings.connection_timeout(), reconcile).await.is_err() {
                debug!("[{}] Broadcasting before reconcile finished", self.chain());
            }
        }

        let targets = self.request(|reply| Command::BroadcastTargets { reply }).await?;
        let target_count = targets.len();
        let payload: Arc<[u8]> = Arc::from(payload);

        let (outcomes, rpc_outcomes) = tokio::join!(
            broadcast::fan_out(targets, payload.clone(), settings.send_timeout()),
            broadcast::submit_rpc(&self.shared.io.submitters, payload, settings.rpc_timeout()),
        );

        let report = self
            .request(|reply| Command::FinishBroadcast {
                block_hash: block_hash.map(hex::encode),
                outcomes,
                rpc_outcomes,
                elapsed: started.elapsed(),
                reply,
            })
            .await?;

        info!(
            "[{}] 📡 Block {} sent to {}/{} peers, RPC {}/{} ({} ms)",
            self.chain(),
            report.block_hash.as_deref().unwrap_or("?"),
            report.peer_successes,
            target_count,
            report.rpc_successes,
            report.rpc_successes + report.rpc_failures,
            report.elapsed_millis
        );

        Ok(report)
    }

    // =========================================================================
    // QUERIES & LIFECYCLE
    // =========================================================================

    pub async fn health(&self) -> Result<HealthStatus, RelayError> {
        self.request(|reply| Command::Health { reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, RelayError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Live connections, protected one included
    pub async fn connection_count(&self) -> Result<usize, RelayError> {
        self.request(|reply| Command::ConnectionCount { reply }).await
    }

    /// Persist the peer store now
    pub async fn save(&self) -> Result<(), RelayError> {
        self.request(|reply| Command::Save { reply }).await?
    }

    /// Stop timers, persist the store and close every unprotected
    /// connection.
    ///
    /// The protected link is not closed. It is handed back to the caller,
    /// which keeps the connection to the local node open for as long as it
    /// holds it.
    pub async fn shutdown(&self) -> Result<Option<Arc<dyn PeerLink>>, RelayError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn run_maintenance(&self, action: Maintenance) {
        debug!("[{}] Maintenance: {:?}", self.chain(), action);

        let result = match action {
            Maintenance::Bootstrap => self.bootstrap().await,
            Maintenance::EmergencyRefresh => {
                warn!("[{}] ⚠️ Below minimum peers, emergency refresh", self.chain());
                let _ = self.refresh().await;
                self.connect_pass(false).await.map(drop)
            }
            Maintenance::ScheduledRefresh => {
                let _ = self.refresh().await;
                self.connect_pass(true).await.map(drop)
            }
            Maintenance::Rotate => self.connect_pass(true).await.map(drop),
            Maintenance::Fill => self.connect_pass(false).await.map(drop),
        };

        if let Err(e) = result {
            debug!("[{}] Maintenance {:?} failed: {}", self.chain(), action, e);
        }
    }
}

/// Event sink for one link; forwards into the owner's queue.
/// Holds no strong sender, so open links never keep a relay alive.
struct LinkEvents {
    endpoint: PeerEndpoint,
    link_id: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl LinkEvents {
    fn emit(&self, event: LinkEvent) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let _ = commands.send(Command::PeerEvent {
            endpoint: self.endpoint.clone(),
            link_id: self.link_id,
            event,
        });
    }
}

impl PeerEventSink for LinkEvents {
    fn on_gossip(&self, addrs: Vec<GossipAddr>) {
        self.emit(LinkEvent::Gossip(addrs));
    }

    fn on_block_inv(&self, _hash: BlockHash) {
        self.emit(LinkEvent::BlockInv);
    }

    fn on_tx_inv(&self) {
        self.emit(LinkEvent::TxInv);
    }

    fn on_ping(&self) {
        self.emit(LinkEvent::Ping);
    }

    fn on_disconnect(&self, reason: &str) {
        self.emit(LinkEvent::Disconnected(reason.to_string()));
    }
}

// =============================================================================
// OWNER
// =============================================================================

fn due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    last.map(|last| now.saturating_duration_since(last) >= every)
        .unwrap_or(true)
}

struct RelayOwner {
    chain: String,
    local: PeerEndpoint,
    default_port: u16,
    settings: RelaySettings,

    store: PeerStore,
    connections: ConnectionManager,
    broadcast_stats: BroadcastStats,
    low_peers: LowPeerTracker,

    bootstrapping: bool,
    bootstrap_waiters: Vec<oneshot::Sender<()>>,

    // === Schedule ===
    last_bootstrap_attempt: Option<Instant>,
    last_refresh: Option<Instant>,
    last_emergency_refresh: Option<Instant>,
    last_fill: Option<Instant>,
    last_rotation: Instant,

    /// Running maintenance action, at most one at a time
    maintenance: Option<JoinHandle<()>>,

    rpc_endpoints: usize,

    /// Weak so the queue closes once every external handle is gone
    commands: mpsc::WeakUnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RelayOwner {
    /// A handle for work spawned by the owner, while anyone else holds one
    fn handle(&self) -> Option<RelayHandle> {
        Some(RelayHandle {
            commands: self.commands.upgrade()?,
            shared: self.shared.clone(),
        })
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let reconcile_every = self.settings.reconcile_interval();
        let mut tick = interval_at(tokio::time::Instant::now() + reconcile_every, reconcile_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let save_every = self.settings.save_interval();
        let mut save_tick = interval_at(tokio::time::Instant::now() + save_every, save_every);
        save_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "[{}] 🛰️ Relay running ({} known peers, min {} / max {})",
            self.chain,
            self.store.len(),
            self.settings.min_peers,
            self.settings.max_peers
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        info!("[{}] All relay handles dropped, stopping", self.chain);
                        break;
                    };
                    if let Command::Shutdown { reply } = command {
                        let _ = reply.send(self.shutdown());
                        return;
                    }
                    self.handle_command(command);
                }
                _ = tick.tick() => self.on_tick(),
                _ = save_tick.tick() => self.save_logged(),
            }
        }

        // Nobody is left to take the protected link; it goes with the owner
        let _ = self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::BeginBootstrap { reply } => {
                let _ = reply.send(self.begin_bootstrap());
            }
            Command::PeerList {
                kind,
                result,
                reply,
            } => {
                let _ = reply.send(self.apply_peer_list(kind, result));
            }
            Command::CheckEmergency { reply } => {
                let now = Instant::now();
                let emergency = self.connections.below_min_peers()
                    && due(
                        self.last_emergency_refresh,
                        self.settings.emergency_refresh_cooldown(),
                        now,
                    );
                if emergency {
                    self.last_emergency_refresh = Some(now);
                }
                let _ = reply.send(emergency);
            }
            Command::PlanConnect { rotate, reply } => {
                let _ = reply.send(self.plan_connect(rotate));
            }
            Command::ConnectFinished {
                endpoint,
                link_id,
                result,
                reply,
            } => {
                let _ = reply.send(self.connect_finished(&endpoint, link_id, result));
            }
            Command::Disconnect { endpoint, reply } => {
                let result = self.connections.disconnect(&endpoint);
                if result == Disconnect::Closed {
                    info!("[{}] Disconnected {}", self.chain, endpoint);
                    self.observe_peer_count();
                }
                let _ = reply.send(result);
            }
            Command::PrepareBroadcast { reply } => {
                let _ = reply.send(BroadcastPrep {
                    bootstrapped: self.store.bootstrapped(),
                    below_min_peers: self.connections.below_min_peers(),
                });
            }
            Command::BroadcastTargets { reply } => {
                let targets = self
                    .connections
                    .connections()
                    .filter(|conn| conn.link.is_alive())
                    .map(|conn| BroadcastTarget {
                        endpoint: conn.endpoint.clone(),
                        link: conn.link.clone(),
                        protected: conn.protected,
                    })
                    .collect();
                let _ = reply.send(targets);
            }
            Command::FinishBroadcast {
                block_hash,
                outcomes,
                rpc_outcomes,
                elapsed,
                reply,
            } => {
                let now = current_timestamp();
                broadcast::apply_outcomes(&self.chain, &mut self.store, &outcomes, now);
                let report = self.broadcast_stats.record(
                    &self.chain,
                    block_hash,
                    &outcomes,
                    &rpc_outcomes,
                    elapsed,
                    now,
                );
                let _ = reply.send(report);
            }
            Command::PeerEvent {
                endpoint,
                link_id,
                event,
            } => self.peer_event(&endpoint, link_id, event),
            Command::Health { reply } => {
                let _ = reply.send(self.health());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::ConnectionCount { reply } => {
                let _ = reply.send(self.connections.active_count());
            }
            Command::Save { reply } => {
                let _ = reply.send(self.store.save());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
        }
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    fn begin_bootstrap(&mut self) -> BootstrapTicket {
        if self.store.bootstrapped() {
            return BootstrapTicket::Done;
        }
        if self.bootstrapping {
            let (tx, rx) = oneshot::channel();
            self.bootstrap_waiters.push(tx);
            return BootstrapTicket::Wait(rx);
        }
        self.bootstrapping = true;
        self.last_bootstrap_attempt = Some(Instant::now());
        BootstrapTicket::Run
    }

    fn apply_peer_list(
        &mut self,
        kind: PeerListKind,
        result: Result<Vec<LocalPeerInfo>, RelayError>,
    ) -> Result<DiscoverySummary, RelayError> {
        let outcome = match result {
            Ok(peers) => {
                let now = Instant::now();
                if !self.store.is_protected(&self.local) {
                    self.store.register_protected(&self.local, current_timestamp());
                }

                let summary = discovery::apply_local_peer_list(
                    &mut self.store,
                    &peers,
                    kind,
                    self.default_port,
                    current_timestamp(),
                );
                self.last_refresh = Some(now);

                match kind {
                    PeerListKind::Bootstrap => {
                        self.store.set_bootstrapped(true);
                        // Bootstrap already queried the node; no emergency refresh right after
                        self.last_emergency_refresh = Some(now);
                        self.save_logged();
                    }
                    PeerListKind::Refresh => {
                        self.connections.record_refresh();
                        info!(
                            "[{}] 🔄 Refreshed from local node: {} reported, {} new",
                            self.chain,
                            peers.len(),
                            summary.inserted
                        );
                    }
                }
                Ok(summary)
            }
            Err(e) => {
                warn!(
                    "[{}] Local node peer list unavailable ({:?}): {}",
                    self.chain, kind, e
                );
                Err(e)
            }
        };

        if kind == PeerListKind::Bootstrap {
            self.bootstrapping = false;
            for waiter in self.bootstrap_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }

        outcome
    }

    fn peer_event(&mut self, endpoint: &PeerEndpoint, link_id: u64, event: LinkEvent) {
        let now = current_timestamp();

        match event {
            LinkEvent::Gossip(addrs) => {
                let summary = discovery::apply_gossip(&mut self.store, &addrs, now);
                debug!(
                    "[{}] Gossip from {}: {} addrs, {} new, {} filtered",
                    self.chain,
                    endpoint,
                    addrs.len(),
                    summary.inserted,
                    summary.rejected + summary.malformed
                );
            }
            LinkEvent::BlockInv => {
                if let Some(record) = self.store.get_mut(endpoint) {
                    record.blocks_relayed += 1;
                    record.touch(now);
                }
                self.store.adjust_score(endpoint, adjustments::BLOCK_RELAYED);
            }
            LinkEvent::TxInv => {
                if let Some(record) = self.store.get_mut(endpoint) {
                    record.txs_relayed += 1;
                }
            }
            LinkEvent::Ping => {
                if let Some(record) = self.store.get_mut(endpoint) {
                    record.pings_received += 1;
                }
            }
            LinkEvent::Disconnected(reason) => {
                if self.connections.on_link_closed(endpoint, link_id) {
                    if endpoint == &self.local {
                        error!(
                            "[{}] 🚨 CRITICAL: protected link to local node {} lost: {}",
                            self.chain, endpoint, reason
                        );
                    } else {
                        debug!("[{}] {} disconnected: {}", self.chain, endpoint, reason);
                    }
                    self.observe_peer_count();
                }
            }
        }
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    fn plan_connect(&mut self, rotate: bool) -> Vec<(PeerEndpoint, u64)> {
        let now = Instant::now();
        self.connections.prune_dead();

        let mut evicted = HashSet::new();
        if rotate {
            self.last_rotation = now;
            for rotation in self.connections.rotation_plan(&self.store, now) {
                info!(
                    "[{}] 🔄 Rotating out {} for {}",
                    self.chain, rotation.evict, rotation.candidate
                );
                self.connections.disconnect(&rotation.evict);
                evicted.insert(rotation.evict);
            }
        }

        self.last_fill = Some(now);
        let candidates = self.connections.candidates(&self.store, now);

        candidates
            .into_iter()
            .filter(|endpoint| !evicted.contains(endpoint))
            .filter_map(|endpoint| {
                let link_id = self.connections.begin_dial(&endpoint)?;
                Some((endpoint, link_id))
            })
            .collect()
    }

    fn connect_finished(
        &mut self,
        endpoint: &PeerEndpoint,
        link_id: u64,
        result: Result<Arc<dyn PeerLink>, RelayError>,
    ) -> bool {
        let now = Instant::now();

        let accepted = match result {
            Ok(link) => {
                let registered =
                    self.connections
                        .on_connected(endpoint, link_id, link, now, current_timestamp());
                if registered {
                    if endpoint == &self.local {
                        info!("[{}] 🔒 Protected connection to {} restored", self.chain, endpoint);
                    } else {
                        self.store.adjust_score(endpoint, adjustments::CONNECT_SUCCESS);
                        debug!("[{}] Connected to {}", self.chain, endpoint);
                    }
                    if let Some(record) = self.store.get_mut(endpoint) {
                        record.touch(current_timestamp());
                    }
                }
                registered
            }
            Err(e) => {
                let backoff = self.connections.on_failed(endpoint, link_id, &e, now);
                if endpoint == &self.local {
                    error!("[{}] Reconnect to local node {} failed: {}", self.chain, endpoint, e);
                } else if backoff {
                    info!(
                        "[{}] ⏸️ {} unreachable ({}), backing off {}s",
                        self.chain,
                        endpoint,
                        e,
                        self.settings.backoff_window_secs
                    );
                } else {
                    debug!("[{}] Connect to {} failed: {}", self.chain, endpoint, e);
                }
                false
            }
        };

        self.observe_peer_count();
        accepted
    }

    /// Re-register the protected record and re-dial the local node if its
    /// connection has gone missing
    fn ensure_protected(&mut self) {
        if !self.store.is_protected(&self.local) {
            error!(
                "[{}] 🚨 CRITICAL: protected record for {} missing, re-registering",
                self.chain, self.local
            );
            self.store.register_protected(&self.local, current_timestamp());
        }

        if self.connections.protected_connected() {
            return;
        }

        let Some(handle) = self.handle() else { return };
        if let Some(link_id) = self.connections.begin_dial(&self.local) {
            error!(
                "[{}] 🚨 CRITICAL: protected connection to local node {} missing, re-dialling",
                self.chain, self.local
            );
            let local = self.local.clone();
            tokio::spawn(async move {
                handle.dial(local, link_id).await;
            });
        }
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    fn on_tick(&mut self) {
        let now = Instant::now();

        let dead = self.connections.prune_dead();
        if !dead.is_empty() {
            debug!("[{}] Pruned {} dead links", self.chain, dead.len());
        }
        self.ensure_protected();
        self.observe_peer_count();

        if let Some(task) = &self.maintenance {
            if !task.is_finished() {
                return;
            }
        }

        if let Some(action) = self.next_action(now) {
            let Some(handle) = self.handle() else { return };
            self.maintenance = Some(tokio::spawn(async move {
                handle.run_maintenance(action).await;
            }));
        }
    }

    /// Pick at most one maintenance action, most urgent first
    fn next_action(&mut self, now: Instant) -> Option<Maintenance> {
        let settings = &self.settings;

        if !self.store.bootstrapped() {
            if self.bootstrapping
                || !due(self.last_bootstrap_attempt, settings.emergency_refresh_cooldown(), now)
            {
                return None;
            }
            return Some(Maintenance::Bootstrap);
        }

        if self.connections.below_min_peers() {
            if due(self.last_emergency_refresh, settings.emergency_refresh_cooldown(), now) {
                self.last_emergency_refresh = Some(now);
                return Some(Maintenance::EmergencyRefresh);
            }
            if due(self.last_fill, settings.fill_interval(), now) {
                self.last_fill = Some(now);
                return Some(Maintenance::Fill);
            }
            return None;
        }

        if due(self.last_refresh, settings.refresh_interval(), now) {
            self.last_refresh = Some(now);
            self.last_rotation = now;
            return Some(Maintenance::ScheduledRefresh);
        }

        if due(Some(self.last_rotation), settings.rotation_interval(), now) {
            self.last_rotation = now;
            return Some(Maintenance::Rotate);
        }

        if self.connections.open_slots() > 0 && due(self.last_fill, settings.fill_interval(), now) {
            self.last_fill = Some(now);
            return Some(Maintenance::Fill);
        }

        None
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    fn observe_peer_count(&mut self) {
        self.low_peers.observe(
            self.connections.active_count(),
            self.settings.min_peers,
            Instant::now(),
        );
    }

    fn health(&mut self) -> HealthStatus {
        self.observe_peer_count();
        health::evaluate_health(
            &self.chain,
            &HealthInputs {
                active_connections: self.connections.active_count(),
                min_peers: self.settings.min_peers,
                protected_present: self.connections.protected_connected(),
                bootstrapped: self.store.bootstrapped(),
                success_rate: self.broadcast_stats.success_rate(),
                low_for: self.low_peers.low_for(Instant::now()),
                grace: self.settings.health_grace(),
            },
        )
    }

    fn status(&mut self) -> StatusSnapshot {
        let health = self.health();
        let now = Instant::now();

        let mut peers: Vec<PeerStatus> = self
            .store
            .iter()
            .map(|(endpoint, record)| {
                let connection = self.connections.get(endpoint);
                PeerStatus {
                    address: endpoint.clone(),
                    score: record.score,
                    source: record.source,
                    protected: record.protected,
                    connected: connection.is_some(),
                    connected_since: connection.map(|c| c.connected_at_unix),
                    successful_broadcasts: record.success_count,
                    failed_broadcasts: record.failure_count,
                    success_rate: record.success_rate(),
                    blocks_relayed: record.blocks_relayed,
                    txs_relayed: record.txs_relayed,
                    ping_millis: record.ping_millis,
                    first_seen: record.first_seen,
                    last_seen: record.last_seen,
                }
            })
            .collect();
        health::sort_peer_statuses(&mut peers);

        let stats = self.store.stats();
        let protected = usize::from(self.connections.protected_connected());

        StatusSnapshot {
            chain: self.chain.clone(),
            health,
            local_node: Some(self.local.clone()),
            configuration: self.settings.clone(),
            connections: health::ConnectionSummary {
                total: self.connections.active_count(),
                protected,
                regular: self.connections.unprotected_count(),
                pending: self.connections.pending_count(),
            },
            peers,
            in_backoff: self.connections.backoff_entries(now),
            broadcast_stats: self.broadcast_stats.clone(),
            connection_stats: self.connections.stats().clone(),
            database: health::DatabaseSummary {
                total_peers: stats.total_peers,
                by_source: stats.by_source,
                average_score: stats.average_score,
                snapshot_path: self.store.path().display().to_string(),
            },
            rpc_endpoints: self.rpc_endpoints,
            generated_at: current_timestamp(),
        }
    }

    // =========================================================================
    // PERSISTENCE & SHUTDOWN
    // =========================================================================

    fn save_logged(&self) {
        if let Err(e) = self.store.save() {
            warn!("[{}] Failed to save peer snapshot: {}", self.chain, e);
        }
    }

    /// Returns the protected link so dropping the owner cannot close it
    fn shutdown(&mut self) -> Option<Arc<dyn PeerLink>> {
        if let Some(task) = self.maintenance.take() {
            task.abort();
        }

        let links = self.connections.drain_unprotected();
        for link in &links {
            link.close();
        }

        // A failed save must not cost the caller the protected link
        if let Err(e) = self.store.save() {
            error!("[{}] Failed to save peer snapshot at shutdown: {}", self.chain, e);
        }
        info!(
            "[{}] 🛑 Relay stopped: closed {} connections, {} peers known",
            self.chain,
            links.len(),
            self.store.len()
        );
        self.connections.protected_link()
    }
}
