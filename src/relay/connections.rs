//! Connection Manager
//!
//! Bookkeeping for live links, dials in progress and retry backoff. Purely
//! synchronous: the relay owner task feeds it connect results and clock
//! readings, and performs all I/O elsewhere.
//!
//! The protected connection (the local full node) is never closed from
//! here. `disconnect` refuses it and `drain_unprotected` skips it.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RelaySettings;
use crate::error::RelayError;
use crate::registry::scoring::ROTATION_SCORE_MARGIN;
use crate::registry::PeerStore;
use crate::transport::PeerLink;
use crate::types::{PeerEndpoint, Timestamp};

// =============================================================================
// STATE
// =============================================================================

/// A live link to one peer
pub struct Connection {
    pub endpoint: PeerEndpoint,
    pub link: Arc<dyn PeerLink>,

    /// Distinguishes this link from earlier ones to the same endpoint
    pub link_id: u64,

    pub connected_at: Instant,
    pub connected_at_unix: Timestamp,

    /// Copied from the peer record
    pub protected: bool,
}

/// Retry bookkeeping for an endpoint that failed to connect
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    pub attempts: u32,
    pub last_failure_at: Option<Instant>,

    /// Set once `attempts` reaches the limit
    pub backoff_until: Option<Instant>,
}

/// Connection attempt counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub refused: u64,
    /// Local-node peer list refreshes
    pub refreshes: u64,
}

/// Outcome of a disconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Closed,
    RefusedProtected,
    NotConnected,
}

/// One endpoint currently excluded by backoff
#[derive(Debug, Clone, Serialize)]
pub struct BackoffEntry {
    pub endpoint: PeerEndpoint,
    pub attempts: u32,
    pub remaining_secs: u64,
}

/// A connected peer to drop and the candidate replacing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub evict: PeerEndpoint,
    pub candidate: PeerEndpoint,
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct ConnectionManager {
    min_peers: usize,
    max_peers: usize,
    max_attempts: u32,
    backoff_window: Duration,

    connections: HashMap<PeerEndpoint, Connection>,

    /// Dials in progress, by link id
    pending: HashMap<PeerEndpoint, u64>,

    attempts: HashMap<PeerEndpoint, AttemptState>,

    protected: Option<PeerEndpoint>,

    next_link_id: u64,

    stats: ConnectionStats,
}

impl ConnectionManager {
    pub fn new(settings: &RelaySettings) -> Self {
        Self {
            min_peers: settings.min_peers,
            max_peers: settings.max_peers,
            max_attempts: settings.max_connection_attempts,
            backoff_window: settings.backoff_window(),
            connections: HashMap::new(),
            pending: HashMap::new(),
            attempts: HashMap::new(),
            protected: None,
            next_link_id: 1,
            stats: ConnectionStats::default(),
        }
    }

    /// Declare the local node's endpoint as protected
    pub fn set_protected(&mut self, endpoint: PeerEndpoint) {
        self.protected = Some(endpoint);
    }

    pub fn protected_endpoint(&self) -> Option<&PeerEndpoint> {
        self.protected.as_ref()
    }

    pub fn is_protected(&self, endpoint: &PeerEndpoint) -> bool {
        self.protected.as_ref() == Some(endpoint)
    }

    /// Whether the protected connection exists and its link is up
    pub fn protected_connected(&self) -> bool {
        self.protected
            .as_ref()
            .and_then(|endpoint| self.connections.get(endpoint))
            .map(|conn| conn.link.is_alive())
            .unwrap_or(false)
    }

    /// Link to the protected peer, if one is established
    pub fn protected_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.protected
            .as_ref()
            .and_then(|endpoint| self.connections.get(endpoint))
            .map(|conn| conn.link.clone())
    }

    // =========================================================================
    // DIALLING
    // =========================================================================

    /// Reserve a dial to `endpoint`. Returns the link id to report back with,
    /// or `None` if the endpoint is already connected or being dialled.
    pub fn begin_dial(&mut self, endpoint: &PeerEndpoint) -> Option<u64> {
        if self.connections.contains_key(endpoint) || self.pending.contains_key(endpoint) {
            return None;
        }

        let link_id = self.next_link_id;
        self.next_link_id += 1;
        self.pending.insert(endpoint.clone(), link_id);
        self.stats.total_attempts += 1;
        Some(link_id)
    }

    /// Register a link opened by a dial reserved with `begin_dial`.
    ///
    /// Returns `false` if the reservation is gone (drained meanwhile); the
    /// caller then owns the link and must close it.
    pub fn on_connected(
        &mut self,
        endpoint: &PeerEndpoint,
        link_id: u64,
        link: Arc<dyn PeerLink>,
        now: Instant,
        now_unix: Timestamp,
    ) -> bool {
        if self.pending.get(endpoint) != Some(&link_id) {
            return false;
        }
        self.pending.remove(endpoint);

        self.attempts.remove(endpoint);
        self.stats.successful += 1;

        let protected = self.is_protected(endpoint);
        self.connections.insert(
            endpoint.clone(),
            Connection {
                endpoint: endpoint.clone(),
                link,
                link_id,
                connected_at: now,
                connected_at_unix: now_unix,
                protected,
            },
        );
        true
    }

    /// Record a failed dial. Returns `true` if the endpoint just entered
    /// backoff.
    pub fn on_failed(
        &mut self,
        endpoint: &PeerEndpoint,
        link_id: u64,
        error: &RelayError,
        now: Instant,
    ) -> bool {
        if self.pending.get(endpoint) == Some(&link_id) {
            self.pending.remove(endpoint);
        }

        self.stats.failed += 1;
        if error.is_timeout() {
            self.stats.timeouts += 1;
        } else if error.is_refused() {
            self.stats.refused += 1;
        }

        // The local node is re-dialled by self-healing, not rationed
        if self.is_protected(endpoint) {
            return false;
        }

        let state = self.attempts.entry(endpoint.clone()).or_default();
        state.attempts += 1;
        state.last_failure_at = Some(now);

        if state.attempts >= self.max_attempts && state.backoff_until.is_none() {
            state.backoff_until = Some(now + self.backoff_window);
            debug!(
                "{} failed {} times, backing off for {}s",
                endpoint,
                state.attempts,
                self.backoff_window.as_secs()
            );
            return true;
        }
        false
    }

    /// Clear attempt state whose backoff has elapsed. The attempt counter
    /// starts again from zero.
    pub fn expire_backoffs(&mut self, now: Instant) -> usize {
        let before = self.attempts.len();
        self.attempts
            .retain(|_, state| state.backoff_until.map(|until| until > now).unwrap_or(true));
        before - self.attempts.len()
    }

    pub fn in_backoff(&self, endpoint: &PeerEndpoint, now: Instant) -> bool {
        self.attempts
            .get(endpoint)
            .and_then(|state| state.backoff_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }

    pub fn attempt_state(&self, endpoint: &PeerEndpoint) -> Option<&AttemptState> {
        self.attempts.get(endpoint)
    }

    /// Endpoints that must not be offered as dial candidates
    pub fn excluded(&self, now: Instant) -> HashSet<PeerEndpoint> {
        let mut excluded: HashSet<PeerEndpoint> = self
            .connections
            .keys()
            .chain(self.pending.keys())
            .cloned()
            .collect();

        excluded.extend(
            self.attempts
                .iter()
                .filter(|(_, state)| state.backoff_until.map(|u| u > now).unwrap_or(false))
                .map(|(endpoint, _)| endpoint.clone()),
        );

        if let Some(protected) = &self.protected {
            excluded.insert(protected.clone());
        }
        excluded
    }

    /// Connections that could still be opened without exceeding `max_peers`
    pub fn open_slots(&self) -> usize {
        let protected_reserved = match &self.protected {
            Some(endpoint) if !self.connections.contains_key(endpoint) => 1,
            _ => 0,
        };
        self.max_peers
            .saturating_sub(self.connections.len() + self.pending.len() + protected_reserved)
    }

    /// Best dial candidates for the free slots
    pub fn candidates(&mut self, store: &PeerStore, now: Instant) -> Vec<PeerEndpoint> {
        self.expire_backoffs(now);
        let slots = self.open_slots();
        if slots == 0 {
            return Vec::new();
        }
        store.top_n(slots, &self.excluded(now))
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Close an unprotected connection. The protected one is refused.
    pub fn disconnect(&mut self, endpoint: &PeerEndpoint) -> Disconnect {
        if self.is_protected(endpoint) {
            warn!("Refusing to disconnect protected local node {}", endpoint);
            return Disconnect::RefusedProtected;
        }

        match self.connections.remove(endpoint) {
            Some(conn) => {
                conn.link.close();
                Disconnect::Closed
            }
            None => Disconnect::NotConnected,
        }
    }

    /// Forget a link the transport reported closed. Events from an older
    /// link to the same endpoint are ignored.
    pub fn on_link_closed(&mut self, endpoint: &PeerEndpoint, link_id: u64) -> bool {
        match self.connections.get(endpoint) {
            Some(conn) if conn.link_id == link_id => {
                self.connections.remove(endpoint);
                true
            }
            _ => false,
        }
    }

    /// Drop connections whose link died without telling us
    pub fn prune_dead(&mut self) -> Vec<PeerEndpoint> {
        let dead: Vec<PeerEndpoint> = self
            .connections
            .values()
            .filter(|conn| !conn.link.is_alive())
            .map(|conn| conn.endpoint.clone())
            .collect();

        for endpoint in &dead {
            self.connections.remove(endpoint);
        }
        dead
    }

    /// Remove every unprotected connection and pending dial, handing back the
    /// links to close. Used at shutdown.
    pub fn drain_unprotected(&mut self) -> Vec<Arc<dyn PeerLink>> {
        self.pending.clear();

        let endpoints: Vec<PeerEndpoint> = self
            .connections
            .values()
            .filter(|conn| !conn.protected)
            .map(|conn| conn.endpoint.clone())
            .collect();

        endpoints
            .iter()
            .filter_map(|endpoint| self.connections.remove(endpoint))
            .map(|conn| conn.link)
            .collect()
    }

    /// Pair the weakest connected peers with stronger unconnected candidates.
    ///
    /// A pair is only proposed when the candidate outscores the connected
    /// peer by at least `ROTATION_SCORE_MARGIN`.
    pub fn rotation_plan(&mut self, store: &PeerStore, now: Instant) -> Vec<Rotation> {
        self.expire_backoffs(now);

        let mut connected: Vec<(i64, PeerEndpoint)> = self
            .connections
            .values()
            .filter(|conn| !conn.protected)
            .map(|conn| {
                let score = store.get(&conn.endpoint).map(|r| r.score).unwrap_or(0);
                (score, conn.endpoint.clone())
            })
            .collect();
        connected.sort();

        let candidates = store.top_n(connected.len(), &self.excluded(now));

        connected
            .into_iter()
            .zip(candidates)
            .take_while(|((weak_score, _), candidate)| {
                let candidate_score = store.get(candidate).map(|r| r.score).unwrap_or(0);
                candidate_score >= weak_score + ROTATION_SCORE_MARGIN
            })
            .map(|((_, evict), candidate)| Rotation { evict, candidate })
            .collect()
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn get(&self, endpoint: &PeerEndpoint) -> Option<&Connection> {
        self.connections.get(endpoint)
    }

    pub fn is_connected(&self, endpoint: &PeerEndpoint) -> bool {
        self.connections.contains_key(endpoint)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Live connections, protected one included
    pub fn active_count(&self) -> usize {
        self.connections.values().filter(|c| c.link.is_alive()).count()
    }

    /// Live unprotected connections
    pub fn unprotected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| !c.protected && c.link.is_alive())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn below_min_peers(&self) -> bool {
        self.unprotected_count() < self.min_peers
    }

    pub fn backoff_entries(&self, now: Instant) -> Vec<BackoffEntry> {
        let mut entries: Vec<BackoffEntry> = self
            .attempts
            .iter()
            .filter_map(|(endpoint, state)| {
                let until = state.backoff_until.filter(|until| *until > now)?;
                Some(BackoffEntry {
                    endpoint: endpoint.clone(),
                    attempts: state.attempts,
                    remaining_secs: until.duration_since(now).as_secs(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        entries
    }

    pub fn record_refresh(&mut self) {
        self.stats.refreshes += 1;
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockNetwork;
    use crate::transport::{PeerEventSink, PeerTransport};
    use crate::types::{BlockHash, GossipAddr, PeerSource};

    struct NullSink;

    impl PeerEventSink for NullSink {
        fn on_gossip(&self, _addrs: Vec<GossipAddr>) {}
        fn on_block_inv(&self, _hash: BlockHash) {}
        fn on_tx_inv(&self) {}
        fn on_ping(&self) {}
        fn on_disconnect(&self, _reason: &str) {}
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            min_peers: 2,
            max_peers: 4,
            ..RelaySettings::default()
        }
    }

    fn ep(last: u8) -> PeerEndpoint {
        PeerEndpoint::new(format!("10.0.0.{}", last), 9333)
    }

    async fn link(network: &MockNetwork, endpoint: &PeerEndpoint) -> Arc<dyn PeerLink> {
        network.connect(endpoint, Arc::new(NullSink)).await.unwrap()
    }

    async fn connect(
        manager: &mut ConnectionManager,
        network: &MockNetwork,
        endpoint: &PeerEndpoint,
        now: Instant,
    ) {
        let id = manager.begin_dial(endpoint).unwrap();
        let link = link(network, endpoint).await;
        assert!(manager.on_connected(endpoint, id, link, now, 1_000));
    }

    fn refused(endpoint: &PeerEndpoint) -> RelayError {
        RelayError::ConnectRefused(endpoint.clone())
    }

    #[test]
    fn test_backoff_after_max_attempts() {
        let mut manager = ConnectionManager::new(&settings());
        let now = Instant::now();

        for attempt in 1..=3 {
            let id = manager.begin_dial(&ep(1)).unwrap();
            let entered = manager.on_failed(&ep(1), id, &refused(&ep(1)), now);
            assert_eq!(entered, attempt == 3);
        }

        assert!(manager.in_backoff(&ep(1), now));
        assert!(manager.excluded(now).contains(&ep(1)));
        assert_eq!(manager.stats().refused, 3);
        assert_eq!(manager.backoff_entries(now)[0].remaining_secs, 300);

        // Window elapsed: eligible again with a fresh counter
        let later = now + Duration::from_secs(301);
        assert!(!manager.in_backoff(&ep(1), later));
        manager.expire_backoffs(later);
        assert!(manager.attempt_state(&ep(1)).is_none());
        assert!(!manager.excluded(later).contains(&ep(1)));
    }

    #[test]
    fn test_timeouts_counted_apart() {
        let mut manager = ConnectionManager::new(&settings());
        let now = Instant::now();

        let id = manager.begin_dial(&ep(1)).unwrap();
        manager.on_failed(&ep(1), id, &RelayError::ConnectTimeout(ep(1)), now);

        assert_eq!(manager.stats().timeouts, 1);
        assert_eq!(manager.stats().refused, 0);
        assert_eq!(manager.attempt_state(&ep(1)).unwrap().attempts, 1);
    }

    #[test]
    fn test_begin_dial_is_exclusive() {
        let mut manager = ConnectionManager::new(&settings());
        assert!(manager.begin_dial(&ep(1)).is_some());
        assert!(manager.begin_dial(&ep(1)).is_none());
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_success_clears_attempts() {
        let network = MockNetwork::new();
        let mut manager = ConnectionManager::new(&settings());
        let now = Instant::now();

        let id = manager.begin_dial(&ep(1)).unwrap();
        manager.on_failed(&ep(1), id, &refused(&ep(1)), now);
        connect(&mut manager, &network, &ep(1), now).await;

        assert!(manager.attempt_state(&ep(1)).is_none());
        assert!(manager.is_connected(&ep(1)));
        assert_eq!(manager.stats().successful, 1);
    }

    #[tokio::test]
    async fn test_protected_never_disconnected() {
        let network = MockNetwork::new();
        let mut manager = ConnectionManager::new(&settings());
        let local = PeerEndpoint::new("127.0.0.1", 9333);
        let now = Instant::now();

        manager.set_protected(local.clone());
        connect(&mut manager, &network, &local, now).await;
        connect(&mut manager, &network, &ep(1), now).await;

        assert_eq!(manager.disconnect(&local), Disconnect::RefusedProtected);
        assert!(manager.protected_connected());

        let drained = manager.drain_unprotected();
        assert_eq!(drained.len(), 1);
        assert!(manager.protected_connected());
        assert_eq!(manager.protected_link().unwrap().endpoint(), &local);
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.unprotected_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_link_events_ignored() {
        let network = MockNetwork::new();
        let mut manager = ConnectionManager::new(&settings());
        let now = Instant::now();

        connect(&mut manager, &network, &ep(1), now).await;
        let current = manager.get(&ep(1)).unwrap().link_id;

        assert!(!manager.on_link_closed(&ep(1), current + 100));
        assert!(manager.is_connected(&ep(1)));
        assert!(manager.on_link_closed(&ep(1), current));
        assert!(!manager.is_connected(&ep(1)));
    }

    #[tokio::test]
    async fn test_candidates_respect_slots_and_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PeerStore::new(dir.path().join("peers.json"), [9333]);
        let network = MockNetwork::new();
        let mut manager = ConnectionManager::new(&settings());
        let local = PeerEndpoint::new("127.0.0.1", 9333);
        let now = Instant::now();

        store.register_protected(&local, 1_000);
        manager.set_protected(local.clone());
        for i in 1..=6u8 {
            store.upsert(&ep(i), PeerSource::LocalNode, 100 + i as i64, 1_000);
        }

        // Protected slot reserved even before it is connected
        assert_eq!(manager.open_slots(), 3);

        connect(&mut manager, &network, &local, now).await;
        connect(&mut manager, &network, &ep(6), now).await;

        let id = manager.begin_dial(&ep(5)).unwrap();
        manager.on_failed(&ep(5), id, &refused(&ep(5)), now);
        for _ in 0..2 {
            let id = manager.begin_dial(&ep(5)).unwrap();
            manager.on_failed(&ep(5), id, &refused(&ep(5)), now);
        }

        let candidates = manager.candidates(&store, now);
        assert_eq!(candidates, vec![ep(4), ep(3)]);
    }

    #[tokio::test]
    async fn test_rotation_plan() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PeerStore::new(dir.path().join("peers.json"), [9333]);
        let network = MockNetwork::new();
        let mut manager = ConnectionManager::new(&settings());
        let now = Instant::now();

        store.upsert(&ep(1), PeerSource::Gossip, 50, 1_000);
        store.upsert(&ep(2), PeerSource::LocalNode, 200, 1_000);
        store.upsert(&ep(3), PeerSource::LocalNode, 60, 1_000);
        store.upsert(&ep(4), PeerSource::LocalNode, 210, 1_000);

        connect(&mut manager, &network, &ep(1), now).await;
        connect(&mut manager, &network, &ep(2), now).await;

        // ep(4) replaces ep(1); ep(3) is not good enough to replace ep(2)
        let plan = manager.rotation_plan(&store, now);
        assert_eq!(
            plan,
            vec![Rotation {
                evict: ep(1),
                candidate: ep(4)
            }]
        );
    }

    #[tokio::test]
    async fn test_prune_dead_links() {
        let network = MockNetwork::new();
        let mut manager = ConnectionManager::new(&settings());
        let now = Instant::now();

        connect(&mut manager, &network, &ep(1), now).await;
        connect(&mut manager, &network, &ep(2), now).await;
        network.link(&ep(1)).unwrap().close();

        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.prune_dead(), vec![ep(1)]);
        assert!(!manager.is_connected(&ep(1)));
    }
}
