//! In-memory test doubles for the transport seam

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{BlockSubmitter, LocalNode, PeerEventSink, PeerLink, PeerTransport};
use crate::error::RelayError;
use crate::types::{LocalPeerInfo, PeerEndpoint};

/// How a mock peer reacts to a dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse,
    /// Never answers; the caller's timeout fires
    Hang,
}

#[derive(Debug, Clone, Copy)]
pub struct PeerBehavior {
    pub connect: ConnectBehavior,
    pub send_delay: Duration,
    pub send_fails: bool,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            connect: ConnectBehavior::Accept,
            send_delay: Duration::ZERO,
            send_fails: false,
        }
    }
}

#[derive(Default)]
struct NetworkState {
    behaviors: HashMap<PeerEndpoint, PeerBehavior>,
    connects: HashMap<PeerEndpoint, usize>,
    sends: HashMap<PeerEndpoint, usize>,
    addr_requests: HashMap<PeerEndpoint, usize>,
    sinks: HashMap<PeerEndpoint, Arc<dyn PeerEventSink>>,
    /// Not owning: a link closes once the relay lets go of it
    links: HashMap<PeerEndpoint, Weak<MockLink>>,
    alive: HashMap<PeerEndpoint, Arc<AtomicBool>>,
}

/// A fake network of peers
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, endpoint: &PeerEndpoint, behavior: PeerBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(endpoint.clone(), behavior);
    }

    fn behavior(&self, endpoint: &PeerEndpoint) -> PeerBehavior {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .get(endpoint)
            .copied()
            .unwrap_or_default()
    }

    pub fn connect_count(&self, endpoint: &PeerEndpoint) -> usize {
        self.state.lock().unwrap().connects.get(endpoint).copied().unwrap_or(0)
    }

    pub fn send_count(&self, endpoint: &PeerEndpoint) -> usize {
        self.state.lock().unwrap().sends.get(endpoint).copied().unwrap_or(0)
    }

    pub fn addr_requests(&self, endpoint: &PeerEndpoint) -> usize {
        self.state
            .lock()
            .unwrap()
            .addr_requests
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of sends observed in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Event sink registered by the most recent connect to `endpoint`
    pub fn sink(&self, endpoint: &PeerEndpoint) -> Option<Arc<dyn PeerEventSink>> {
        self.state.lock().unwrap().sinks.get(endpoint).cloned()
    }

    /// The most recent link to `endpoint`, while someone still holds it
    pub fn link(&self, endpoint: &PeerEndpoint) -> Option<Arc<MockLink>> {
        self.state.lock().unwrap().links.get(endpoint).and_then(Weak::upgrade)
    }

    /// Whether the most recent link to `endpoint` is still open.
    /// Closed and dropped links both read as `false`.
    pub fn is_link_alive(&self, endpoint: &PeerEndpoint) -> bool {
        self.state
            .lock()
            .unwrap()
            .alive
            .get(endpoint)
            .map(|alive| alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Simulate the remote side dropping the connection
    pub fn drop_remote(&self, endpoint: &PeerEndpoint) {
        let (alive, sink) = {
            let state = self.state.lock().unwrap();
            (state.alive.get(endpoint).cloned(), state.sinks.get(endpoint).cloned())
        };
        if let Some(alive) = alive {
            alive.store(false, Ordering::SeqCst);
        }
        if let Some(sink) = sink {
            sink.on_disconnect("remote closed");
        }
    }
}

#[async_trait]
impl PeerTransport for MockNetwork {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        sink: Arc<dyn PeerEventSink>,
    ) -> Result<Arc<dyn PeerLink>, RelayError> {
        *self
            .state
            .lock()
            .unwrap()
            .connects
            .entry(endpoint.clone())
            .or_insert(0) += 1;

        match self.behavior(endpoint).connect {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Refuse => return Err(RelayError::ConnectRefused(endpoint.clone())),
            ConnectBehavior::Hang => std::future::pending::<()>().await,
        }

        let alive = Arc::new(AtomicBool::new(true));
        let link = Arc::new(MockLink {
            endpoint: endpoint.clone(),
            network: self.clone(),
            alive: alive.clone(),
        });

        let mut state = self.state.lock().unwrap();
        state.sinks.insert(endpoint.clone(), sink);
        state.links.insert(endpoint.clone(), Arc::downgrade(&link));
        state.alive.insert(endpoint.clone(), alive);
        Ok(link)
    }
}

/// Closes on drop, like a real socket
pub struct MockLink {
    endpoint: PeerEndpoint,
    network: MockNetwork,
    alive: Arc<AtomicBool>,
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerLink for MockLink {
    fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    async fn send_block(&self, _payload: &[u8]) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::LinkClosed(self.endpoint.clone()));
        }

        let behavior = self.network.behavior(&self.endpoint);
        let now = self.network.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.network.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(behavior.send_delay).await;

        self.network.in_flight.fetch_sub(1, Ordering::SeqCst);
        *self
            .network
            .state
            .lock()
            .unwrap()
            .sends
            .entry(self.endpoint.clone())
            .or_insert(0) += 1;

        if behavior.send_fails {
            Err(RelayError::Transport(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )))
        } else {
            Ok(())
        }
    }

    async fn request_addrs(&self) -> Result<(), RelayError> {
        *self
            .network
            .state
            .lock()
            .unwrap()
            .addr_requests
            .entry(self.endpoint.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Local node returning a fixed peer list
#[derive(Default)]
pub struct MockLocalNode {
    peers: Mutex<Vec<LocalPeerInfo>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockLocalNode {
    pub fn new(peers: Vec<LocalPeerInfo>) -> Self {
        Self {
            peers: Mutex::new(peers),
            ..Default::default()
        }
    }

    pub fn set_peers(&self, peers: Vec<LocalPeerInfo>) {
        *self.peers.lock().unwrap() = peers;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalNode for MockLocalNode {
    async fn peer_info(&self) -> Result<Vec<LocalPeerInfo>, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Upstream("connection refused".to_string()));
        }
        Ok(self.peers.lock().unwrap().clone())
    }
}

/// RPC submitter that accepts or rejects every block
pub struct MockSubmitter {
    name: String,
    reject: Option<String>,
    delay: Duration,
    submissions: AtomicUsize,
}

impl MockSubmitter {
    pub fn accepting(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reject: None,
            delay: Duration::ZERO,
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(name: &str, reason: &str) -> Self {
        Self {
            reject: Some(reason.to_string()),
            ..Self::accepting(name)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockSubmitter for MockSubmitter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_block(&self, _payload: &[u8]) -> Result<(), RelayError> {
        tokio::time::sleep(self.delay).await;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        match &self.reject {
            Some(reason) => Err(RelayError::Rejected {
                endpoint: self.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Shorthand for a local-node peer-list entry
pub fn local_peer(address: &str, inbound: bool, ping_millis: Option<u64>) -> LocalPeerInfo {
    LocalPeerInfo {
        address: address.to_string(),
        inbound,
        ping_millis,
        connection_age_secs: None,
    }
}
