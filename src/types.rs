//! Core types for the block-propagation overlay
//!
//! `PeerEndpoint` is the identity key for everything peer-related. Records,
//! connections and attempt counters are all keyed by it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Content hash of a block, as handed over by the consensus engine
pub type BlockHash = [u8; 32];

// =============================================================================
// PEER ENDPOINT
// =============================================================================

/// A dialable `{host, port}` pair. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerEndpoint {
    host: String,
    port: u16,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse an address as reported by a full node.
    ///
    /// Accepts `host:port`, `[v6]:port`, a bare `host` or a bare IPv6
    /// literal; the last two get `default_port`.
    pub fn parse(addr: &str, default_port: u16) -> Result<Self, RelayError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(RelayError::InvalidAddress(addr.to_string()));
        }

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RelayError::InvalidAddress(addr.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(addr, port)?,
                None if tail.is_empty() => default_port,
                None => return Err(RelayError::InvalidAddress(addr.to_string())),
            };
            (host, port)
        } else {
            match addr.matches(':').count() {
                0 => (addr, default_port),
                1 => {
                    let (host, port) = addr
                        .rsplit_once(':')
                        .ok_or_else(|| RelayError::InvalidAddress(addr.to_string()))?;
                    (host, parse_port(addr, port)?)
                }
                // Unbracketed IPv6 literal, no port
                _ => (addr, default_port),
            }
        };

        if host.is_empty() || port == 0 {
            return Err(RelayError::InvalidAddress(addr.to_string()));
        }

        Ok(Self::new(host, port))
    }
}

fn parse_port(addr: &str, port: &str) -> Result<u16, RelayError> {
    port.parse::<u16>()
        .map_err(|_| RelayError::InvalidAddress(addr.to_string()))
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerEndpoint {
    type Err = RelayError;

    /// Strict form used for snapshot keys and config: the port is mandatory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let endpoint = Self::parse(s, 0).map_err(|_| RelayError::InvalidAddress(s.to_string()))?;
        Ok(endpoint)
    }
}

impl Serialize for PeerEndpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerEndpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// PEER RECORD
// =============================================================================

/// Where a peer record was first learned from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    /// Reported by the local full node during bootstrap (or the node itself)
    LocalNode,
    /// Relayed by a connected peer in an address message
    Gossip,
    /// Reported by the local full node during a later refresh
    Refresh,
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerSource::LocalNode => "local_node",
            PeerSource::Gossip => "gossip",
            PeerSource::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// One known peer. Persisted in the snapshot, keyed by its endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Quality score (higher is better)
    pub score: i64,

    /// When the peer was first discovered
    pub first_seen: Timestamp,

    /// When the peer was last seen active
    pub last_seen: Timestamp,

    /// Discovery source
    pub source: PeerSource,

    /// The local full node's own endpoint
    #[serde(default)]
    pub protected: bool,

    /// Blocks the peer accepted
    #[serde(rename = "successful_broadcasts", default)]
    pub success_count: u64,

    /// Blocks that could not be delivered to the peer
    #[serde(rename = "failed_broadcasts", default)]
    pub failure_count: u64,

    /// Round-trip time reported by the local node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_millis: Option<u64>,

    /// Whether the local node dialled this peer itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<bool>,

    #[serde(default)]
    pub blocks_relayed: u64,

    #[serde(default)]
    pub txs_relayed: u64,

    #[serde(default)]
    pub pings_received: u64,
}

impl PeerRecord {
    pub fn new(source: PeerSource, score: i64, now: Timestamp) -> Self {
        Self {
            score,
            first_seen: now,
            last_seen: now,
            source,
            protected: false,
            success_count: 0,
            failure_count: 0,
            ping_millis: None,
            outbound: None,
            blocks_relayed: 0,
            txs_relayed: 0,
            pings_received: 0,
        }
    }

    /// Update last seen timestamp (never moves backwards)
    pub fn touch(&mut self, now: Timestamp) {
        self.last_seen = self.last_seen.max(now);
    }

    /// Fraction of broadcasts this peer accepted, if it has received any
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            None
        } else {
            Some(self.success_count as f64 / total as f64)
        }
    }
}

// =============================================================================
// DISCOVERY INPUTS
// =============================================================================

/// One entry of a peer-address gossip message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipAddr {
    pub host: String,
    pub port: u16,
    /// Last-seen time claimed by the relaying peer
    pub timestamp: Timestamp,
}

/// One entry of the local full node's peer list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPeerInfo {
    /// Address exactly as reported (`host:port`, `[v6]:port`, ...)
    pub address: String,

    /// Whether the remote side initiated the connection
    pub inbound: bool,

    pub ping_millis: Option<u64>,

    pub connection_age_secs: Option<u64>,
}

// =============================================================================
// BROADCAST RESULTS
// =============================================================================

/// Result of one fan-out send
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastOutcome {
    pub endpoint: PeerEndpoint,
    pub protected: bool,
    pub success: bool,
    pub duration_millis: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one JSON-RPC `submitblock` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcOutcome {
    pub endpoint: String,
    pub accepted: bool,
    pub duration_millis: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result of `broadcast_block`. P2P reach and RPC acceptance are
/// reported separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReport {
    pub block_hash: Option<String>,
    pub peer_successes: usize,
    pub peer_failures: usize,
    pub rpc_successes: usize,
    pub rpc_failures: usize,
    /// Outcome of the send to the protected local node, if it was a target
    pub local_node_accepted: Option<bool>,
    pub elapsed_millis: u64,
}

/// Get current Unix timestamp
pub fn current_timestamp() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as Timestamp
}
