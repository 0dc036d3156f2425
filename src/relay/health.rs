//! Health verdict and status snapshot
//!
//! Both are read-only views for external observers. Nothing in the relay
//! makes decisions based on them; an unhealthy verdict does not stop
//! propagation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::broadcast::BroadcastStats;
use super::connections::{BackoffEntry, ConnectionStats};
use crate::config::RelaySettings;
use crate::types::{PeerEndpoint, PeerSource, Timestamp};

/// Broadcast success rate below which an issue is reported
pub const LOW_SUCCESS_RATE: f64 = 0.5;

/// Point-in-time health of one chain's relay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub chain: String,
    pub healthy: bool,
    pub active_connections: usize,
    pub protected_connection_present: bool,
    pub bootstrapped: bool,
    pub issues: Vec<String>,
}

/// Tracks how long the peer count has been below the minimum
#[derive(Debug, Clone, Default)]
pub struct LowPeerTracker {
    since: Option<Instant>,
}

impl LowPeerTracker {
    pub fn observe(&mut self, active: usize, min_peers: usize, now: Instant) {
        if active < min_peers {
            self.since.get_or_insert(now);
        } else {
            self.since = None;
        }
    }

    /// How long the count has been low, if it is
    pub fn low_for(&self, now: Instant) -> Option<Duration> {
        self.since.map(|since| now.saturating_duration_since(since))
    }
}

/// Inputs to the health verdict
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub active_connections: usize,
    pub min_peers: usize,
    pub protected_present: bool,
    pub bootstrapped: bool,
    pub success_rate: Option<f64>,
    /// How long the peer count has been below `min_peers`
    pub low_for: Option<Duration>,
    pub grace: Duration,
}

/// Derive the health verdict.
///
/// Unhealthy means the protected connection is missing, or the peer count
/// has stayed low beyond the grace period. Other issues are informational.
pub fn evaluate_health(chain: &str, inputs: &HealthInputs) -> HealthStatus {
    let mut issues = Vec::new();
    let mut healthy = true;

    if !inputs.protected_present {
        issues.push("CRITICAL: protected local-node connection missing".to_string());
        healthy = false;
    }

    if inputs.active_connections < inputs.min_peers {
        let persistent = inputs
            .low_for
            .map(|low_for| low_for > inputs.grace)
            .unwrap_or(false);
        if persistent {
            healthy = false;
            issues.push(format!(
                "low peer count ({} < {}) for over {}s",
                inputs.active_connections,
                inputs.min_peers,
                inputs.grace.as_secs()
            ));
        } else {
            issues.push(format!(
                "low peer count ({} < {}), recovering",
                inputs.active_connections, inputs.min_peers
            ));
        }
    }

    if !inputs.bootstrapped {
        issues.push("not bootstrapped".to_string());
    }

    if let Some(rate) = inputs.success_rate {
        if rate < LOW_SUCCESS_RATE {
            issues.push(format!("low broadcast success rate ({:.0}%)", rate * 100.0));
        }
    }

    HealthStatus {
        chain: chain.to_string(),
        healthy,
        active_connections: inputs.active_connections,
        protected_connection_present: inputs.protected_present,
        bootstrapped: inputs.bootstrapped,
        issues,
    }
}

// =============================================================================
// STATUS SNAPSHOT
// =============================================================================

/// Per-peer line of the status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub address: PeerEndpoint,
    pub score: i64,
    pub source: PeerSource,
    pub protected: bool,
    pub connected: bool,
    pub connected_since: Option<Timestamp>,
    pub successful_broadcasts: u64,
    pub failed_broadcasts: u64,
    pub success_rate: Option<f64>,
    pub blocks_relayed: u64,
    pub txs_relayed: u64,
    pub ping_millis: Option<u64>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub total: usize,
    pub protected: usize,
    pub regular: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub total_peers: usize,
    pub by_source: BTreeMap<String, usize>,
    pub average_score: f64,
    pub snapshot_path: String,
}

/// Full queryable state of one chain's relay
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub chain: String,
    pub health: HealthStatus,
    pub local_node: Option<PeerEndpoint>,
    pub configuration: RelaySettings,
    pub connections: ConnectionSummary,
    /// Connected peers first, then by score
    pub peers: Vec<PeerStatus>,
    pub in_backoff: Vec<BackoffEntry>,
    pub broadcast_stats: BroadcastStats,
    pub connection_stats: ConnectionStats,
    pub database: DatabaseSummary,
    pub rpc_endpoints: usize,
    pub generated_at: Timestamp,
}

/// Sort order of the peer list
pub fn sort_peer_statuses(peers: &mut [PeerStatus]) {
    peers.sort_by(|a, b| {
        b.connected
            .cmp(&a.connected)
            .then_with(|| b.score.cmp(&a.score))
            .then_with(|| a.address.cmp(&b.address))
    });
}
