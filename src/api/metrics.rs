//! Metrics Collection
//!
//! API-level counters live here; per-chain gauges are rendered from status
//! snapshots at scrape time.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::relay::health::StatusSnapshot;

/// Metrics collector for the relay service
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Blocks handed over through the API
    pub blocks_submitted: AtomicU64,

    /// Submissions refused before broadcast (bad payload or hash)
    pub blocks_rejected: AtomicU64,

    /// Status and health queries served
    pub status_requests: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn inc_blocks_submitted(&self) {
        self.blocks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocks_rejected(&self) {
        self.blocks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_status_requests(&self) {
        self.status_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self, chains: &[StatusSnapshot]) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "# HELP sharepool_relay_uptime_seconds Relay uptime in seconds\n\
             # TYPE sharepool_relay_uptime_seconds gauge\n\
             sharepool_relay_uptime_seconds {}\n\n",
            self.uptime_secs()
        ));

        output.push_str(&format!(
            "# HELP sharepool_relay_api_blocks_submitted Blocks handed over through the API\n\
             # TYPE sharepool_relay_api_blocks_submitted counter\n\
             sharepool_relay_api_blocks_submitted {}\n\n",
            self.blocks_submitted.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP sharepool_relay_api_blocks_rejected Block submissions refused by the API\n\
             # TYPE sharepool_relay_api_blocks_rejected counter\n\
             sharepool_relay_api_blocks_rejected {}\n\n",
            self.blocks_rejected.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# HELP sharepool_relay_api_status_requests Health and status queries served\n\
             # TYPE sharepool_relay_api_status_requests counter\n\
             sharepool_relay_api_status_requests {}\n\n",
            self.status_requests.load(Ordering::Relaxed)
        ));

        // Per-chain series
        let families: [(&str, &str, &str, fn(&StatusSnapshot) -> f64); 13] = [
            ("healthy", "gauge", "1 if the relay reports healthy", |s| {
                f64::from(u8::from(s.health.healthy))
            }),
            ("connections", "gauge", "Live connections, protected included", |s| {
                s.connections.total as f64
            }),
            ("protected_connected", "gauge", "1 if the local-node link is up", |s| {
                f64::from(u8::from(s.health.protected_connection_present))
            }),
            ("known_peers", "gauge", "Records in the peer store", |s| {
                s.database.total_peers as f64
            }),
            ("peers_in_backoff", "gauge", "Endpoints excluded by backoff", |s| {
                s.in_backoff.len() as f64
            }),
            ("blocks_broadcast_total", "counter", "Blocks broadcast", |s| {
                s.broadcast_stats.blocks_sent as f64
            }),
            ("sends_successful_total", "counter", "Successful block sends to peers", |s| {
                s.broadcast_stats.successful_sends as f64
            }),
            ("sends_failed_total", "counter", "Failed block sends to peers", |s| {
                s.broadcast_stats.failed_sends as f64
            }),
            ("rpc_successes_total", "counter", "Accepted RPC block submissions", |s| {
                s.broadcast_stats.rpc_successes as f64
            }),
            ("rpc_failures_total", "counter", "Failed RPC block submissions", |s| {
                s.broadcast_stats.rpc_failures as f64
            }),
            ("local_node_failures_total", "counter", "Failed block sends to the local node", |s| {
                s.broadcast_stats.local_node_failures as f64
            }),
            ("connect_attempts_total", "counter", "Outbound connection attempts", |s| {
                s.connection_stats.total_attempts as f64
            }),
            ("connect_timeouts_total", "counter", "Connection attempts that timed out", |s| {
                s.connection_stats.timeouts as f64
            }),
        ];

        for (name, kind, help, value) in families {
            let _ = writeln!(output, "# HELP sharepool_relay_{} {}", name, help);
            let _ = writeln!(output, "# TYPE sharepool_relay_{} {}", name, kind);
            for snapshot in chains {
                let _ = writeln!(
                    output,
                    "sharepool_relay_{}{{chain=\"{}\"}} {}",
                    name,
                    snapshot.chain,
                    value(snapshot)
                );
            }
            output.push('\n');
        }

        output
    }
}
