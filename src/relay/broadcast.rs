//! Block fan-out
//!
//! Every live link gets its own task; the call settles when all of them
//! have. RPC submissions run alongside and are counted separately.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

use crate::error::RelayError;
use crate::registry::PeerStore;
use crate::transport::{BlockSubmitter, PeerLink};
use crate::types::{BroadcastOutcome, BroadcastReport, PeerEndpoint, RpcOutcome, Timestamp};

/// One link to send to
#[derive(Clone)]
pub struct BroadcastTarget {
    pub endpoint: PeerEndpoint,
    pub link: Arc<dyn PeerLink>,
    pub protected: bool,
}

/// Send `payload` to every target concurrently.
///
/// Each send is bounded by `send_timeout`; a timeout counts as a failure.
pub async fn fan_out(
    targets: Vec<BroadcastTarget>,
    payload: Arc<[u8]>,
    send_timeout: Duration,
) -> Vec<BroadcastOutcome> {
    let meta: Vec<(PeerEndpoint, bool)> = targets
        .iter()
        .map(|t| (t.endpoint.clone(), t.protected))
        .collect();

    let handles: Vec<_> = targets
        .into_iter()
        .map(|target| {
            let payload = payload.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = match timeout(send_timeout, target.link.send_block(&payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::SendTimeout(target.endpoint.clone())),
                };
                (result, started.elapsed())
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(meta)
        .map(|(joined, (endpoint, protected))| {
            let (result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => (
                    Err(RelayError::Shutdown(format!("send task failed: {}", e))),
                    Duration::ZERO,
                ),
            };
            BroadcastOutcome {
                endpoint,
                protected,
                success: result.is_ok(),
                duration_millis: elapsed.as_millis() as u64,
                error: result.err().map(|e| e.to_string()),
            }
        })
        .collect()
}

/// Submit `payload` to every RPC daemon concurrently
pub async fn submit_rpc(
    submitters: &[Arc<dyn BlockSubmitter>],
    payload: Arc<[u8]>,
    rpc_timeout: Duration,
) -> Vec<RpcOutcome> {
    let calls = submitters.iter().map(|submitter| {
        let payload = payload.clone();
        async move {
            let started = Instant::now();
            let result = match timeout(rpc_timeout, submitter.submit_block(&payload)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::Upstream(format!(
                    "submitblock to {} timed out",
                    submitter.name()
                ))),
            };
            RpcOutcome {
                endpoint: submitter.name().to_string(),
                accepted: result.is_ok(),
                duration_millis: started.elapsed().as_millis() as u64,
                error: result.err().map(|e| e.to_string()),
            }
        }
    });

    join_all(calls).await
}

/// Feed send outcomes back into peer scores
pub fn apply_outcomes(chain: &str, store: &mut PeerStore, outcomes: &[BroadcastOutcome], now: Timestamp) {
    for outcome in outcomes {
        store.record_broadcast(&outcome.endpoint, outcome.success, now);

        if outcome.success {
            continue;
        }
        let reason = outcome.error.as_deref().unwrap_or("unknown error");
        if outcome.protected {
            // This is the node's own submission path
            error!("[{}] ❌ Block send to local node {} failed: {}", chain, outcome.endpoint, reason);
        } else {
            debug!("[{}] Block send to {} failed: {}", chain, outcome.endpoint, reason);
        }
    }
}

/// Aggregate broadcast counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    pub blocks_sent: u64,
    pub total_sends: u64,
    pub successful_sends: u64,
    pub failed_sends: u64,
    pub rpc_successes: u64,
    pub rpc_failures: u64,
    pub local_node_failures: u64,
    pub last_block_hash: Option<String>,
    pub last_block_at: Option<Timestamp>,
}

impl BroadcastStats {
    /// Fold one broadcast into the counters and build its report
    pub fn record(
        &mut self,
        chain: &str,
        block_hash: Option<String>,
        outcomes: &[BroadcastOutcome],
        rpc_outcomes: &[RpcOutcome],
        elapsed: Duration,
        now: Timestamp,
    ) -> BroadcastReport {
        let peer_successes = outcomes.iter().filter(|o| o.success).count();
        let peer_failures = outcomes.len() - peer_successes;
        let rpc_successes = rpc_outcomes.iter().filter(|o| o.accepted).count();
        let rpc_failures = rpc_outcomes.len() - rpc_successes;
        let local_node_accepted = outcomes.iter().find(|o| o.protected).map(|o| o.success);

        self.blocks_sent += 1;
        self.total_sends += outcomes.len() as u64;
        self.successful_sends += peer_successes as u64;
        self.failed_sends += peer_failures as u64;
        self.rpc_successes += rpc_successes as u64;
        self.rpc_failures += rpc_failures as u64;
        if local_node_accepted == Some(false) {
            self.local_node_failures += 1;
        }
        self.last_block_hash = block_hash.clone();
        self.last_block_at = Some(now);

        for rejected in rpc_outcomes.iter().filter(|o| !o.accepted) {
            warn!(
                "[{}] RPC submission to {} failed: {}",
                chain,
                rejected.endpoint,
                rejected.error.as_deref().unwrap_or("unknown error")
            );
        }

        BroadcastReport {
            block_hash,
            peer_successes,
            peer_failures,
            rpc_successes,
            rpc_failures,
            local_node_accepted,
            elapsed_millis: elapsed.as_millis() as u64,
        }
    }

    /// Share of sends that succeeded, once anything has been sent
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_sends == 0 {
            None
        } else {
            Some(self.successful_sends as f64 / self.total_sends as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockNetwork, MockSubmitter, PeerBehavior};
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

    fn ep(last: u8) -> PeerEndpoint {
        PeerEndpoint::new(format!("10.0.0.{}", last), 9333)
    }

    async fn targets(network: &MockNetwork, count: u8) -> Vec<BroadcastTarget> {
        let mut targets = Vec::new();
        for i in 1..=count {
            let link = network.connect(&ep(i), Arc::new(NullSink)).await.unwrap();
            targets.push(BroadcastTarget {
                endpoint: ep(i),
                link,
                protected: i == 1,
            });
        }
        targets
    }

    #[tokio::test]
    async fn test_fan_out_is_parallel() {
        let network = MockNetwork::new();
        for i in 1..=4u8 {
            network.set_behavior(
                &ep(i),
                PeerBehavior {
                    send_delay: Duration::from_millis(100 * i as u64),
                    ..Default::default()
                },
            );
        }
        let targets = targets(&network, 4).await;

        let started = Instant::now();
        let outcomes = fan_out(targets, Arc::from(vec![0u8; 16]), Duration::from_secs(5)).await;
        let elapsed = started.elapsed();

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(network.max_in_flight(), 4);
        // Sequential sends would take 1s
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_send_timeout_is_failure() {
        let network = MockNetwork::new();
        network.set_behavior(
            &ep(2),
            PeerBehavior {
                send_delay: Duration::from_secs(10),
                ..Default::default()
            },
        );
        network.set_behavior(
            &ep(3),
            PeerBehavior {
                send_fails: true,
                ..Default::default()
            },
        );
        let targets = targets(&network, 3).await;

        let outcomes = fan_out(targets, Arc::from(vec![1u8]), Duration::from_millis(200)).await;
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.success).map(|o| &o.endpoint).collect();
        assert_eq!(failed, vec![&ep(2), &ep(3)]);
        assert!(outcomes[1].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_rpc_outcomes_counted_apart() {
        let submitters: Vec<Arc<dyn BlockSubmitter>> = vec![
            Arc::new(MockSubmitter::accepting("http://a/")),
            Arc::new(MockSubmitter::rejecting("http://b/", "bad-prevblk")),
        ];
        let rpc = submit_rpc(&submitters, Arc::from(vec![1u8]), Duration::from_secs(1)).await;

        let outcomes = vec![BroadcastOutcome {
            endpoint: ep(1),
            protected: true,
            success: true,
            duration_millis: 3,
            error: None,
        }];

        let mut stats = BroadcastStats::default();
        let report = stats.record("ltc", Some("ab".into()), &outcomes, &rpc, Duration::ZERO, 1_000);
        assert_eq!(report.peer_successes, 1);
        assert_eq!(report.rpc_successes, 1);
        assert_eq!(report.rpc_failures, 1);
        assert_eq!(report.local_node_accepted, Some(true));
        assert_eq!(stats.success_rate(), Some(1.0));
    }

    #[test]
    fn test_apply_outcomes_scores() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PeerStore::new(dir.path().join("peers.json"), [9333]);
        store.upsert(&ep(1), PeerSource::LocalNode, 100, 1_000);
        store.upsert(&ep(2), PeerSource::LocalNode, 100, 1_000);

        let outcome = |endpoint: PeerEndpoint, success: bool| BroadcastOutcome {
            endpoint,
            protected: false,
            success,
            duration_millis: 1,
            error: None,
        };
        apply_outcomes("ltc", &mut store, &[outcome(ep(1), true), outcome(ep(2), false)], 1_100);

        assert_eq!(store.get(&ep(1)).unwrap().score, 110);
        assert_eq!(store.get(&ep(1)).unwrap().last_seen, 1_100);
        assert_eq!(store.get(&ep(2)).unwrap().score, 95);
        assert_eq!(store.get(&ep(2)).unwrap().failure_count, 1);
    }
}
