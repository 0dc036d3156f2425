//! Peer discovery
//!
//! Two inputs feed the store: the local full node's peer list (at bootstrap
//! and on every refresh) and address gossip relayed over live links.

use tracing::debug;

use crate::registry::scoring::{self, GOSSIP_SCORE};
use crate::registry::{PeerStore, Upsert};
use crate::types::{GossipAddr, LocalPeerInfo, PeerEndpoint, PeerSource, Timestamp};

/// Which query produced a local-node peer list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerListKind {
    Bootstrap,
    Refresh,
}

impl PeerListKind {
    fn source(self) -> PeerSource {
        match self {
            PeerListKind::Bootstrap => PeerSource::LocalNode,
            PeerListKind::Refresh => PeerSource::Refresh,
        }
    }
}

/// What one discovery pass did to the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub inserted: usize,
    pub refreshed: usize,
    /// Port outside the valid set
    pub rejected: usize,
    /// Unparseable entries
    pub malformed: usize,
}

impl DiscoverySummary {
    fn count(&mut self, result: Upsert) {
        match result {
            Upsert::Inserted => self.inserted += 1,
            Upsert::Refreshed => self.refreshed += 1,
            Upsert::Rejected => self.rejected += 1,
        }
    }
}

/// Ingest the local node's peer list.
///
/// New endpoints are scored from direction, latency and connection age.
/// Known endpoints keep their history; their score is only ever raised and
/// their latency/direction metadata is refreshed.
pub fn apply_local_peer_list(
    store: &mut PeerStore,
    peers: &[LocalPeerInfo],
    kind: PeerListKind,
    default_port: u16,
    now: Timestamp,
) -> DiscoverySummary {
    let mut summary = DiscoverySummary::default();

    for peer in peers {
        let endpoint = match PeerEndpoint::parse(&peer.address, default_port) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!("Skipping local peer entry: {}", e);
                summary.malformed += 1;
                continue;
            }
        };

        // The local node never lists itself, but a loopback alias might
        if store.is_protected(&endpoint) {
            continue;
        }

        let score = scoring::local_node_score(peer);
        let result = store.upsert(&endpoint, kind.source(), score, now);
        summary.count(result);

        if result != Upsert::Rejected {
            if let Some(record) = store.get_mut(&endpoint) {
                if peer.ping_millis.is_some() {
                    record.ping_millis = peer.ping_millis;
                }
                record.outbound = Some(!peer.inbound);
            }
        }
    }

    summary
}

/// Ingest one address-gossip message.
///
/// Gossiped peers are third-hand and start below local-node peers. Claimed
/// timestamps from the future are clamped to `now`.
pub fn apply_gossip(store: &mut PeerStore, addrs: &[GossipAddr], now: Timestamp) -> DiscoverySummary {
    let mut summary = DiscoverySummary::default();

    for addr in addrs {
        // IPv6 hosts may arrive bracketed; endpoints store them bare
        let host = addr.host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() || host.contains(['[', ']']) || addr.port == 0 {
            summary.malformed += 1;
            continue;
        }

        let endpoint = PeerEndpoint::new(host, addr.port);
        let seen_at = if addr.timestamp == 0 {
            now
        } else {
            addr.timestamp.min(now)
        };

        summary.count(store.upsert(&endpoint, PeerSource::Gossip, GOSSIP_SCORE, seen_at));
    }

    summary
}
