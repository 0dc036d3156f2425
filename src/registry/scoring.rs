//! Peer Scoring System
//!
//! Scores start at a source-dependent value and move with observed behaviour.
//! Ordinary peers live in `[MIN_SCORE, MAX_SCORE]`; the protected local node
//! holds `PROTECTED_SCORE` so no eviction pass can ever select it.
//!
//! The broadcast penalty is deliberately smaller than the bonus: one failed
//! send costs half of what one accepted block earns.

use crate::types::LocalPeerInfo;

/// Sentinel score of the protected local node
pub const PROTECTED_SCORE: i64 = 999_999;

/// Maximum score of an unprotected peer
pub const MAX_SCORE: i64 = PROTECTED_SCORE - 1;

/// Minimum peer score
pub const MIN_SCORE: i64 = 0;

/// Base score for peers reported by the local node
pub const BASE_SCORE: i64 = 100;

/// Initial score for gossiped peers (unverified, third-hand)
pub const GOSSIP_SCORE: i64 = 50;

/// Connection age after which a local-node peer counts as long-lived
pub const LONG_LIVED_SECS: u64 = 3600;

/// Ping assumed when the local node reports none
pub const UNKNOWN_PING_MILLIS: u64 = 1000;

/// How much a candidate must outscore a connected peer to replace it
pub const ROTATION_SCORE_MARGIN: i64 = 20;

/// Latency bands: (upper bound in ms, bonus)
const LATENCY_BANDS: [(u64, i64); 3] = [(50, 50), (100, 30), (200, 10)];

/// Score adjustments for various events
pub mod adjustments {
    /// Outbound connect succeeded
    pub const CONNECT_SUCCESS: i64 = 10;

    /// Peer accepted a broadcast block
    pub const BROADCAST_SUCCESS: i64 = 10;

    /// Send failed or timed out
    pub const BROADCAST_FAILURE: i64 = -5;

    /// Peer announced a block to us
    pub const BLOCK_RELAYED: i64 = 5;

    /// The local node dialled this peer itself
    pub const OUTBOUND_BONUS: i64 = 100;

    /// The local node has kept this peer for a long time
    pub const LONG_LIVED_BONUS: i64 = 20;
}

/// Initial score for a peer from the local node's peer list.
///
/// Outbound peers are the node's own vetted picks, low latency and long
/// connection age are both rewarded.
pub fn local_node_score(peer: &LocalPeerInfo) -> i64 {
    let mut score = BASE_SCORE;

    if !peer.inbound {
        score += adjustments::OUTBOUND_BONUS;
    }

    score += latency_bonus(peer.ping_millis.unwrap_or(UNKNOWN_PING_MILLIS));

    if peer.connection_age_secs.unwrap_or(0) > LONG_LIVED_SECS {
        score += adjustments::LONG_LIVED_BONUS;
    }

    score
}

/// Bonus for the band `ping_millis` falls in
pub fn latency_bonus(ping_millis: u64) -> i64 {
    LATENCY_BANDS
        .iter()
        .find(|(bound, _)| ping_millis < *bound)
        .map(|(_, bonus)| *bonus)
        .unwrap_or(0)
}

/// Clamp an unprotected score to the valid range
pub fn clamp_score(score: i64) -> i64 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}
