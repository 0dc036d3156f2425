//! Peer Registry Module
//!
//! Known peers for one chain, their quality scores, and the JSON snapshot
//! that carries them across restarts.

mod storage;
pub mod scoring;

pub use storage::{PeerStore, Upsert};

use serde::Serialize;
use std::collections::BTreeMap;

/// Result of a registry query
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Total peers in the store
    pub total_peers: usize,

    /// Protected records (1 at steady state)
    pub protected_peers: usize,

    /// Record count per discovery source
    pub by_source: BTreeMap<String, usize>,

    /// Average score of unprotected peers
    pub average_score: f64,
}
