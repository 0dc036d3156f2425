//! Peer Store (JSON snapshot)
//!
//! In-memory table of known peers, persisted as one JSON snapshot per chain.
//! Survives relay restarts so accumulated scores are not lost.
//!
//! Snapshots are written to `<file>.tmp` and renamed over the destination, so
//! a reader never observes a partially written file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::scoring::{self, BASE_SCORE, PROTECTED_SCORE};
use super::RegistryStats;
use crate::error::RelayError;
use crate::types::{current_timestamp, PeerEndpoint, PeerRecord, PeerSource, Timestamp};

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// New record created
    Inserted,
    /// Existing record refreshed
    Refreshed,
    /// Port outside the valid set; nothing stored
    Rejected,
}

/// On-disk snapshot layout
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    bootstrapped: bool,

    #[serde(default)]
    saved_at: Timestamp,

    #[serde(default)]
    peers: BTreeMap<String, PeerRecord>,
}

/// Peer store for one chain
pub struct PeerStore {
    /// Known peers
    peers: HashMap<PeerEndpoint, PeerRecord>,

    /// Ports worth dialling on this network
    valid_ports: BTreeSet<u16>,

    /// Snapshot location
    path: PathBuf,

    /// Whether the initial bootstrap has completed
    bootstrapped: bool,

    /// The local full node's endpoint, re-derived at every startup
    protected: Option<PeerEndpoint>,
}

impl PeerStore {
    /// Create an empty store that will persist to `path`
    pub fn new(path: impl Into<PathBuf>, valid_ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            peers: HashMap::new(),
            valid_ports: valid_ports.into_iter().collect(),
            path: path.into(),
            bootstrapped: false,
            protected: None,
        }
    }

    /// Load the snapshot at `path`, or start empty if there is none.
    ///
    /// A corrupt snapshot is logged and replaced by an empty store. A leftover
    /// temp file from an interrupted save is discarded; the destination file
    /// (if any) is the last complete snapshot.
    pub fn load(
        path: impl Into<PathBuf>,
        valid_ports: impl IntoIterator<Item = u16>,
    ) -> Result<Self, RelayError> {
        let mut store = Self::new(path, valid_ports);

        let temp_path = store.temp_path();
        if temp_path.exists() {
            debug!("Discarding interrupted snapshot {}", temp_path.display());
            if let Err(e) = fs::remove_file(&temp_path) {
                warn!("Failed to remove {}: {}", temp_path.display(), e);
            }
        }

        let bytes = match fs::read(&store.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📦 No peer snapshot at {}, starting empty", store.path.display());
                return Ok(store);
            }
            Err(e) => {
                return Err(RelayError::Snapshot(format!(
                    "read {}: {}",
                    store.path.display(),
                    e
                )))
            }
        };

        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Peer snapshot {} is unreadable ({}), starting empty",
                    store.path.display(),
                    e
                );
                return Ok(store);
            }
        };

        store.bootstrapped = snapshot.bootstrapped;

        for (key, mut record) in snapshot.peers {
            let endpoint = match key.parse::<PeerEndpoint>() {
                Ok(endpoint) => endpoint,
                Err(_) => {
                    debug!("Skipping snapshot entry with bad key {:?}", key);
                    continue;
                }
            };

            // The protected endpoint is never trusted from disk
            if record.protected || record.score >= PROTECTED_SCORE {
                record.protected = false;
                record.score = BASE_SCORE;
            }

            store.peers.insert(endpoint, record);
        }

        let purged = store.purge_invalid_ports();

        info!(
            "📦 Loaded {} peers from {} (purged {}, bootstrapped: {})",
            store.peers.len(),
            store.path.display(),
            purged,
            store.bootstrapped
        );

        Ok(store)
    }

    /// Write the snapshot atomically (temp file, then rename)
    pub fn save(&self) -> Result<(), RelayError> {
        let snapshot = Snapshot {
            bootstrapped: self.bootstrapped,
            saved_at: current_timestamp(),
            peers: self
                .peers
                .iter()
                .map(|(endpoint, record)| (endpoint.to_string(), record.clone()))
                .collect(),
        };

        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.write_error(parent, e))?;
            }
        }

        let temp_path = self.temp_path();
        {
            let mut file =
                fs::File::create(&temp_path).map_err(|e| self.write_error(&temp_path, e))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| self.write_error(&temp_path, e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| self.write_error(&self.path, e))?;

        debug!("Saved {} peers to {}", self.peers.len(), self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    fn write_error(&self, path: &Path, err: std::io::Error) -> RelayError {
        RelayError::Snapshot(format!("write {}: {}", path.display(), err))
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Mark `endpoint` as the protected local node.
    ///
    /// Any previously protected endpoint is demoted to an ordinary record.
    /// The local node bypasses the port filter.
    pub fn register_protected(&mut self, endpoint: &PeerEndpoint, now: Timestamp) {
        if let Some(previous) = self.protected.take() {
            if &previous != endpoint {
                if let Some(record) = self.peers.get_mut(&previous) {
                    record.protected = false;
                    record.score = BASE_SCORE;
                }
            }
        }

        let record = self
            .peers
            .entry(endpoint.clone())
            .or_insert_with(|| PeerRecord::new(PeerSource::LocalNode, PROTECTED_SCORE, now));
        record.protected = true;
        record.score = PROTECTED_SCORE;
        record.touch(now);

        self.protected = Some(endpoint.clone());
    }

    /// Insert a new record or refresh an existing one.
    ///
    /// An existing score is raised to `max(existing, hint)` and never lowered.
    pub fn upsert(
        &mut self,
        endpoint: &PeerEndpoint,
        source: PeerSource,
        score_hint: i64,
        seen_at: Timestamp,
    ) -> Upsert {
        if self.is_protected(endpoint) {
            if let Some(record) = self.peers.get_mut(endpoint) {
                record.touch(seen_at);
            }
            return Upsert::Refreshed;
        }

        if !self.is_valid_port(endpoint.port()) {
            return Upsert::Rejected;
        }

        let hint = scoring::clamp_score(score_hint);

        match self.peers.get_mut(endpoint) {
            Some(record) => {
                record.score = record.score.max(hint);
                record.touch(seen_at);
                Upsert::Refreshed
            }
            None => {
                self.peers
                    .insert(endpoint.clone(), PeerRecord::new(source, hint, seen_at));
                Upsert::Inserted
            }
        }
    }

    /// Apply a score delta; unprotected scores are clamped, the protected one
    /// never moves. Returns the resulting score.
    pub fn adjust_score(&mut self, endpoint: &PeerEndpoint, delta: i64) -> Option<i64> {
        let record = self.peers.get_mut(endpoint)?;
        if !record.protected {
            record.score = scoring::clamp_score(record.score.saturating_add(delta));
        }
        Some(record.score)
    }

    /// Feed one broadcast outcome back into the record
    pub fn record_broadcast(&mut self, endpoint: &PeerEndpoint, success: bool, now: Timestamp) {
        let Some(record) = self.peers.get_mut(endpoint) else {
            return;
        };

        if success {
            record.success_count += 1;
            record.touch(now);
            self.adjust_score(endpoint, scoring::adjustments::BROADCAST_SUCCESS);
        } else {
            record.failure_count += 1;
            self.adjust_score(endpoint, scoring::adjustments::BROADCAST_FAILURE);
        }
    }

    /// Drop records whose port is not in the valid set. The protected record
    /// is kept regardless.
    pub fn purge_invalid_ports(&mut self) -> usize {
        let before = self.peers.len();
        let valid_ports = &self.valid_ports;
        let protected = self.protected.as_ref();
        self.peers.retain(|endpoint, record| {
            record.protected
                || Some(endpoint) == protected
                || valid_ports.contains(&endpoint.port())
        });
        before - self.peers.len()
    }

    pub fn set_bootstrapped(&mut self, bootstrapped: bool) {
        self.bootstrapped = bootstrapped;
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// The `n` highest-scoring unprotected records not in `excluding`.
    /// Ties are broken by endpoint order.
    pub fn top_n(&self, n: usize, excluding: &HashSet<PeerEndpoint>) -> Vec<PeerEndpoint> {
        let mut candidates: Vec<_> = self
            .peers
            .iter()
            .filter(|(endpoint, record)| !record.protected && !excluding.contains(*endpoint))
            .collect();

        candidates.sort_by(|(ea, ra), (eb, rb)| rb.score.cmp(&ra.score).then_with(|| ea.cmp(eb)));

        candidates
            .into_iter()
            .take(n)
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    pub fn get(&self, endpoint: &PeerEndpoint) -> Option<&PeerRecord> {
        self.peers.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &PeerEndpoint) -> Option<&mut PeerRecord> {
        self.peers.get_mut(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerEndpoint, &PeerRecord)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_valid_port(&self, port: u16) -> bool {
        self.valid_ports.contains(&port)
    }

    pub fn is_protected(&self, endpoint: &PeerEndpoint) -> bool {
        self.protected.as_ref() == Some(endpoint)
    }

    pub fn protected_endpoint(&self) -> Option<&PeerEndpoint> {
        self.protected.as_ref()
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get store statistics
    pub fn stats(&self) -> RegistryStats {
        let mut by_source = BTreeMap::new();
        for record in self.peers.values() {
            *by_source.entry(record.source.to_string()).or_insert(0) += 1;
        }

        let unprotected: Vec<_> = self.peers.values().filter(|r| !r.protected).collect();
        let average_score = if unprotected.is_empty() {
            0.0
        } else {
            unprotected.iter().map(|r| r.score as f64).sum::<f64>() / unprotected.len() as f64
        };

        RegistryStats {
            total_peers: self.peers.len(),
            protected_peers: self.peers.values().filter(|r| r.protected).count(),
            by_source,
            average_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::scoring::{GOSSIP_SCORE, MAX_SCORE};
    use tempfile::tempdir;

    const PORT: u16 = 9333;

    fn ep(last: u8) -> PeerEndpoint {
        PeerEndpoint::new(format!("192.168.1.{}", last), PORT)
    }

    fn create_test_store(dir: &Path) -> PeerStore {
        PeerStore::new(dir.join("broadcast_peers_ltc.json"), [PORT])
    }

    #[test]
    fn test_upsert_inserts_and_raises_score() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        assert_eq!(store.upsert(&ep(1), PeerSource::Gossip, 50, 1_000), Upsert::Inserted);
        assert_eq!(store.upsert(&ep(1), PeerSource::Refresh, 200, 1_100), Upsert::Refreshed);

        let record = store.get(&ep(1)).unwrap();
        assert_eq!(record.score, 200);
        assert_eq!(record.source, PeerSource::Gossip);
        assert_eq!(record.last_seen, 1_100);
    }

    #[test]
    fn test_upsert_never_lowers_score() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        store.upsert(&ep(1), PeerSource::LocalNode, 250, 1_000);
        store.upsert(&ep(1), PeerSource::Gossip, GOSSIP_SCORE, 1_000);
        assert_eq!(store.get(&ep(1)).unwrap().score, 250);
    }

    #[test]
    fn test_upsert_rejects_invalid_port() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        let ephemeral = PeerEndpoint::new("192.168.1.9", 53122);
        assert_eq!(store.upsert(&ephemeral, PeerSource::Gossip, 50, 1_000), Upsert::Rejected);
        assert!(store.is_empty());
    }

    #[test]
    fn test_protected_record() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());
        let local = PeerEndpoint::new("127.0.0.1", 19335);

        store.register_protected(&local, 1_000);
        let record = store.get(&local).unwrap();
        assert!(record.protected);
        assert_eq!(record.score, PROTECTED_SCORE);

        // Penalties and upserts do not move the sentinel
        store.adjust_score(&local, -500);
        store.upsert(&local, PeerSource::Gossip, 10, 1_200);
        store.record_broadcast(&local, false, 1_300);
        let record = store.get(&local).unwrap();
        assert_eq!(record.score, PROTECTED_SCORE);
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.last_seen, 1_200);
    }

    #[test]
    fn test_register_protected_demotes_previous() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        store.register_protected(&ep(1), 1_000);
        store.register_protected(&ep(2), 1_000);

        assert!(!store.get(&ep(1)).unwrap().protected);
        assert_eq!(store.get(&ep(1)).unwrap().score, BASE_SCORE);
        assert_eq!(store.protected_endpoint(), Some(&ep(2)));
        assert_eq!(store.stats().protected_peers, 1);
    }

    #[test]
    fn test_adjust_score_clamps() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        store.upsert(&ep(1), PeerSource::Gossip, 50, 1_000);
        assert_eq!(store.adjust_score(&ep(1), -1_000), Some(0));
        assert_eq!(store.adjust_score(&ep(1), i64::MAX), Some(MAX_SCORE));
        assert_eq!(store.adjust_score(&ep(9), 10), None);
    }

    #[test]
    fn test_repeated_successes_never_reach_sentinel() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        store.upsert(&ep(1), PeerSource::LocalNode, MAX_SCORE - 25, 1_000);
        let mut last = 0;
        for i in 0..10 {
            store.record_broadcast(&ep(1), true, 1_000 + i);
            let score = store.get(&ep(1)).unwrap().score;
            assert!(score >= last);
            assert!(score < PROTECTED_SCORE);
            last = score;
        }
        assert_eq!(last, MAX_SCORE);
        assert_eq!(store.get(&ep(1)).unwrap().success_count, 10);
    }

    #[test]
    fn test_top_n_order_and_exclusion() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        store.register_protected(&PeerEndpoint::new("127.0.0.1", PORT), 1_000);
        for i in 1..=5u8 {
            store.upsert(&ep(i), PeerSource::LocalNode, 100 + i as i64 * 10, 1_000);
        }
        // Tie with ep(5) on score, broken by endpoint order
        store.upsert(&ep(6), PeerSource::LocalNode, 150, 1_000);

        let top = store.top_n(3, &HashSet::new());
        assert_eq!(top, vec![ep(5), ep(6), ep(4)]);

        let excluding: HashSet<_> = [ep(5)].into_iter().collect();
        let top = store.top_n(2, &excluding);
        assert_eq!(top, vec![ep(6), ep(4)]);

        // Protected record never offered as a candidate
        assert_eq!(store.top_n(100, &HashSet::new()).len(), 6);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broadcast_peers_ltc.json");

        {
            let mut store = PeerStore::new(&path, [PORT]);
            store.register_protected(&PeerEndpoint::new("127.0.0.1", PORT), 1_000);
            store.upsert(&ep(1), PeerSource::LocalNode, 230, 1_000);
            store.upsert(&ep(2), PeerSource::Gossip, 50, 1_000);
            store.record_broadcast(&ep(1), true, 1_100);
            store.set_bootstrapped(true);
            store.save().unwrap();
        }

        let store = PeerStore::load(&path, [PORT]).unwrap();
        assert!(store.bootstrapped());
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&ep(1)).unwrap().score, 240);
        assert_eq!(store.get(&ep(1)).unwrap().success_count, 1);
        assert_eq!(store.get(&ep(2)).unwrap().source, PeerSource::Gossip);

        // Protected status is re-derived at startup, not trusted from disk
        let local = store.get(&PeerEndpoint::new("127.0.0.1", PORT)).unwrap();
        assert!(!local.protected);
        assert_eq!(local.score, BASE_SCORE);
        assert!(store.protected_endpoint().is_none());
    }

    #[test]
    fn test_load_purges_invalid_ports() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broadcast_peers_ltc.json");

        {
            let mut store = PeerStore::new(&path, [PORT, 19333]);
            store.upsert(&ep(1), PeerSource::LocalNode, 100, 1_000);
            store.upsert(&PeerEndpoint::new("10.0.0.7", 19333), PeerSource::Gossip, 50, 1_000);
            store.save().unwrap();
        }

        let store = PeerStore::load(&path, [PORT]).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&ep(1)).is_some());
    }

    #[test]
    fn test_crash_mid_save_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broadcast_peers_ltc.json");

        {
            let mut store = PeerStore::new(&path, [PORT]);
            store.upsert(&ep(1), PeerSource::LocalNode, 180, 1_000);
            store.save().unwrap();
        }

        // Simulate a save that died after writing half of the temp file
        fs::write(path.with_extension("json.tmp"), b"{\"bootstrapped\": tr").unwrap();

        let store = PeerStore::load(&path, [PORT]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&ep(1)).unwrap().score, 180);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_crash_before_first_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broadcast_peers_ltc.json");
        fs::write(path.with_extension("json.tmp"), b"{\"peers\": {").unwrap();

        let store = PeerStore::load(&path, [PORT]).unwrap();
        assert!(store.is_empty());
        assert!(!store.bootstrapped());
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broadcast_peers_ltc.json");
        fs::write(&path, b"not json").unwrap();

        let store = PeerStore::load(&path, [PORT]).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let mut store = create_test_store(dir.path());

        store.register_protected(&PeerEndpoint::new("127.0.0.1", PORT), 1_000);
        store.upsert(&ep(1), PeerSource::LocalNode, 100, 1_000);
        store.upsert(&ep(2), PeerSource::Gossip, 50, 1_000);

        let stats = store.stats();
        assert_eq!(stats.total_peers, 3);
        assert_eq!(stats.protected_peers, 1);
        assert_eq!(stats.by_source.get("local_node"), Some(&2));
        assert_eq!(stats.by_source.get("gossip"), Some(&1));
        assert!((stats.average_score - 75.0).abs() < f64::EPSILON);
    }
}
