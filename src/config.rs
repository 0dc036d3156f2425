//! Relay Configuration
//!
//! One `[[chains]]` table per chain the node propagates blocks for. The
//! primary chain and every merged-mining chain use the same relay, only
//! their endpoints and tuning differ.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::protocol::parse_magic;
use crate::types::PeerEndpoint;

/// Main configuration for the relay service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayNodeConfig {
    /// Port for HTTP API
    pub api_port: u16,

    /// Directory holding the per-chain peer snapshots
    pub data_dir: PathBuf,

    /// Chains to relay for
    pub chains: Vec<ChainConfig>,
}

impl Default for RelayNodeConfig {
    fn default() -> Self {
        Self {
            api_port: 9080,
            data_dir: PathBuf::from("./data"),
            chains: vec![ChainConfig::default()],
        }
    }
}

/// An RPC daemon that blocks are also submitted to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitEndpoint {
    pub url: String,

    #[serde(default)]
    pub rpc_user: String,

    #[serde(default)]
    pub rpc_password: String,
}

/// Per-chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Short chain name, used in logs, API paths and the snapshot file name
    pub name: String,

    // === Local full node ===

    /// P2P address of the local full node (the protected peer)
    pub local_p2p: String,

    /// JSON-RPC URL of the local full node
    pub rpc_url: String,

    pub rpc_user: String,

    pub rpc_password: String,

    // === Network ===

    /// Network magic, 8 hex digits
    pub network_magic: String,

    /// Default P2P port of the network
    pub p2p_port: u16,

    /// Additional ports worth dialling (the default port is always valid)
    pub valid_ports: Vec<u16>,

    // === Submission ===

    /// Extra daemons to submit found blocks to over RPC
    pub submit_endpoints: Vec<SubmitEndpoint>,

    /// Also submit through the local node's RPC (merged-mining chains)
    pub submit_via_local_rpc: bool,

    /// Relay tuning
    pub relay: RelaySettings,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: "ltc".to_string(),
            local_p2p: "127.0.0.1:9333".to_string(),
            rpc_url: "http://127.0.0.1:9332/".to_string(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            network_magic: "fbc0b6db".to_string(),
            p2p_port: 9333,
            valid_ports: vec![],
            submit_endpoints: vec![],
            submit_via_local_rpc: false,
            relay: RelaySettings::default(),
        }
    }
}

impl ChainConfig {
    /// Endpoint of the local full node
    pub fn local_endpoint(&self) -> anyhow::Result<PeerEndpoint> {
        PeerEndpoint::parse(&self.local_p2p, self.p2p_port)
            .map_err(|e| anyhow::anyhow!("chain {}: local_p2p: {}", self.name, e))
    }

    /// Decoded network magic
    pub fn magic(&self) -> anyhow::Result<[u8; 4]> {
        parse_magic(&self.network_magic).map_err(|e| anyhow::anyhow!("chain {}: {}", self.name, e))
    }

    /// Ports a stored peer may have
    pub fn valid_port_set(&self) -> BTreeSet<u16> {
        std::iter::once(self.p2p_port)
            .chain(self.valid_ports.iter().copied())
            .filter(|port| *port != 0)
            .collect()
    }

    /// Snapshot file for this chain
    pub fn snapshot_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("broadcast_peers_{}.json", self.name))
    }
}

/// Relay tuning for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    // === Limits ===

    /// Below this many unprotected connections the relay refills urgently
    pub min_peers: usize,

    /// Connection cap, protected connection included
    pub max_peers: usize,

    /// Consecutive failures before a peer enters backoff
    pub max_connection_attempts: u32,

    // === Timeouts (seconds) ===

    pub connection_timeout_secs: u64,

    pub send_timeout_secs: u64,

    pub rpc_timeout_secs: u64,

    /// How long a repeatedly failing peer is skipped
    pub backoff_window_secs: u64,

    // === Schedule (seconds) ===

    /// Re-query of the local node's peer list
    pub refresh_interval_secs: u64,

    /// Maintenance tick
    pub reconcile_interval_secs: u64,

    /// Replacement of weak connections by better candidates
    pub rotation_interval_secs: u64,

    /// Minimum gap between two emergency refreshes
    pub emergency_refresh_cooldown_secs: u64,

    /// Minimum gap between two plain connect passes
    pub fill_interval_secs: u64,

    pub save_interval_secs: u64,

    /// How long a low peer count is tolerated before health turns red
    pub health_grace_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            min_peers: 5,
            max_peers: 20,
            max_connection_attempts: 3,

            connection_timeout_secs: 15,
            send_timeout_secs: 10,
            rpc_timeout_secs: 30,
            backoff_window_secs: 300,      // 5 minutes

            refresh_interval_secs: 1800,   // 30 minutes
            reconcile_interval_secs: 5,
            rotation_interval_secs: 1800,
            emergency_refresh_cooldown_secs: 60,
            fill_interval_secs: 60,
            save_interval_secs: 300,
            health_grace_secs: 120,
        }
    }
}

impl RelaySettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn backoff_window(&self) -> Duration {
        Duration::from_secs(self.backoff_window_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn emergency_refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.emergency_refresh_cooldown_secs)
    }

    pub fn fill_interval(&self) -> Duration {
        Duration::from_secs(self.fill_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_peers == 0 {
            anyhow::bail!("max_peers must be at least 1");
        }

        if self.min_peers > self.max_peers {
            anyhow::bail!(
                "min_peers ({}) must not exceed max_peers ({})",
                self.min_peers,
                self.max_peers
            );
        }

        if self.max_connection_attempts == 0 {
            anyhow::bail!("max_connection_attempts must be at least 1");
        }

        let durations = [
            ("connection_timeout_secs", self.connection_timeout_secs),
            ("send_timeout_secs", self.send_timeout_secs),
            ("rpc_timeout_secs", self.rpc_timeout_secs),
            ("backoff_window_secs", self.backoff_window_secs),
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("rotation_interval_secs", self.rotation_interval_secs),
            ("fill_interval_secs", self.fill_interval_secs),
            ("save_interval_secs", self.save_interval_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        Ok(())
    }
}

impl RelayNodeConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    // Builder-style methods for CLI overrides

    pub fn with_api_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.api_port = port;
        }
        self
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(data_dir) = data_dir {
            self.data_dir = data_dir;
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("at least one [[chains]] entry is required");
        }

        let mut names = HashSet::new();
        for chain in &self.chains {
            if chain.name.trim().is_empty() {
                anyhow::bail!("chain name must not be empty");
            }
            if !names.insert(chain.name.as_str()) {
                anyhow::bail!("duplicate chain name {:?}", chain.name);
            }

            chain.local_endpoint()?;
            chain.magic()?;

            if chain.valid_port_set().is_empty() {
                anyhow::bail!("chain {}: no valid P2P ports configured", chain.name);
            }

            chain
                .relay
                .validate()
                .map_err(|e| anyhow::anyhow!("chain {}: {}", chain.name, e))?;
        }

        Ok(())
    }
}
