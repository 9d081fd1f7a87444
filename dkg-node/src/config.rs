//! Configuration file support for DKG nodes
//!
//! A node is described by one JSON file: its own identity and bind address,
//! the networks it participates in, a bootstrap peer list and the tuning
//! knobs for replication, protocol phases and the command executor.

use std::{
    collections::HashSet,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use dkg_common::constants::{
    DKG_UDP_PORT, INIT_TIMEOUT_MS, MAX_OPEN_SESSIONS, REQUEST_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};

use crate::types::{BlockchainId, PeerId};

/// A bootstrap peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    /// Networks the peer is a member of
    pub blockchains: Vec<BlockchainId>,
}

/// Replication parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Default replication floor for publish and update
    pub min_ack_responses: usize,
    /// How many peers are contacted per batch
    pub batch_size: usize,
    /// How many closest peers form a shard
    pub shard_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            min_ack_responses: 3,
            batch_size: 5,
            shard_size: 20,
        }
    }
}

/// Timeout and BUSY-retry policy for one protocol phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub period_ms: u64,
}

impl PhaseConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub init: PhaseConfig,
    pub request: PhaseConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            init: PhaseConfig {
                timeout_ms: INIT_TIMEOUT_MS,
                retries: 3,
                period_ms: 5_000,
            },
            request: PhaseConfig {
                timeout_ms: REQUEST_TIMEOUT_MS,
                retries: 3,
                period_ms: 5_000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Commands executing at the same time
    pub parallelism: usize,
    pub verbose_logging: bool,
    /// Age after which finalized commands are purged
    pub command_cleanup_ms: u64,
    /// Age after which finished operation records are purged
    pub operation_cleanup_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            verbose_logging: false,
            command_cleanup_ms: 4 * 24 * 60 * 60 * 1000,
            operation_cleanup_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// How long a peer stays out of shards after a failed dial
    pub redial_after_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            redial_after_ms: 60_000,
        }
    }
}

/// Receiver-side limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_open_sessions: usize,
    pub session_ttl_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_open_sessions: MAX_OPEN_SESSIONS,
            session_ttl_ms: 2 * 60 * 1000,
        }
    }
}

/// Configuration for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub peer_id: PeerId,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Networks this node is a member of
    pub blockchains: Vec<BlockchainId>,
    /// Directory for the command repository; in-memory when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DKG_UDP_PORT))
}

impl NodeConfig {
    /// Minimal configuration with defaults for everything but identity and membership.
    pub fn new(peer_id: impl Into<PeerId>, blockchains: Vec<BlockchainId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            bind_addr: default_bind_addr(),
            blockchains,
            data_dir: None,
            peers: Vec::new(),
            replication: ReplicationConfig::default(),
            protocol: ProtocolConfig::default(),
            executor: ExecutorConfig::default(),
            liveness: LivenessConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Load node configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save node configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.blockchains.is_empty() {
            anyhow::bail!("Node {} is not a member of any blockchain", self.peer_id);
        }

        let mut seen_peer_ids = HashSet::new();
        for peer in &self.peers {
            if peer.peer_id == self.peer_id {
                anyhow::bail!("Local peer {} listed among remote peers", peer.peer_id);
            }
            if !seen_peer_ids.insert(&peer.peer_id) {
                anyhow::bail!("Duplicate peer_id: {}", peer.peer_id);
            }
            if peer.blockchains.is_empty() {
                anyhow::bail!("Peer {} has no blockchain membership", peer.peer_id);
            }
        }

        let r = &self.replication;
        if r.batch_size == 0 || r.shard_size == 0 {
            anyhow::bail!("batch_size and shard_size must be greater than 0");
        }
        if r.min_ack_responses > r.shard_size + 1 {
            anyhow::bail!(
                "min_ack_responses {} can never be reached with shard_size {}",
                r.min_ack_responses,
                r.shard_size
            );
        }
        if self.executor.parallelism == 0 {
            anyhow::bail!("executor.parallelism must be greater than 0");
        }

        Ok(())
    }

    #[must_use]
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerConfig> {
        self.peers.iter().find(|peer| &peer.peer_id == peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeConfig {
        let mut config = NodeConfig::new("node-1", vec!["otp:2043".into()]);
        config.peers = vec![
            PeerConfig {
                peer_id: "node-2".into(),
                address: "10.11.2.2:9000".parse().unwrap(),
                blockchains: vec!["otp:2043".into()],
            },
            PeerConfig {
                peer_id: "node-3".into(),
                address: "10.11.3.2:9000".parse().unwrap(),
                blockchains: vec!["otp:2043".into(), "gnosis:100".into()],
            },
        ];
        config
    }

    #[test]
    fn test_node_config_validation() {
        let config = sample();
        assert!(config.validate().is_ok());

        // Duplicate peer id
        let mut bad_config = config.clone();
        bad_config.peers[1].peer_id = "node-2".into();
        assert!(bad_config.validate().is_err());

        // Self listed as a peer
        let mut bad_config = config.clone();
        bad_config.peers[0].peer_id = "node-1".into();
        assert!(bad_config.validate().is_err());

        // Unreachable replication floor
        let mut bad_config = config.clone();
        bad_config.replication.shard_size = 2;
        bad_config.replication.min_ack_responses = 4;
        assert!(bad_config.validate().is_err());

        let mut bad_config = config;
        bad_config.blockchains.clear();
        assert!(bad_config.validate().is_err());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: NodeConfig = serde_json::from_str(
            r#"{ "peer_id": "node-1", "blockchains": ["otp:2043"] }"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr.port(), DKG_UDP_PORT);
        assert_eq!(config.replication.batch_size, 5);
        assert_eq!(config.protocol.init.timeout_ms, INIT_TIMEOUT_MS);
        assert_eq!(config.server.max_open_sessions, MAX_OPEN_SESSIONS);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let config = sample();
        config.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.peer_id, config.peer_id);
        assert_eq!(loaded.peers.len(), 2);
        assert!(loaded.get_peer(&"node-3".into()).is_some());
    }
}
