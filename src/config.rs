//! Configuration module for lockstep.

use crate::error::{LockstepError, Result};
use crate::types::{NodeId, Peer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a lockstep node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Lock protocol configuration.
    pub lock: LockConfig,
    /// Consensus engine configuration.
    pub consensus: ConsensusConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl LockstepConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LockstepError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| LockstepError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(LockstepError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        // Peer specs must parse, and this node must appear in its own view.
        let peers = self.consensus.peers()?;
        if !peers.is_empty() && !peers.iter().any(|p| p.id == self.node.id) {
            return Err(LockstepError::InvalidConfig {
                field: "consensus.peers".to_string(),
                reason: format!("Node {} is missing from the peer list", self.node.id),
            });
        }

        if self.lock.rpc_timeout.is_zero() || self.consensus.rpc_timeout.is_zero() {
            return Err(LockstepError::InvalidConfig {
                field: "rpc_timeout".to_string(),
                reason: "RPC timeouts must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration: a single standalone
    /// replica serving on localhost, pinned primary.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                bind_addr: "127.0.0.1:7800".parse().expect("valid socket address"),
                data_dir: PathBuf::from("/tmp/lockstep"),
                primary: true,
            },
            lock: LockConfig::default(),
            consensus: ConsensusConfig {
                peers: vec!["1=127.0.0.1:7800".to_string()],
                ..ConsensusConfig::default()
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Address the replica's HTTP endpoints bind to.
    pub bind_addr: SocketAddr,
    /// Directory for the durable consensus log.
    pub data_dir: PathBuf,
    /// Whether this node starts as primary. A standalone deployment pins
    /// this to true; a replicated one lets the harness drive it.
    pub primary: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            bind_addr: "127.0.0.1:7800".parse().expect("valid socket address"),
            data_dir: PathBuf::from("/var/lib/lockstep"),
            primary: true,
        }
    }
}

/// Lock protocol configuration, covering both the server side and the
/// caching client run inside application processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Address of the lock server a client connects to (`host:port`).
    pub server_addr: String,
    /// Address the client's revoke/retry callback listener binds to.
    pub callback_bind_addr: SocketAddr,
    /// Per-request timeout for lock RPCs.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Connection establishment timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Delay before re-sending a failed asynchronous release.
    #[serde(with = "humantime_serde")]
    pub release_retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7800".to_string(),
            callback_bind_addr: "127.0.0.1:0".parse().expect("valid socket address"),
            rpc_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            release_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Consensus engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Acceptor nodes, as `id=host:port` entries. Includes this node.
    pub peers: Vec<String>,
    /// Per-request timeout for prepare/accept/decide RPCs.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Value committed as instance 1 when the durable log is empty.
    /// Defaults to the serialized peer list when unset.
    pub initial_view: Option<String>,
}

impl ConsensusConfig {
    /// Parse the configured peer list.
    pub fn peers(&self) -> Result<Vec<Peer>> {
        self.peers.iter().map(|s| s.parse()).collect()
    }

    /// The value seeded as the first view: the configured override, or
    /// the peer list joined with commas.
    pub fn bootstrap_view(&self) -> String {
        self.initial_view
            .clone()
            .unwrap_or_else(|| self.peers.join(","))
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            peers: vec![],
            rpc_timeout: Duration::from_millis(500),
            initial_view: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_addr: "0.0.0.0:9100".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockstepConfig::default();
        assert_eq!(config.node.id, 1);
        assert!(config.node.primary);
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn test_development_config_validates() {
        let config = LockstepConfig::development();
        config.validate().unwrap();
        assert_eq!(config.consensus.peers().unwrap().len(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_node_id() {
        let mut config = LockstepConfig::development();
        config.node.id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_self_in_peers() {
        let mut config = LockstepConfig::development();
        config.consensus.peers = vec!["2=127.0.0.1:7801".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bootstrap_view_defaults_to_peer_list() {
        let mut config = LockstepConfig::development();
        config.consensus.peers = vec!["1=a:1".to_string(), "2=b:2".to_string()];
        assert_eq!(config.consensus.bootstrap_view(), "1=a:1,2=b:2");

        config.consensus.initial_view = Some("custom".to_string());
        assert_eq!(config.consensus.bootstrap_view(), "custom");
    }

    #[test]
    fn test_duration_round_trip() {
        let config = LockstepConfig::development();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LockstepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.lock.rpc_timeout, config.lock.rpc_timeout);
        assert_eq!(parsed.consensus.rpc_timeout, config.consensus.rpc_timeout);
    }
}
