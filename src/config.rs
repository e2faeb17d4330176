//! raftd Configuration
//!
//! This module provides configuration structures for a raftd node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::state::{Membership, NodeDescriptor};

/// Main raftd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftdConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Log storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the log and ledger
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Log storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// Enable LZ4 compression for log records
    #[serde(default)]
    pub compression: bool,

    /// Use fsync for durability (disable only for throwaway nodes)
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Initial voters other than this node, as `id@host:port`
    #[serde(default)]
    pub peers: Vec<String>,

    /// Start without voters and wait to be added through Join
    #[serde(default)]
    pub join: bool,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Maximum entries per AppendEntries request
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// Connect timeout for peer connections in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-RPC timeout in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_segment_size_mb() -> u64 {
    64
}

fn default_heartbeat_interval_ms() -> u64 {
    150
}

fn default_election_timeout_min_ms() -> u64 {
    500
}

fn default_election_timeout_max_ms() -> u64 {
    1000
}

fn default_max_batch_entries() -> usize {
    64
}

fn default_connect_timeout_ms() -> u64 {
    300
}

fn default_rpc_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/raftd")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            segment_size_mb: default_segment_size_mb(),
            compression: false,
            fsync: true,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            join: false,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            max_batch_entries: default_max_batch_entries(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RaftdConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RaftdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.id.contains('@') {
            return Err(crate::Error::Config("node.id cannot contain '@'".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        for peer in self.peer_descriptors()? {
            if peer.id == self.node.id {
                return Err(crate::Error::Config(format!(
                    "cluster.peers lists this node ({})",
                    peer.id
                )));
            }
        }

        let cluster = &self.cluster;
        if cluster.election_timeout_min_ms > cluster.election_timeout_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_timeout_min_ms must not exceed election_timeout_max_ms".into(),
            ));
        }

        if cluster.heartbeat_interval_ms == 0
            || cluster.heartbeat_interval_ms >= cluster.election_timeout_min_ms
        {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_ms must be non-zero and below election_timeout_min_ms".into(),
            ));
        }

        if cluster.max_batch_entries == 0 {
            return Err(crate::Error::Config("cluster.max_batch_entries must be at least 1".into()));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// This node's descriptor
    pub fn self_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new(self.node.id.clone(), self.advertise_address())
    }

    /// Parse the configured peers
    pub fn peer_descriptors(&self) -> crate::Result<Vec<NodeDescriptor>> {
        self.cluster
            .peers
            .iter()
            .map(|p| {
                NodeDescriptor::parse(p)
                    .map_err(|e| crate::Error::Config(format!("cluster.peers: {}", e)))
            })
            .collect()
    }

    /// Voter set this node starts with before reading its log
    pub fn initial_membership(&self) -> crate::Result<Membership> {
        if self.cluster.join {
            return Ok(Membership::default());
        }
        let mut voters = self.peer_descriptors()?;
        voters.push(self.self_descriptor());
        Ok(Membership::new(voters))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the log directory path
    pub fn log_dir(&self) -> PathBuf {
        self.node.data_dir.join("log")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get RPC timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.rpc_timeout_ms)
    }

    /// Sample configuration written by `raftd init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# raftd node configuration

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
# advertise_address = "10.0.0.1:7654"
data_dir = "/var/lib/raftd"

[storage]
segment_size_mb = 64
compression = false
fsync = true

[cluster]
# Other initial voters as id@host:port
peers = []
# Set to true on a node that will be added to a running cluster with `raftd join`
join = false
heartbeat_interval_ms = 150
election_timeout_min_ms = 500
election_timeout_max_ms = 1000
max_batch_entries = 64

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:7654"
advertise_address = "10.0.0.1:7654"
data_dir = "/tmp/raftd"

[cluster]
peers = ["node-2@10.0.0.2:7654", "node-3@10.0.0.3:7654"]
"#;

        let config = RaftdConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.cluster.peers.len(), 2);
        assert!(config.storage.fsync);

        let membership = config.initial_membership().unwrap();
        assert_eq!(membership.size(), 3);
        assert_eq!(membership.quorum_size(), 2);
        assert_eq!(membership.address_of("node-1"), Some("10.0.0.1:7654"));
    }

    #[test]
    fn test_join_mode_starts_without_voters() {
        let toml = r#"
[node]
id = "node-4"
bind_address = "127.0.0.1:7657"

[cluster]
join = true
"#;
        let config = RaftdConfig::from_str(toml).unwrap();
        assert_eq!(config.initial_membership().unwrap().size(), 0);
    }

    #[test]
    fn test_heartbeat_must_be_below_election_timeout() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:7654"

[cluster]
heartbeat_interval_ms = 600
election_timeout_min_ms = 500
"#;
        assert!(matches!(
            RaftdConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_self_as_peer() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:7654"

[cluster]
peers = ["node-1@10.0.0.1:7654"]
"#;
        assert!(RaftdConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_sample_is_valid() {
        let config = RaftdConfig::from_str(&RaftdConfig::sample("node-9")).unwrap();
        assert_eq!(config.node.id, "node-9");
    }
}
