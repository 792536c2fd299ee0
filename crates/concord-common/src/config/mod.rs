//! Node configuration.
//!
//! A node is configured from a TOML file. Every field has a default so a
//! file only needs to name what differs:
//!
//! ```toml
//! node_id = 1
//! listen_addr = "127.0.0.1:7401"
//! wal_dir = "data/node1/wal"
//!
//! [[peers]]
//! id = 2
//! addr = "127.0.0.1:7402"
//!
//! [accounts]
//! alice = 100
//!
//! [timeouts]
//! prepare_timeout_ms = 5000
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::*;
use crate::types::{NodeId, TxnId};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML.
    #[error("config render error: {0}")]
    Render(#[from] toml::ser::Error),

    /// The configuration is well-formed but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Address of another node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node id.
    pub id: u32,
    /// Peer listen address (`host:port`).
    pub addr: String,
}

/// Protocol timeouts, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on waiting for every vote during prepare.
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_ms: u64,

    /// Bound on one COMMIT/ABORT delivery attempt.
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_ms: u64,

    /// Bound on one operation dispatch to a participant.
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout_ms: u64,

    /// Bound on waiting for a lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Interval between heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is considered down.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// First dissemination retry delay.
    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    /// Cap on the dissemination retry delay.
    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Interval between outcome queries by an in-doubt participant.
    #[serde(default = "default_outcome_query_interval")]
    pub outcome_query_interval_ms: u64,

    /// Idle time after which an unvoted transaction asks its coordinator
    /// whether to carry on.
    #[serde(default = "default_active_idle_timeout")]
    pub active_idle_timeout_ms: u64,
}

fn default_prepare_timeout() -> u64 {
    DEFAULT_PREPARE_TIMEOUT_MS
}

fn default_commit_timeout() -> u64 {
    DEFAULT_COMMIT_TIMEOUT_MS
}

fn default_execute_timeout() -> u64 {
    DEFAULT_EXECUTE_TIMEOUT_MS
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}

fn default_retry_initial_backoff() -> u64 {
    DEFAULT_RETRY_INITIAL_BACKOFF_MS
}

fn default_retry_max_backoff() -> u64 {
    DEFAULT_RETRY_MAX_BACKOFF_MS
}

fn default_outcome_query_interval() -> u64 {
    DEFAULT_OUTCOME_QUERY_INTERVAL_MS
}

fn default_active_idle_timeout() -> u64 {
    DEFAULT_ACTIVE_IDLE_TIMEOUT_MS
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_ms: default_prepare_timeout(),
            commit_timeout_ms: default_commit_timeout(),
            execute_timeout_ms: default_execute_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            outcome_query_interval_ms: default_outcome_query_interval(),
            active_idle_timeout_ms: default_active_idle_timeout(),
        }
    }
}

impl TimeoutConfig {
    /// Prepare timeout as a `Duration`.
    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    /// Commit delivery timeout as a `Duration`.
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Execute timeout as a `Duration`.
    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    /// Lock timeout as a `Duration`.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Initial retry backoff as a `Duration`.
    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    /// Maximum retry backoff as a `Duration`.
    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    /// Outcome query interval as a `Duration`.
    pub fn outcome_query_interval(&self) -> Duration {
        Duration::from_millis(self.outcome_query_interval_ms)
    }

    /// Active idle timeout as a `Duration`.
    pub fn active_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.active_idle_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("prepare_timeout_ms", self.prepare_timeout_ms),
            ("commit_timeout_ms", self.commit_timeout_ms),
            ("execute_timeout_ms", self.execute_timeout_ms),
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("retry_initial_backoff_ms", self.retry_initial_backoff_ms),
            ("retry_max_backoff_ms", self.retry_max_backoff_ms),
            ("outcome_query_interval_ms", self.outcome_query_interval_ms),
            ("active_idle_timeout_ms", self.active_idle_timeout_ms),
        ];
        if let Some((name, _)) = named.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry_initial_backoff_ms must not exceed retry_max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a single Concord node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id.
    #[serde(default = "default_node_id")]
    pub node_id: u32,

    /// Address to listen on for protocol traffic.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory holding the write-ahead log.
    #[serde(default = "default_wal_dir")]
    pub wal_dir: PathBuf,

    /// Other nodes in the cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Seed balances for the local account store.
    #[serde(default)]
    pub accounts: BTreeMap<String, i64>,

    /// Use wait-for-graph deadlock detection in addition to lock timeouts.
    #[serde(default)]
    pub deadlock_detection: bool,

    /// Let in-doubt participants ask their peers for the outcome.
    #[serde(default = "default_cooperative_termination")]
    pub cooperative_termination: bool,

    /// Finished transactions each role keeps answering queries about.
    #[serde(default = "default_retained_transactions")]
    pub retained_transactions: usize,

    /// Protocol timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_node_id() -> u32 {
    1
}

fn default_listen_addr() -> String {
    "127.0.0.1:7401".to_string()
}

fn default_wal_dir() -> PathBuf {
    PathBuf::from("data/wal")
}

fn default_cooperative_termination() -> bool {
    true
}

fn default_retained_transactions() -> usize {
    DEFAULT_RETAINED_TRANSACTIONS
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen_addr: default_listen_addr(),
            wal_dir: default_wal_dir(),
            peers: Vec::new(),
            accounts: BTreeMap::new(),
            deadlock_detection: false,
            cooperative_termination: default_cooperative_termination(),
            retained_transactions: default_retained_transactions(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Creates a configuration for the given node with default settings.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id: node_id.as_u32(),
            ..Default::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns this node's id.
    pub fn id(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    /// Returns the ids of all configured peers.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| NodeId::new(p.id)).collect()
    }

    /// Sets the listen address.
    #[must_use]
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Sets the WAL directory.
    #[must_use]
    pub fn with_wal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal_dir = dir.into();
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            id: id.as_u32(),
            addr: addr.into(),
        });
        self
    }

    /// Seeds an account balance.
    #[must_use]
    pub fn with_account(mut self, name: impl Into<String>, balance: i64) -> Self {
        self.accounts.insert(name.into(), balance);
        self
    }

    /// Replaces the timeout configuration.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enables or disables wait-for-graph deadlock detection.
    #[must_use]
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    /// Enables or disables cooperative termination.
    #[must_use]
    pub fn with_cooperative_termination(mut self, enabled: bool) -> Self {
        self.cooperative_termination = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::Invalid("node_id must be positive".to_string()));
        }
        if self.node_id > TxnId::MAX_COORDINATOR.as_u32() {
            return Err(ConfigError::Invalid(format!(
                "node_id {} exceeds {}",
                self.node_id,
                TxnId::MAX_COORDINATOR
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.node_id {
                return Err(ConfigError::Invalid(format!(
                    "node {} lists itself as a peer",
                    self.node_id
                )));
            }
            if peer.id == 0 {
                return Err(ConfigError::Invalid("peer id must be positive".to_string()));
            }
            if peer.id > TxnId::MAX_COORDINATOR.as_u32() {
                return Err(ConfigError::Invalid(format!(
                    "peer id {} exceeds {}",
                    peer.id,
                    TxnId::MAX_COORDINATOR
                )));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::Invalid(format!("duplicate peer {}", peer.id)));
            }
        }

        if let Some((name, balance)) = self.accounts.iter().find(|(_, b)| **b < 0) {
            return Err(ConfigError::Invalid(format!(
                "account {} has negative seed balance {}",
                name, balance
            )));
        }

        self.timeouts.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeouts.prepare_timeout(), Duration::from_secs(5));
        assert!(config.cooperative_termination);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            node_id = 3
            [[peers]]
            id = 1
            addr = "127.0.0.1:7401"
            [accounts]
            alice = 50
            [timeouts]
            prepare_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.id(), NodeId::new(3));
        assert_eq!(config.peer_ids(), vec![NodeId::new(1)]);
        assert_eq!(config.accounts.get("alice"), Some(&50));
        assert_eq!(config.timeouts.prepare_timeout_ms, 250);
        assert_eq!(config.timeouts.commit_timeout_ms, DEFAULT_COMMIT_TIMEOUT_MS);
        assert_eq!(config.timeouts.active_idle_timeout_ms, DEFAULT_ACTIVE_IDLE_TIMEOUT_MS);
        assert_eq!(config.retained_transactions, DEFAULT_RETAINED_TRANSACTIONS);
    }

    #[test]
    fn test_validation_rejects_self_peer() {
        let config = NodeConfig::new(NodeId::new(1)).with_peer(NodeId::new(1), "x:1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_node_id() {
        let widest = NodeId::new((1 << 24) - 1);
        assert!(NodeConfig::new(widest).validate().is_ok());
        assert!(NodeConfig::new(NodeId::new(1 << 24)).validate().is_err());
        assert!(NodeConfig::new(NodeId::new((1 << 24) + 1)).validate().is_err());

        let config = NodeConfig::new(NodeId::new(1)).with_peer(NodeId::new(1 << 24), "x:1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_peer() {
        let config = NodeConfig::new(NodeId::new(1))
            .with_peer(NodeId::new(2), "x:1")
            .with_peer(NodeId::new(2), "x:2");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_backoff() {
        let mut timeouts = TimeoutConfig::default();
        timeouts.retry_initial_backoff_ms = 5000;
        timeouts.retry_max_backoff_ms = 10;
        let config = NodeConfig::default().with_timeouts(timeouts);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut timeouts = TimeoutConfig::default();
        timeouts.lock_timeout_ms = 0;
        let config = NodeConfig::default().with_timeouts(timeouts);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.toml");

        let config = NodeConfig::new(NodeId::new(2))
            .with_peer(NodeId::new(1), "127.0.0.1:7401")
            .with_account("bob", 10);
        config.save(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, 2);
        assert_eq!(loaded.peers, config.peers);
        assert_eq!(loaded.accounts, config.accounts);
    }
}
