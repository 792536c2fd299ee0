//! In-memory test clusters.
//!
//! Every node gets its own log directory under one temporary directory and
//! talks to the others over a shared [`MemoryNetwork`], so tests can crash,
//! delay, partition and restart nodes deterministically.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use concord_commit::{
    CoordinatorState, MemoryNetwork, Node, ParticipantState, PeerHealth, Transport,
};
use concord_common::config::{NodeConfig, TimeoutConfig};
use concord_common::types::{NodeId, TxnId};

use crate::utils::{fast_timeouts, wait_until};

/// Wraps the outbound transport of the node configured by the first
/// argument.
pub type TransportWrapper =
    Arc<dyn Fn(&NodeConfig, Arc<dyn Transport>) -> Arc<dyn Transport> + Send + Sync>;

/// Builder for [`TestCluster`].
pub struct ClusterBuilder {
    size: u32,
    timeouts: TimeoutConfig,
    accounts: BTreeMap<String, i64>,
    cooperative_termination: bool,
    deadlock_detection: bool,
    wrapper: Option<TransportWrapper>,
}

impl ClusterBuilder {
    /// Creates a builder for nodes `1..=size`, each seeded with accounts
    /// `a`, `b` and `c` holding 100.
    pub fn new(size: u32) -> Self {
        let accounts = ["a", "b", "c"]
            .into_iter()
            .map(|name| (name.to_string(), 100))
            .collect();
        Self {
            size,
            timeouts: fast_timeouts(),
            accounts,
            cooperative_termination: true,
            deadlock_detection: false,
            wrapper: None,
        }
    }

    /// Sets the protocol timeouts.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Adds or overrides a seed account on every node.
    pub fn with_account(mut self, name: &str, balance: i64) -> Self {
        self.accounts.insert(name.to_string(), balance);
        self
    }

    /// Enables or disables cooperative termination.
    pub fn with_cooperative_termination(mut self, enabled: bool) -> Self {
        self.cooperative_termination = enabled;
        self
    }

    /// Enables wait-for-graph deadlock detection.
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    /// Wraps every node's outbound transport.
    pub fn with_transport<F>(mut self, wrap: F) -> Self
    where
        F: Fn(&NodeConfig, Arc<dyn Transport>) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        self.wrapper = Some(Arc::new(wrap));
        self
    }

    /// Starts every node. Must run inside a Tokio runtime.
    pub fn build(self) -> TestCluster {
        let dir = TempDir::new().expect("temp dir");
        let network = MemoryNetwork::shared();
        let ids: Vec<NodeId> = (1..=self.size).map(NodeId::new).collect();

        let mut nodes = BTreeMap::new();
        for &id in &ids {
            let mut config = NodeConfig::new(id)
                .with_wal_dir(dir.path().join(format!("node{}", id)))
                .with_timeouts(self.timeouts.clone())
                .with_deadlock_detection(self.deadlock_detection)
                .with_cooperative_termination(self.cooperative_termination);
            for &peer in ids.iter().filter(|&&p| p != id) {
                config = config.with_peer(peer, format!("mem://{}", peer));
            }
            for (name, balance) in &self.accounts {
                config = config.with_account(name.clone(), *balance);
            }

            let base: Arc<dyn Transport> = Arc::new(network.transport(id));
            let transport = match &self.wrapper {
                Some(wrap) => wrap(&config, base),
                None => base,
            };
            let node = Node::start(config, transport).expect("node start");
            network.register(id, node.clone());
            nodes.insert(id, node);
        }

        TestCluster {
            dir,
            network,
            nodes,
            accounts: self.accounts,
        }
    }
}

/// A running in-memory cluster.
pub struct TestCluster {
    dir: TempDir,
    network: Arc<MemoryNetwork>,
    nodes: BTreeMap<NodeId, Arc<Node>>,
    accounts: BTreeMap<String, i64>,
}

impl TestCluster {
    /// Starts a cluster of `size` nodes with default settings.
    pub fn new(size: u32) -> Self {
        ClusterBuilder::new(size).build()
    }

    /// Returns a builder.
    pub fn builder(size: u32) -> ClusterBuilder {
        ClusterBuilder::new(size)
    }

    /// Returns node `id`.
    pub fn node(&self, id: u32) -> &Arc<Node> {
        &self.nodes[&NodeId::new(id)]
    }

    /// Returns every node.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    /// Returns the shared network.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Returns the root of the log directories.
    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Returns the balance of `account` on node `id`, if it is running.
    pub fn balance(&self, id: u32, account: &str) -> Option<i64> {
        self.node(id).snapshot()?.get(account).copied()
    }

    /// Returns the sum of every balance on every running node.
    pub fn total_balance(&self) -> i64 {
        self.nodes()
            .filter_map(|n| n.snapshot())
            .flat_map(|s| s.into_values())
            .sum()
    }

    /// Returns what [`total_balance`](Self::total_balance) was at start.
    pub fn seeded_total(&self) -> i64 {
        self.accounts.values().sum::<i64>() * self.nodes.len() as i64
    }

    /// Returns the total number of locks held across the cluster.
    pub fn locks_held(&self) -> usize {
        self.nodes().map(|n| n.lock_count()).sum()
    }

    /// Waits until node `id` coordinates `txn` in `state`.
    pub async fn wait_coordinator_state(
        &self,
        id: u32,
        txn: TxnId,
        state: CoordinatorState,
        timeout: Duration,
    ) -> bool {
        let node = self.node(id);
        wait_until(timeout, || node.coordinator_state(txn) == Some(state)).await
    }

    /// Waits until node `id` holds `txn` in `state`.
    pub async fn wait_participant_state(
        &self,
        id: u32,
        txn: TxnId,
        state: ParticipantState,
        timeout: Duration,
    ) -> bool {
        let node = self.node(id);
        wait_until(timeout, || node.participant_state(txn) == Some(state)).await
    }

    /// Probes until node `observer` considers node `target` down.
    pub async fn wait_down(&self, observer: u32, target: u32, timeout: Duration) -> bool {
        let node = self.node(observer);
        let target = NodeId::new(target);
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let _ = node.probe_peers().await;
            let down = node
                .node_status()
                .peers
                .iter()
                .any(|&(peer, health)| peer == target && health == PeerHealth::Down);
            if down {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}
