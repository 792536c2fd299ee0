//! Heartbeat-based failure detection.
//!
//! Each node pings its peers every heartbeat interval. A peer that
//! answered its last ping is `Up`; one that missed pings is `Suspect`
//! until it has been silent for the heartbeat timeout, then `Down`.
//! Enlistment refuses participants that are `Down`. The detector never
//! influences a decision already under way: a transaction that enlisted a
//! peer still waits for its vote or acknowledgment through the normal
//! timeouts and retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use concord_common::types::NodeId;

use crate::protocol::{Request, Response};
use crate::transport::{call_timeout, Transport};

/// Health of a peer as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerHealth {
    /// Never contacted.
    Unknown,
    /// Answered its last heartbeat.
    Up,
    /// Missed heartbeats, not yet for long.
    Suspect,
    /// Silent for longer than the heartbeat timeout.
    Down,
}

impl fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Up => "up",
            Self::Suspect => "suspect",
            Self::Down => "down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerRecord {
    last_seen: Option<Instant>,
    failures: u32,
}

/// Tracks peer liveness from heartbeats and protocol traffic.
pub struct FailureDetector {
    local: NodeId,
    peers: Vec<NodeId>,
    interval: Duration,
    timeout: Duration,
    records: RwLock<HashMap<NodeId, PeerRecord>>,
    started: Instant,
}

impl fmt::Debug for FailureDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureDetector")
            .field("local", &self.local)
            .field("peers", &self.snapshot())
            .finish()
    }
}

impl FailureDetector {
    /// Creates a detector for `peers`.
    pub fn new(local: NodeId, peers: Vec<NodeId>, interval: Duration, timeout: Duration) -> Self {
        Self {
            local,
            peers,
            interval,
            timeout,
            records: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Returns true if `node` is this node or a configured peer.
    pub fn knows(&self, node: NodeId) -> bool {
        node == self.local || self.peers.contains(&node)
    }

    /// Records an answer from `peer`.
    pub fn record_success(&self, peer: NodeId) {
        let mut records = self.records.write();
        let record = records.entry(peer).or_default();
        if record.failures > 0 {
            info!(peer = %peer, "peer is reachable again");
        }
        record.last_seen = Some(Instant::now());
        record.failures = 0;
    }

    /// Records a missed answer from `peer`.
    pub fn record_failure(&self, peer: NodeId) {
        let mut records = self.records.write();
        let record = records.entry(peer).or_default();
        record.failures = record.failures.saturating_add(1);
    }

    /// Returns the current health of `node`.
    pub fn health(&self, node: NodeId) -> PeerHealth {
        if node == self.local {
            return PeerHealth::Up;
        }
        let Some(record) = self.records.read().get(&node).copied() else {
            return PeerHealth::Unknown;
        };
        if record.failures == 0 {
            return if record.last_seen.is_some() {
                PeerHealth::Up
            } else {
                PeerHealth::Unknown
            };
        }
        let silent = record.last_seen.unwrap_or(self.started).elapsed();
        if silent >= self.timeout {
            PeerHealth::Down
        } else {
            PeerHealth::Suspect
        }
    }

    /// Returns true if `node` is considered down.
    pub fn is_down(&self, node: NodeId) -> bool {
        self.health(node) == PeerHealth::Down
    }

    /// Returns the health of every peer.
    pub fn snapshot(&self) -> Vec<(NodeId, PeerHealth)> {
        self.peers.iter().map(|&p| (p, self.health(p))).collect()
    }

    /// Pings one peer and records the result.
    pub async fn probe(&self, transport: &dyn Transport, peer: NodeId) -> PeerHealth {
        match call_timeout(transport, peer, Request::Ping, self.interval).await {
            Ok(Response::Pong { .. }) => self.record_success(peer),
            Ok(other) => {
                debug!(peer = %peer, response = ?other, "unexpected heartbeat answer");
                self.record_failure(peer);
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "heartbeat failed");
                self.record_failure(peer);
            }
        }
        self.health(peer)
    }

    /// Pings every peer in parallel.
    pub async fn probe_all(&self, transport: &dyn Transport) {
        let probes = self.peers.iter().map(|&peer| self.probe(transport, peer));
        let results = join_all(probes).await;
        for (peer, health) in self.peers.iter().zip(results) {
            if health == PeerHealth::Down {
                warn!(peer = %peer, "peer is down");
            }
        }
    }

    /// Sends heartbeats until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all(transport.as_ref()).await,
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(timeout_ms: u64) -> FailureDetector {
        FailureDetector::new(
            NodeId::new(1),
            vec![NodeId::new(2), NodeId::new(3)],
            Duration::from_millis(10),
            Duration::from_millis(timeout_ms),
        )
    }

    #[test]
    fn test_health_progression() {
        let fd = detector(10_000);
        let peer = NodeId::new(2);

        assert_eq!(fd.health(peer), PeerHealth::Unknown);
        assert_eq!(fd.health(NodeId::new(1)), PeerHealth::Up);

        fd.record_success(peer);
        assert_eq!(fd.health(peer), PeerHealth::Up);

        fd.record_failure(peer);
        assert_eq!(fd.health(peer), PeerHealth::Suspect);

        fd.record_success(peer);
        assert_eq!(fd.health(peer), PeerHealth::Up);
    }

    #[test]
    fn test_silence_beyond_timeout_is_down() {
        let fd = detector(0);
        let peer = NodeId::new(3);
        fd.record_failure(peer);
        assert!(fd.is_down(peer));
        assert_eq!(
            fd.snapshot(),
            vec![(NodeId::new(2), PeerHealth::Unknown), (peer, PeerHealth::Down)]
        );
    }

    #[test]
    fn test_knows() {
        let fd = detector(100);
        assert!(fd.knows(NodeId::new(1)));
        assert!(fd.knows(NodeId::new(3)));
        assert!(!fd.knows(NodeId::new(4)));
    }
}
