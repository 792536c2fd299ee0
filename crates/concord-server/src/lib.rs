//! # concord-server
//!
//! Runs one Concord node over TCP.
//!
//! A [`Server`] opens the node's log, recovers, and serves protocol
//! requests on the configured listen address. Peers are reached through a
//! [`TcpTransport`] built from the configuration's peer list.
//!
//! ```ignore
//! let config = NodeConfig::from_file(Path::new("node1.toml"))?;
//! let server = Server::start(config).await?;
//! // ...
//! server.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use concord_commit::{Node, TcpServer, TcpTransport, TransportError, TxnError};
use concord_common::config::{ConfigError, NodeConfig};
use concord_common::types::NodeId;

/// Errors raised while starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The node could not start.
    #[error("node error: {0}")]
    Node(#[from] TxnError),

    /// The listener could not be bound.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A node served over TCP.
#[derive(Debug)]
pub struct Server {
    node: Arc<Node>,
    transport: Arc<TcpTransport>,
    listener: TcpServer,
}

impl Server {
    /// Validates `config`, starts the node and binds its listener.
    pub async fn start(config: NodeConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let id = config.id();
        let listen_addr = config.listen_addr.clone();

        let transport = Arc::new(TcpTransport::new(
            id,
            config
                .peers
                .iter()
                .map(|p| (NodeId::new(p.id), p.addr.clone())),
        ));
        let node = Node::start(config, transport.clone())?;
        let listener = TcpServer::bind(&listen_addr, id, node.clone()).await?;

        info!(node = %id, addr = %listener.local_addr(), peers = transport.peers().len(), "server started");
        Ok(Self {
            node,
            transport,
            listener,
        })
    }

    /// Returns the node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Points `peer` at a new address.
    pub fn add_peer(&self, peer: NodeId, addr: impl Into<String>) {
        self.transport.add_peer(peer, addr);
    }

    /// Stops listening and shuts the node down.
    pub fn shutdown(&self) {
        self.listener.shutdown();
        self.node.simulate_crash();
        info!(node = %self.node.id(), "server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_commit::{
        CoordinatorState, Request, Response, SubmitMode, TransactionRequest, Transport,
    };
    use concord_common::config::TimeoutConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    fn config(dir: &TempDir, id: u32, peer: u32) -> NodeConfig {
        NodeConfig::new(n(id))
            .with_listen_addr("127.0.0.1:0")
            .with_wal_dir(dir.path().join(format!("node{}", id)))
            // Replaced once the peer's port is known.
            .with_peer(n(peer), "127.0.0.1:1")
            .with_account("alice", 100)
            .with_account("bob", 50)
            .with_timeouts(TimeoutConfig {
                heartbeat_interval_ms: 100,
                ..TimeoutConfig::default()
            })
    }

    #[tokio::test]
    async fn test_transfer_over_tcp() {
        let dir = TempDir::new().unwrap();
        let s1 = Server::start(config(&dir, 1, 2)).await.unwrap();
        let s2 = Server::start(config(&dir, 2, 1)).await.unwrap();
        s1.add_peer(n(2), s2.local_addr().to_string());
        s2.add_peer(n(1), s1.local_addr().to_string());

        let request = TransactionRequest::transfer(n(1), "alice", n(2), "bob", 30);
        let txn = s1.node().submit(request, SubmitMode::Sync).await.unwrap();
        assert_eq!(s1.node().coordinator_state(txn), Some(CoordinatorState::Committed));
        assert_eq!(s1.node().snapshot().unwrap()["alice"], 70);
        assert_eq!(s2.node().snapshot().unwrap()["bob"], 80);

        // Status queries travel over the wire too.
        let client = TcpTransport::new(n(9), vec![(n(2), s2.local_addr().to_string())]);
        let response = client.call(n(2), Request::Status { txn }).await.unwrap();
        match response {
            Response::TxnStatus(report) => assert!(report.is_terminal()),
            other => panic!("unexpected response {:?}", other),
        }

        s1.shutdown();
        s2.shutdown();
    }

    #[tokio::test]
    async fn test_submit_from_remote_client() {
        let dir = TempDir::new().unwrap();
        let s1 = Server::start(config(&dir, 1, 2)).await.unwrap();
        let s2 = Server::start(config(&dir, 2, 1)).await.unwrap();
        s1.add_peer(n(2), s2.local_addr().to_string());
        s2.add_peer(n(1), s1.local_addr().to_string());

        let client = TcpTransport::new(n(9), vec![(n(1), s1.local_addr().to_string())]);
        let request = TransactionRequest::transfer(n(2), "bob", n(1), "alice", 10);
        let response = client
            .call(n(1), Request::Submit { request, mode: SubmitMode::Async })
            .await
            .unwrap();
        let Response::Submitted { txn } = response else {
            panic!("unexpected response {:?}", response);
        };

        let state = tokio::time::timeout(Duration::from_secs(5), s1.node().wait_terminal(txn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, CoordinatorState::Committed);
        assert_eq!(s2.node().snapshot().unwrap()["bob"], 40);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bad = config(&dir, 1, 1);
        assert!(matches!(Server::start(bad).await, Err(ServerError::Config(_))));
    }
}
