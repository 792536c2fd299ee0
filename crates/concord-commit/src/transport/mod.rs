//! Network transport layer.
//!
//! Nodes talk in request/response pairs. This module provides:
//!
//! - [`Transport`]: sends a request to a peer and resolves to its response
//! - [`RequestHandler`]: serves requests on the receiving side
//! - [`MemoryNetwork`]: in-process network with message loss, for tests
//! - [`TcpTransport`] / [`TcpServer`]: framed TCP for real deployments
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  call(to, req)  ┌─────────────┐  handle(from, req)  ┌──────────────┐
//! │ Coordinator  │────────────────▶│  Transport  │────────────────────▶│    Node 2    │
//! │   (node 1)   │◀────────────────│    Layer    │◀────────────────────│ (participant)│
//! └──────────────┘     Response    └─────────────┘      Response       └──────────────┘
//! ```
//!
//! Transports never time out on their own unless the peer is known to be
//! gone; callers wrap every call in the timeout that fits the protocol step.

mod memory;
mod tcp;

pub use memory::{DropRule, MemoryNetwork, MemoryTransport};
pub use tcp::{TcpServer, TcpTransport};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use concord_common::types::NodeId;

use crate::protocol::{Request, Response};

/// Boxed future returned by the object-safe traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a call produced no response.
///
/// Every variant counts as a missing answer to the protocol: a missing
/// vote is an abort vote and a missing ack is retried.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be connected to, or the connection broke.
    #[error("cannot reach node {node_id}: {reason}")]
    ConnectionFailed {
        /// The unreachable peer.
        node_id: NodeId,
        /// What the connection attempt reported.
        reason: String,
    },

    /// A request or response could not be encoded.
    #[error("cannot encode message: {0}")]
    SerializationFailed(String),

    /// Bytes from the peer did not decode to a message.
    #[error("malformed message: {0}")]
    DeserializationFailed(String),

    /// The local node is down or shutting down.
    #[error("transport closed")]
    Closed,

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// No address or handler registered for the node.
    #[error("node {0} is not a cluster member")]
    UnknownNode(NodeId),

    /// Raised by [`call_timeout`], never by a transport itself.
    #[error("no response in time")]
    Timeout,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Sends requests to peers.
pub trait Transport: Send + Sync {
    /// Returns the id of the node this transport sends as.
    fn local_id(&self) -> NodeId;

    /// Sends `request` to `to` and waits for the response.
    ///
    /// A lost request or response never resolves; use [`call_timeout`]
    /// to bound the wait.
    fn call(&self, to: NodeId, request: Request) -> BoxFuture<'_, TransportResult<Response>>;
}

/// Serves requests arriving from peers.
pub trait RequestHandler: Send + Sync {
    /// Handles a request from `from`.
    ///
    /// The returned future may never complete, which is how a crashed
    /// node stays silent.
    fn handle(&self, from: NodeId, request: Request) -> BoxFuture<'_, Response>;
}

/// Calls `to`, giving up after `timeout`.
pub async fn call_timeout(
    transport: &dyn Transport,
    to: NodeId,
    request: Request,
    timeout: Duration,
) -> TransportResult<Response> {
    match tokio::time::timeout(timeout, transport.call(to, request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_name_the_peer() {
        let err = TransportError::ConnectionFailed {
            node_id: NodeId::new(2),
            reason: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "cannot reach node 2: refused");
        assert_eq!(
            TransportError::UnknownNode(NodeId::new(3)).to_string(),
            "node 3 is not a cluster member"
        );
    }

    #[tokio::test]
    async fn test_call_timeout_bounds_silence() {
        struct Silent;

        impl Transport for Silent {
            fn local_id(&self) -> NodeId {
                NodeId::new(1)
            }

            fn call(&self, _to: NodeId, _request: Request) -> BoxFuture<'_, TransportResult<Response>> {
                Box::pin(std::future::pending::<TransportResult<Response>>())
            }
        }

        let result = call_timeout(&Silent, NodeId::new(2), Request::Ping, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
