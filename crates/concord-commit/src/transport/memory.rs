//! Loopback network for tests and single-process clusters.
//!
//! Every node registers its handler with one shared [`MemoryNetwork`].
//! A call runs the target's handler on its own task, so a caller that gives
//! up does not cancel work already under way on the receiving side.
//! Message loss and partitions are both expressed as [`DropRule`]s; a lost
//! request never gets an answer and the caller's timeout decides.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use concord_common::types::NodeId;

use crate::protocol::{Request, RequestKind, Response};

use super::{BoxFuture, RequestHandler, Transport, TransportError, TransportResult};

/// Drops every request matching all of its set fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DropRule {
    /// Sender to match, or any.
    pub from: Option<NodeId>,
    /// Receiver to match, or any.
    pub to: Option<NodeId>,
    /// Request kind to match, or any.
    pub kind: Option<RequestKind>,
}

impl DropRule {
    /// Drops requests of `kind` sent to `to`.
    pub fn kind_to(kind: RequestKind, to: NodeId) -> Self {
        Self {
            from: None,
            to: Some(to),
            kind: Some(kind),
        }
    }

    /// Drops everything `from` sends to `to`.
    pub fn link(from: NodeId, to: NodeId) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            kind: None,
        }
    }

    fn involves(&self, node: NodeId) -> bool {
        self.from == Some(node) || self.to == Some(node)
    }

    fn matches(&self, from: NodeId, to: NodeId, kind: RequestKind) -> bool {
        self.from.map_or(true, |f| f == from)
            && self.to.map_or(true, |t| t == to)
            && self.kind.map_or(true, |k| k == kind)
    }
}

/// Handlers of every node plus the active loss rules.
pub struct MemoryNetwork {
    handlers: DashMap<NodeId, Arc<dyn RequestHandler>>,
    rules: RwLock<Vec<DropRule>>,
    dropped: AtomicU64,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.node_ids())
            .field("rules", &*self.rules.read())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
            rules: RwLock::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }
}

impl MemoryNetwork {
    /// Creates an empty network behind an `Arc`, ready to hand out transports.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that sends as `node_id`.
    pub fn transport(self: &Arc<Self>, node_id: NodeId) -> MemoryTransport {
        MemoryTransport {
            node_id,
            network: Arc::clone(self),
        }
    }

    /// Routes requests addressed to `node_id` to `handler`, replacing any
    /// previous registration.
    pub fn register(&self, node_id: NodeId, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(node_id, handler);
    }

    /// Starts dropping requests that match `rule`.
    pub fn add_rule(&self, rule: DropRule) {
        self.rules.write().push(rule);
    }

    /// Cuts `a` and `b` off from each other in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut rules = self.rules.write();
        rules.push(DropRule::link(a, b));
        rules.push(DropRule::link(b, a));
    }

    /// Removes every rule naming `node` as sender or receiver.
    pub fn heal(&self, node: NodeId) {
        self.rules.write().retain(|r| !r.involves(node));
    }

    /// Removes every rule, restoring full connectivity.
    pub fn clear_rules(&self) {
        self.rules.write().clear();
    }

    /// Requests swallowed by a rule so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the registered nodes in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.handlers.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    fn should_drop(&self, from: NodeId, to: NodeId, request: &Request) -> bool {
        let kind = request.kind();
        self.rules.read().iter().any(|r| r.matches(from, to, kind))
    }

    /// Delivers a request and waits for the handler's response.
    async fn deliver(&self, from: NodeId, to: NodeId, request: Request) -> TransportResult<Response> {
        if self.should_drop(from, to, &request) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(%from, %to, kind = ?request.kind(), "dropping request");
            return std::future::pending().await;
        }

        let handler = self
            .handlers
            .get(&to)
            .map(|h| Arc::clone(h.value()))
            .ok_or(TransportError::UnknownNode(to))?;

        tokio::spawn(async move { handler.handle(from, request).await })
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                node_id: to,
                reason: e.to_string(),
            })
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    network: Arc<MemoryNetwork>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> NodeId {
        self.node_id
    }

    fn call(&self, to: NodeId, request: Request) -> BoxFuture<'_, TransportResult<Response>> {
        Box::pin(self.network.deliver(self.node_id, to, request))
    }
}
