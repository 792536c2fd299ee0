//! TCP-based transport for production use.
//!
//! [`TcpServer`] accepts connections and hands each decoded request to the
//! node's [`RequestHandler`]; [`TcpTransport`] keeps one outgoing
//! connection per peer and multiplexes concurrent calls over it by request
//! id. Features:
//! - Connection reuse, with reconnection on the next call after a failure
//! - Message framing with length prefixes
//! - Requests served concurrently, answered in completion order

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use concord_common::types::NodeId;

use crate::protocol::frame::{self, Frame, Message};
use crate::protocol::{Request, Response};

use super::{BoxFuture, RequestHandler, Transport, TransportError, TransportResult};

/// Outgoing frames buffered per connection.
const OUTBOX_CAPACITY: usize = 256;

type PendingCalls = DashMap<u64, oneshot::Sender<Response>>;

/// Reads frames off a stream until it closes, passing each to `on_frame`.
async fn read_frames<F>(mut read_half: OwnedReadHalf, peer: &str, mut on_frame: F)
where
    F: FnMut(Frame),
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Connection to {} closed", peer);
                return;
            }
            Ok(_) => loop {
                match frame::frame_size(&buf) {
                    Ok(Some(size)) => {
                        let data = buf.split_to(size).freeze();
                        match frame::decode(data) {
                            Ok(frame) => on_frame(frame),
                            Err(e) => warn!("Decode error from {}: {}", peer, e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Dropping connection to {}: {}", peer, e);
                        return;
                    }
                }
            },
            Err(e) => {
                warn!("Read error from {}: {}", peer, e);
                return;
            }
        }
    }
}

/// Connection state for a peer.
struct PeerConnection {
    /// Sender for outgoing frames.
    outbox: mpsc::Sender<Bytes>,
    /// Calls waiting for their response.
    pending: Arc<PendingCalls>,
    /// Set once either half of the connection stopped.
    closed: Arc<AtomicBool>,
}

/// Removes a call from the pending map when the caller stops waiting.
struct PendingGuard {
    pending: Arc<PendingCalls>,
    request_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Client side of the TCP transport.
pub struct TcpTransport {
    /// This node's ID.
    node_id: NodeId,
    /// Known peer addresses.
    peer_addrs: RwLock<HashMap<NodeId, String>>,
    /// Open connections.
    connections: Arc<DashMap<NodeId, Arc<PeerConnection>>>,
    /// Next request id.
    next_request_id: AtomicU64,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("node_id", &self.node_id)
            .field("peers", &*self.peer_addrs.read())
            .finish()
    }
}

impl TcpTransport {
    /// Creates a transport that knows the given peers.
    pub fn new(node_id: NodeId, peers: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        Self {
            node_id,
            peer_addrs: RwLock::new(peers.into_iter().collect()),
            connections: Arc::new(DashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Adds or replaces a peer address.
    pub fn add_peer(&self, node_id: NodeId, addr: impl Into<String>) {
        self.peer_addrs.write().insert(node_id, addr.into());
    }

    /// Returns the list of known peer IDs.
    pub fn peers(&self) -> Vec<NodeId> {
        self.peer_addrs.read().keys().copied().collect()
    }

    /// Returns a live connection to `peer_id`, connecting if needed.
    async fn connection(&self, peer_id: NodeId) -> TransportResult<Arc<PeerConnection>> {
        if let Some(conn) = self.connections.get(&peer_id) {
            if !conn.closed.load(Ordering::Acquire) {
                return Ok(Arc::clone(conn.value()));
            }
        }

        let addr = self
            .peer_addrs
            .read()
            .get(&peer_id)
            .cloned()
            .ok_or(TransportError::UnknownNode(peer_id))?;

        debug!("Connecting to peer {} at {}", peer_id, addr);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                node_id: peer_id,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let (outbox, mut outbox_rx) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
        let conn = Arc::new(PeerConnection {
            outbox,
            pending: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        });

        // Writer task
        let closed = Arc::clone(&conn.closed);
        tokio::spawn(async move {
            while let Some(data) = outbox_rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!("Write error to peer {}: {}", peer_id, e);
                    break;
                }
            }
            closed.store(true, Ordering::Release);
        });

        // Reader task
        let pending = Arc::clone(&conn.pending);
        let closed = Arc::clone(&conn.closed);
        let connections = Arc::clone(&self.connections);
        let this = Arc::clone(&conn);
        tokio::spawn(async move {
            read_frames(read_half, &addr, |frame| match frame.message {
                Message::Response(response) => {
                    if let Some((_, tx)) = pending.remove(&frame.request_id) {
                        let _ = tx.send(response);
                    }
                }
                Message::Request(_) => {
                    warn!("Unexpected request from peer {} on a client connection", peer_id);
                }
            })
            .await;

            closed.store(true, Ordering::Release);
            // Dropping the senders fails every outstanding call.
            pending.clear();
            connections.remove_if(&peer_id, |_, c| Arc::ptr_eq(c, &this));
        });

        self.connections.insert(peer_id, Arc::clone(&conn));
        info!("Connected to peer {}", peer_id);
        Ok(conn)
    }

    async fn call_inner(&self, to: NodeId, request: Request) -> TransportResult<Response> {
        let conn = self.connection(to).await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let data = frame::encode(&Frame::request(self.node_id, request_id, request))?;

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&conn.pending),
            request_id,
        };

        conn.outbox
            .send(data)
            .await
            .map_err(|_| TransportError::ConnectionFailed {
                node_id: to,
                reason: "connection closed".to_string(),
            })?;

        rx.await.map_err(|_| TransportError::ConnectionFailed {
            node_id: to,
            reason: "connection closed before response".to_string(),
        })
    }
}

impl Transport for TcpTransport {
    fn local_id(&self) -> NodeId {
        self.node_id
    }

    fn call(&self, to: NodeId, request: Request) -> BoxFuture<'_, TransportResult<Response>> {
        Box::pin(self.call_inner(to, request))
    }
}

/// Accepts connections and serves requests with a [`RequestHandler`].
pub struct TcpServer {
    /// Bound address.
    local_addr: SocketAddr,
    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TcpServer {
    /// Binds `addr` and starts serving requests for `node_id`.
    pub async fn bind(
        addr: &str,
        node_id: NodeId,
        handler: Arc<dyn RequestHandler>,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Node {} listening on {}", node_id, local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!("Accepted connection from {}", peer);
                                let handler = Arc::clone(&handler);
                                let shutdown = shutdown_rx.clone();
                                tokio::spawn(serve_connection(stream, peer, node_id, handler, shutdown));
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Server shutdown requested");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the open ones.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves one accepted connection until it closes or the server stops.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    node_id: NodeId,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", peer, e);
    }
    let (read_half, mut write_half) = stream.into_split();
    let (outbox, mut outbox_rx) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);

    // Writer task
    tokio::spawn(async move {
        while let Some(data) = outbox_rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                warn!("Write error to {}: {}", peer, e);
                break;
            }
        }
    });

    let peer_name = peer.to_string();
    let reader = read_frames(read_half, &peer_name, |frame| {
        let Message::Request(request) = frame.message else {
            warn!("Unexpected response from {} on a server connection", peer);
            return;
        };
        let handler = Arc::clone(&handler);
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let response = handler.handle(frame.from, request).await;
            match frame::encode(&Frame::response(node_id, frame.request_id, response)) {
                Ok(data) => {
                    let _ = outbox.send(data).await;
                }
                Err(e) => warn!("Encode error: {}", e),
            }
        });
    });

    tokio::select! {
        _ = reader => {}
        _ = shutdown.changed() => {
            debug!("Closing connection from {}", peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::call_timeout;
    use std::time::Duration;

    struct Echo(NodeId);

    impl RequestHandler for Echo {
        fn handle(&self, _from: NodeId, request: Request) -> BoxFuture<'_, Response> {
            Box::pin(async move {
                match request {
                    Request::Ping => Response::Pong { node: self.0 },
                    Request::Status { .. } => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Response::Ack
                    }
                    _ => Response::Ack,
                }
            })
        }
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let server = TcpServer::bind("127.0.0.1:0", NodeId::new(2), Arc::new(Echo(NodeId::new(2))))
            .await
            .unwrap();
        let transport = TcpTransport::new(
            NodeId::new(1),
            vec![(NodeId::new(2), server.local_addr().to_string())],
        );

        let response = call_timeout(&transport, NodeId::new(2), Request::Ping, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response, Response::Pong { node: NodeId::new(2) });

        server.shutdown();
    }

    #[tokio::test]
    async fn test_tcp_concurrent_calls_share_connection() {
        let server = TcpServer::bind("127.0.0.1:0", NodeId::new(2), Arc::new(Echo(NodeId::new(2))))
            .await
            .unwrap();
        let transport = TcpTransport::new(
            NodeId::new(1),
            vec![(NodeId::new(2), server.local_addr().to_string())],
        );
        let txn = concord_common::types::TxnId::compose(NodeId::new(1), 1);

        let (slow, fast) = tokio::join!(
            transport.call(NodeId::new(2), Request::Status { txn }),
            transport.call(NodeId::new(2), Request::Ping),
        );
        assert_eq!(slow.unwrap(), Response::Ack);
        assert_eq!(fast.unwrap(), Response::Pong { node: NodeId::new(2) });
    }

    #[tokio::test]
    async fn test_tcp_unknown_and_unreachable_peer() {
        let transport = TcpTransport::new(NodeId::new(1), vec![]);
        let err = transport.call(NodeId::new(5), Request::Ping).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownNode(_)));

        // Bind and drop a listener to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        transport.add_peer(NodeId::new(5), addr.to_string());
        let err = transport.call(NodeId::new(5), Request::Ping).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
    }
}
