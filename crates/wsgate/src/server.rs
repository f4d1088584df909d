//! WsServer — listen/stop lifecycle, event dispatch, and peer queries.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::id::ConnectionId;
use crate::peer::{PeerConnection, PeerRegistry, SharedPeer};
use crate::transport::{self, TransportEvent};

/// Capacity of the transport-event and notification channels.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications raised to the consumer of a listening server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A WebSocket handshake completed and the peer is registered.
    ClientConnected { id: ConnectionId, protocol: String },
    /// A registered peer's connection closed.
    ClientDisconnected { id: ConnectionId },
    /// Bytes were appended to a registered peer's inbound buffer.
    DataReceived { id: ConnectionId },
}

/// The WebSocket server core.
///
/// Holds at most one listening context at a time; [`listen`](Self::listen)
/// always tears down the previous context first, so `is_listening()` is
/// true exactly when a context exists.
pub struct WsServer {
    registry: Arc<RwLock<PeerRegistry>>,
    ctx: Option<ListenerContext>,
}

/// Everything belonging to one listening context.
struct ListenerContext {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    transport_tx: mpsc::Sender<TransportEvent>,
    accept_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl WsServer {
    /// Create an idle server.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(PeerRegistry::new())),
            ctx: None,
        }
    }

    /// Whether a listening context is active.
    pub fn is_listening(&self) -> bool {
        self.ctx.is_some()
    }

    /// The bound address of the active context. `None` while idle. Useful
    /// when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.as_ref().map(|ctx| ctx.local_addr)
    }

    /// Start listening on `port`.
    ///
    /// Any existing context is fully stopped first, no two contexts ever
    /// coexist. Bind failures (port in use, privilege denied) are returned
    /// synchronously. On success, returns the channel on which
    /// [`ServerEvent`] notifications are delivered for this context.
    pub async fn listen(
        &mut self,
        port: u16,
        config: &ServerConfig,
    ) -> Result<mpsc::Receiver<ServerEvent>, ServerError> {
        self.stop().await;

        let protocols = config.normalized_protocols();
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let (transport_tx, transport_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(4);

        let dispatcher = EventDispatcher::new(Arc::clone(&self.registry));
        let dispatch_task = tokio::spawn(run_dispatcher(
            dispatcher,
            transport_rx,
            notify_tx,
            shutdown_tx.subscribe(),
        ));
        let accept_task = tokio::spawn(transport::run_acceptor(
            listener,
            protocols,
            transport_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        info!("WebSocket server listening on {local_addr}");
        self.ctx = Some(ListenerContext {
            local_addr,
            shutdown_tx,
            transport_tx,
            accept_task,
            dispatch_task,
        });
        Ok(notify_rx)
    }

    /// Stop listening. No-op while idle; safe to call repeatedly.
    ///
    /// Complete when it returns: both tasks have exited and every live peer
    /// is closed. Peers torn down here do not get individual
    /// `ClientDisconnected` notifications — the server itself is going away.
    pub async fn stop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };

        let _ = ctx.shutdown_tx.send(());
        let _ = ctx.accept_task.await;
        let _ = ctx.dispatch_task.await;

        let evicted = self.registry.write().await.drain();
        for peer in &evicted {
            peer.lock().await.close().await;
        }
        info!("WebSocket server stopped ({} peers closed)", evicted.len());
    }

    /// Whether `id` denotes a live connection.
    pub async fn has_peer(&self, id: ConnectionId) -> bool {
        self.registry.read().await.contains(id)
    }

    /// Number of live connections.
    pub async fn peer_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Handle to a live peer. An absent id is a not-found condition, never
    /// a panic.
    pub async fn get_peer(&self, id: ConnectionId) -> Result<PeerHandle, ServerError> {
        let ctx = self.ctx.as_ref().ok_or(ServerError::PeerNotFound(id))?;
        let peer = self
            .registry
            .read()
            .await
            .get(id)
            .ok_or(ServerError::PeerNotFound(id))?;
        Ok(PeerHandle {
            id,
            peer,
            transport_tx: ctx.transport_tx.clone(),
        })
    }
}

impl Default for WsServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side handle to one registered peer.
///
/// Cloning is cheap. The registry stays the sole authority on the peer's
/// lifetime; a handle held past the peer's close only sees drained buffers.
#[derive(Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    peer: SharedPeer,
    transport_tx: mpsc::Sender<TransportEvent>,
}

impl PeerHandle {
    /// The peer's connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The sub-protocol negotiated during the handshake.
    pub async fn protocol(&self) -> String {
        self.peer.lock().await.protocol().to_string()
    }

    /// Bytes waiting in the peer's inbound buffer.
    pub async fn available(&self) -> usize {
        self.peer.lock().await.available()
    }

    /// Drain and return the peer's inbound buffer.
    pub async fn take_received(&self) -> Vec<u8> {
        self.peer.lock().await.take_received()
    }

    /// Queue bytes on the peer's outbound buffer and request a flush on the
    /// connection's next writable opportunity.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ServerError> {
        self.peer.lock().await.enqueue(bytes);
        self.request_writable().await
    }

    /// Mark the peer for closure: its next writable opportunity terminates
    /// the connection instead of flushing data.
    pub async fn force_close(&self) -> Result<(), ServerError> {
        self.peer.lock().await.set_force_close();
        self.request_writable().await
    }

    async fn request_writable(&self) -> Result<(), ServerError> {
        self.transport_tx
            .send(TransportEvent::Writable { id: self.id })
            .await
            .map_err(|_| ServerError::NotListening)
    }
}

// ---------------------------------------------------------------------------
// Event dispatch
// ---------------------------------------------------------------------------

/// Translates transport events into registry mutations. The sole mutator
/// of the registry while a context runs. Each event yields at most one
/// consumer notification, which the dispatcher task delivers — keeping the
/// channel send out of `handle` means a slow consumer can never wedge the
/// registry.
struct EventDispatcher {
    registry: Arc<RwLock<PeerRegistry>>,
}

impl EventDispatcher {
    fn new(registry: Arc<RwLock<PeerRegistry>>) -> Self {
        Self { registry }
    }

    async fn handle(&self, event: TransportEvent) -> Option<ServerEvent> {
        match event {
            TransportEvent::Established {
                protocol,
                link,
                id_tx,
            } => {
                let id = {
                    let mut registry = self.registry.write().await;
                    let mut id = ConnectionId::generate();
                    while registry.contains(id) {
                        // Allocator entropy makes this loop body unreachable
                        // in practice.
                        id = ConnectionId::generate();
                    }
                    let peer = PeerConnection::new(id, protocol.clone(), link);
                    registry.insert(id, Arc::new(Mutex::new(peer)));
                    id
                };

                if id_tx.send(id).is_err() {
                    // The connection task died before learning its id; the
                    // consumer never saw this peer, so retract it silently.
                    warn!("Connection task for {id} vanished during registration");
                    if let Some(peer) = self.registry.write().await.remove(id) {
                        peer.lock().await.close().await;
                    }
                    return None;
                }

                debug!("Peer {id} connected (protocol: {protocol})");
                Some(ServerEvent::ClientConnected { id, protocol })
            }

            TransportEvent::Received { id, bytes } => {
                let Some(peer) = self.registry.read().await.get(id) else {
                    debug!("Data for unknown peer {id} dropped");
                    return None;
                };
                peer.lock().await.feed_inbound(&bytes);
                Some(ServerEvent::DataReceived { id })
            }

            TransportEvent::Writable { id } => {
                let Some(peer) = self.registry.read().await.get(id) else {
                    return None;
                };
                let mut peer = peer.lock().await;
                if peer.force_close_requested() {
                    // Terminate instead of flushing; the read loop observes
                    // the close and delivers the final Closed event.
                    peer.close().await;
                } else if let Err(e) = peer.flush().await {
                    warn!("Flush to peer {id} failed: {e}");
                }
                None
            }

            TransportEvent::Closed { id } => {
                // Unregistered ids (e.g. late events after a bulk stop())
                // are ignored, so a disconnect is never reported twice.
                let Some(peer) = self.registry.write().await.remove(id) else {
                    return None;
                };
                peer.lock().await.close().await;
                debug!("Peer {id} disconnected");
                Some(ServerEvent::ClientDisconnected { id })
            }
        }
    }
}

/// Dispatcher task: serializes all transport events for one context.
///
/// Notification delivery is preemptible: when the consumer stops draining
/// its receiver and the channel fills, the shutdown signal still wins, so
/// `stop()` always completes.
async fn run_dispatcher(
    dispatcher: EventDispatcher,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    notify_tx: mpsc::Sender<ServerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            event = transport_rx.recv() => {
                match event {
                    Some(event) => event,
                    None => break,
                }
            }
            _ = shutdown.recv() => {
                debug!("Dispatcher shutting down");
                break;
            }
        };

        let Some(notification) = dispatcher.handle(event).await else {
            continue;
        };
        tokio::select! {
            sent = notify_tx.send(notification) => {
                if sent.is_err() {
                    debug!("Notification receiver dropped");
                }
            }
            _ = shutdown.recv() => {
                debug!("Dispatcher shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
