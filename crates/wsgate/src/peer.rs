//! Peer connections and the live-peer registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::ServerError;
use crate::id::ConnectionId;
use crate::transport::FrameSink;

/// Capacity reserved for each direction's ring buffer on open.
const INITIAL_BUFFER_CAPACITY: usize = 16;

/// Shared handle to one peer. The registry and the dispatcher both hold
/// clones, but only registry removal ends the peer's registered life.
pub type SharedPeer = Arc<Mutex<PeerConnection>>;

/// One accepted, upgraded WebSocket connection.
///
/// Reads and writes are buffer-mediated: the dispatcher appends inbound
/// frames to the read ring, and queued outbound bytes are flushed to the
/// transport on the connection's next writable opportunity.
pub struct PeerConnection {
    id: ConnectionId,
    protocol: String,
    connected_at: DateTime<Utc>,
    link: Option<Box<dyn FrameSink + Send>>,
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
    force_close: bool,
}

impl PeerConnection {
    pub(crate) fn new(id: ConnectionId, protocol: String, link: Box<dyn FrameSink + Send>) -> Self {
        Self {
            id,
            protocol,
            connected_at: Utc::now(),
            link: Some(link),
            inbound: VecDeque::with_capacity(INITIAL_BUFFER_CAPACITY),
            outbound: VecDeque::with_capacity(INITIAL_BUFFER_CAPACITY),
            force_close: false,
        }
    }

    /// The connection's identifier, assigned once at establishment.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The sub-protocol negotiated during the handshake.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// When the handshake completed.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the transport link is still attached.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Bytes waiting in the inbound buffer.
    pub fn available(&self) -> usize {
        self.inbound.len()
    }

    /// Bytes queued for the next flush.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the next writable opportunity must close instead of flush.
    pub fn force_close_requested(&self) -> bool {
        self.force_close
    }

    /// Mark the connection for closure on its next writable opportunity.
    pub fn set_force_close(&mut self) {
        self.force_close = true;
    }

    /// Append received bytes to the inbound buffer.
    pub(crate) fn feed_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    /// Drain and return everything in the inbound buffer.
    pub fn take_received(&mut self) -> Vec<u8> {
        self.inbound.drain(..).collect()
    }

    /// Queue bytes for delivery on the next writable opportunity.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes.iter().copied());
    }

    /// Flush the outbound buffer to the transport as one binary frame.
    ///
    /// A no-op when nothing is queued or the link is already gone (a flush
    /// can race the connection's close).
    pub(crate) async fn flush(&mut self) -> Result<(), ServerError> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let frame: Vec<u8> = self.outbound.drain(..).collect();
        link.send_binary(frame).await
    }

    /// Detach and close the transport link and release both buffers.
    ///
    /// Idempotent; the registry entry (if any) is the caller's concern.
    pub(crate) async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.close().await;
        }
        self.inbound.clear();
        self.inbound.shrink_to_fit();
        self.outbound.clear();
        self.outbound.shrink_to_fit();
    }
}

/// Registry of live peers — the single source of truth for "is this
/// connection alive".
///
/// An id present here always denotes an open connection; absence means the
/// id was never issued or the connection is fully closed.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<ConnectionId, SharedPeer>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Register a newly established peer.
    ///
    /// The allocator guarantees fresh ids, so a collision here is an
    /// invariant violation rather than a normal path.
    pub(crate) fn insert(&mut self, id: ConnectionId, peer: SharedPeer) {
        debug_assert!(!self.peers.contains_key(&id), "duplicate live id {id}");
        self.peers.insert(id, peer);
    }

    /// Remove a peer; no-op when absent.
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<SharedPeer> {
        self.peers.remove(&id)
    }

    /// Whether the id denotes a live connection.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Shared handle to a live peer, if any.
    pub fn get(&self, id: ConnectionId) -> Option<SharedPeer> {
        self.peers.get(&id).cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Empty the registry, returning the evicted peers for bulk teardown.
    pub(crate) fn drain(&mut self) -> Vec<SharedPeer> {
        self.peers.drain().map(|(_, peer)| peer).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::SinkProbe;

    fn make_peer(probe: &SinkProbe) -> PeerConnection {
        PeerConnection::new(
            ConnectionId::generate(),
            "binary".to_string(),
            probe.new_sink(),
        )
    }

    #[test]
    fn test_new_peer_starts_open_with_reserved_buffers() {
        let probe = SinkProbe::default();
        let peer = make_peer(&probe);
        assert!(peer.is_open());
        assert!(!peer.force_close_requested());
        assert_eq!(peer.available(), 0);
        assert_eq!(peer.pending_outbound(), 0);
        assert!(peer.inbound.capacity() >= INITIAL_BUFFER_CAPACITY);
        assert!(peer.outbound.capacity() >= INITIAL_BUFFER_CAPACITY);
        assert_eq!(peer.protocol(), "binary");
        assert!(peer.connected_at() <= Utc::now());
    }

    #[test]
    fn test_feed_and_take_inbound() {
        let probe = SinkProbe::default();
        let mut peer = make_peer(&probe);
        peer.feed_inbound(&[1, 2]);
        peer.feed_inbound(&[3]);
        assert_eq!(peer.available(), 3);
        assert_eq!(peer.take_received(), vec![1, 2, 3]);
        assert_eq!(peer.available(), 0);
    }

    #[tokio::test]
    async fn test_flush_drains_outbound_as_one_frame() {
        let probe = SinkProbe::default();
        let mut peer = make_peer(&probe);
        peer.enqueue(&[9, 8]);
        peer.enqueue(&[7]);
        peer.flush().await.unwrap();
        assert_eq!(probe.sent(), vec![vec![9, 8, 7]]);
        assert_eq!(peer.pending_outbound(), 0);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_queued_sends_nothing() {
        let probe = SinkProbe::default();
        let mut peer = make_peer(&probe);
        peer.flush().await.unwrap();
        assert!(probe.sent().is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_link_and_buffers() {
        let probe = SinkProbe::default();
        let mut peer = make_peer(&probe);
        peer.feed_inbound(&[1, 2, 3]);
        peer.enqueue(&[4, 5]);
        peer.close().await;
        assert!(probe.is_closed());
        assert!(!peer.is_open());
        assert_eq!(peer.available(), 0);
        assert_eq!(peer.pending_outbound(), 0);

        // Flushing after close is a silent no-op.
        peer.enqueue(&[6]);
        peer.flush().await.unwrap();
        assert!(probe.sent().is_empty());
    }

    #[tokio::test]
    async fn test_registry_insert_get_remove() {
        let probe = SinkProbe::default();
        let peer = make_peer(&probe);
        let id = peer.id();

        let mut registry = PeerRegistry::new();
        assert!(registry.is_empty());

        registry.insert(id, Arc::new(Mutex::new(peer)));
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(id).unwrap().lock().await.id(), id);

        assert!(registry.remove(id).is_some());
        assert!(!registry.contains(id));
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_registry_drain_empties_all() {
        let mut registry = PeerRegistry::new();
        for _ in 0..3 {
            let probe = SinkProbe::default();
            let peer = make_peer(&probe);
            let id = peer.id();
            registry.insert(id, Arc::new(Mutex::new(peer)));
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
    }
}
