//! wsgate — a WebSocket server core.
//!
//! Accepts inbound WebSocket connections on a TCP port, assigns each one a
//! stable 31-bit identifier, tracks per-connection read/write buffering,
//! and delivers lifecycle and data notifications to the consumer.
//!
//! # Architecture
//!
//! - **Transport**: `tokio-tungstenite` owns the TCP accept, the HTTP
//!   upgrade, sub-protocol negotiation, and frame I/O.
//! - **Dispatch**: a single task serializes transport events, mutates the
//!   peer registry, and raises [`ServerEvent`] notifications over a channel.
//! - **Registry**: the one source of truth for "is this connection alive";
//!   removing an entry is the only destruction path for a peer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use wsgate::{ServerConfig, ServerEvent, WsServer};
//!
//! # async fn example() {
//! let mut server = WsServer::new();
//! let mut events = server.listen(8080, &ServerConfig::default()).await.unwrap();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ServerEvent::ClientConnected { id, protocol } => {
//!             println!("{id} connected ({protocol})");
//!         }
//!         ServerEvent::DataReceived { id } => {
//!             let peer = server.get_peer(id).await.unwrap();
//!             let bytes = peer.take_received().await;
//!             peer.send(&bytes).await.unwrap(); // echo
//!         }
//!         ServerEvent::ClientDisconnected { id } => {
//!             println!("{id} disconnected");
//!         }
//!     }
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod peer;
pub mod server;
mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{DEFAULT_PROTOCOL, ServerConfig};
pub use error::ServerError;
pub use id::ConnectionId;
pub use peer::{PeerConnection, PeerRegistry, SharedPeer};
pub use server::{PeerHandle, ServerEvent, WsServer};
