//! Server error types.

use crate::id::ConnectionId;

/// Errors that can occur in the wsgate server core.
///
/// None of these are fatal: a failed bind can be retried, an unknown id
/// ignored, a transport failure resolves through the connection's eventual
/// close.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `listen()` could not bind the requested TCP port.
    #[error("Bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// The requested connection id is not in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(ConnectionId),

    /// The server has no active listening context.
    #[error("Server not listening")]
    NotListening,

    /// A transport-level send or close failed.
    #[error("Transport error: {0}")]
    Transport(String),
}
