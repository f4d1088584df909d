//! Server configuration.

use serde::{Deserialize, Serialize};

/// Sub-protocol registered when the caller supplies none.
pub const DEFAULT_PROTOCOL: &str = "binary";

/// Configuration for a listening WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Sub-protocol names offered during the WebSocket handshake, in
    /// preference order. An empty list is treated as `["binary"]`.
    pub protocol_names: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_names: vec![DEFAULT_PROTOCOL.to_string()],
        }
    }
}

impl ServerConfig {
    /// Config advertising the given sub-protocol names.
    pub fn with_protocols<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocol_names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Protocol list with the empty-list default applied.
    pub(crate) fn normalized_protocols(&self) -> Vec<String> {
        if self.protocol_names.is_empty() {
            vec![DEFAULT_PROTOCOL.to_string()]
        } else {
            self.protocol_names.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
