//! WebSocket transport — accept loop, handshake, per-connection read task.
//!
//! The transport owns everything below the frame boundary: TCP accept, the
//! HTTP upgrade (plain HTTP requests fail the handshake and are dropped,
//! this server speaks WebSocket only), sub-protocol negotiation, and the
//! read loop. Everything above it is expressed as [`TransportEvent`] values
//! pushed into the dispatcher's channel.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, error};

use crate::error::ServerError;
use crate::id::ConnectionId;

/// Write half of a server-accepted WebSocket.
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The outbound side of one connection, as seen by the core.
///
/// The dispatcher and peer code only ever push whole binary frames or close;
/// keeping this a trait lets tests substitute a recording sink for the real
/// tungstenite one.
#[async_trait]
pub(crate) trait FrameSink: Send {
    async fn send_binary(&mut self, frame: Vec<u8>) -> Result<(), ServerError>;
    async fn close(&mut self) -> Result<(), ServerError>;
}

/// `FrameSink` over a tungstenite server sink.
struct WsLink {
    sink: WsSink,
}

#[async_trait]
impl FrameSink for WsLink {
    async fn send_binary(&mut self, frame: Vec<u8>) -> Result<(), ServerError> {
        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| ServerError::Transport(format!("Send failed: {e}")))
    }

    async fn close(&mut self) -> Result<(), ServerError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| ServerError::Transport(format!("Close failed: {e}")))
    }
}

/// An event from the transport layer, consumed by the dispatcher.
pub(crate) enum TransportEvent {
    /// A WebSocket handshake completed. The dispatcher assigns the
    /// connection id and replies with it over `id_tx` so the read task can
    /// tag subsequent events.
    Established {
        protocol: String,
        link: Box<dyn FrameSink + Send>,
        id_tx: oneshot::Sender<ConnectionId>,
    },
    /// A data frame arrived from the peer.
    Received { id: ConnectionId, bytes: Vec<u8> },
    /// The connection's outbound direction can accept more bytes.
    Writable { id: ConnectionId },
    /// The connection is gone. Emitted exactly once per established
    /// connection, always last.
    Closed { id: ConnectionId },
}

/// Accept loop: one task per listening context.
///
/// Connection tasks live in a [`JoinSet`] owned by this loop, so destroying
/// the context destroys every socket with it — a peer that never answers
/// our close frame cannot keep its read task alive past `stop()`.
pub(crate) async fn run_acceptor(
    listener: TcpListener,
    protocols: Vec<String>,
    event_tx: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let protocols = protocols.clone();
                        let event_tx = event_tx.clone();
                        connections.spawn(serve_connection(
                            stream, peer_addr, protocols, event_tx,
                        ));
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            // Reap finished connection tasks as they complete.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.recv() => {
                debug!("Acceptor shutting down");
                break;
            }
        }
    }
    connections.shutdown().await;
}

/// Upgrade one TCP stream and pump its frames into the event channel.
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    protocols: Vec<String>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let mut negotiated: Option<String> = None;
    let callback = |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        match negotiate_protocol(offered, &protocols) {
            Negotiation::Echo(name) => {
                if let Ok(value) = HeaderValue::from_str(&name) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                negotiated = Some(name);
                Ok(response)
            }
            Negotiation::Default(name) => {
                negotiated = Some(name);
                Ok(response)
            }
            Negotiation::Reject => {
                let mut refusal =
                    ErrorResponse::new(Some("unsupported websocket sub-protocol".to_string()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            // Covers plain HTTP requests and protocol rejections alike: the
            // connection never reaches Established.
            debug!("Handshake with {peer_addr} failed: {e}");
            return;
        }
    };

    let protocol = match negotiated {
        Some(name) => name,
        None => return, // callback not invoked; nothing was established
    };

    let (sink, mut reader) = ws_stream.split();
    let (id_tx, id_rx) = oneshot::channel();
    let established = TransportEvent::Established {
        protocol,
        link: Box::new(WsLink { sink }),
        id_tx,
    };
    if event_tx.send(established).await.is_err() {
        return; // dispatcher already gone
    }
    let Ok(id) = id_rx.await else {
        return;
    };
    debug!("Connection {id} established from {peer_addr}");

    // The socket can take frames as soon as the upgrade completes.
    let _ = event_tx.send(TransportEvent::Writable { id }).await;

    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(bytes)) => {
                let _ = event_tx
                    .send(TransportEvent::Received {
                        id,
                        bytes: bytes.to_vec(),
                    })
                    .await;
            }
            Ok(Message::Text(text)) => {
                let _ = event_tx
                    .send(TransportEvent::Received {
                        id,
                        bytes: text.as_bytes().to_vec(),
                    })
                    .await;
            }
            Ok(Message::Close(_)) => {
                debug!("Peer {id} sent close");
                break;
            }
            Ok(_) => {} // ping/pong answered by tungstenite
            Err(e) => {
                debug!("Read error on {id}: {e}");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Closed { id }).await;
}

/// Outcome of sub-protocol negotiation for one handshake.
enum Negotiation {
    /// Client offered a supported name; echo it in the response.
    Echo(String),
    /// Client offered nothing; record the server's first protocol.
    Default(String),
    /// Client offered only unknown names; refuse the upgrade.
    Reject,
}

/// Pick the sub-protocol for a handshake against the configured list.
fn negotiate_protocol(offered: Option<&str>, supported: &[String]) -> Negotiation {
    match offered {
        None => match supported.first() {
            Some(name) => Negotiation::Default(name.clone()),
            None => Negotiation::Reject,
        },
        Some(list) => {
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if supported.iter().any(|s| s == name) {
                    return Negotiation::Echo(name.to_string());
                }
            }
            Negotiation::Reject
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Observer side of a [`MockSink`]: records frames and the close call.
    #[derive(Clone, Default)]
    pub(crate) struct SinkProbe {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicBool>,
    }

    impl SinkProbe {
        pub(crate) fn new_sink(&self) -> Box<dyn FrameSink + Send> {
            Box::new(MockSink {
                probe: self.clone(),
            })
        }

        pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct MockSink {
        probe: SinkProbe,
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send_binary(&mut self, frame: Vec<u8>) -> Result<(), ServerError> {
            self.probe.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ServerError> {
            self.probe.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn supported(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_no_offer_takes_first_configured_protocol() {
        match negotiate_protocol(None, &supported(&["binary", "chat"])) {
            Negotiation::Default(name) => assert_eq!(name, "binary"),
            _ => panic!("expected default negotiation"),
        }
    }

    #[test]
    fn test_offered_match_is_echoed() {
        match negotiate_protocol(Some("chat"), &supported(&["binary", "chat"])) {
            Negotiation::Echo(name) => assert_eq!(name, "chat"),
            _ => panic!("expected echo negotiation"),
        }
    }

    #[test]
    fn test_first_supported_offer_wins() {
        match negotiate_protocol(Some("mqtt, chat, binary"), &supported(&["binary", "chat"])) {
            Negotiation::Echo(name) => assert_eq!(name, "chat"),
            _ => panic!("expected echo negotiation"),
        }
    }

    #[test]
    fn test_unknown_offer_is_rejected() {
        assert!(matches!(
            negotiate_protocol(Some("mqtt"), &supported(&["binary"])),
            Negotiation::Reject
        ));
    }

    #[test]
    fn test_offer_list_tolerates_whitespace_and_empties() {
        match negotiate_protocol(Some(" , chat ,"), &supported(&["chat"])) {
            Negotiation::Echo(name) => assert_eq!(name, "chat"),
            _ => panic!("expected echo negotiation"),
        }
    }

    #[tokio::test]
    async fn test_listener_binds_ephemeral_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
