//! Transport seam: a factory produces framed connections, so the
//! engine never touches the socket type directly.
//!
//! The production factory speaks WebSocket via `tokio-tungstenite`,
//! bridging the split socket halves to an mpsc pair with two pump
//! tasks. Tests inject [`memory::MemoryFactory`] instead and script
//! the server end, which is what makes the reconnect and
//! reconciliation paths deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::RoomId;

/// Buffered frames per direction before backpressure.
pub const FRAME_BUFFER: usize = 256;

/// Ping cadence on an idle socket, so a half-open TCP session is
/// noticed instead of waiting for the OS to give up.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A live framed connection. The engine writes outbound frame text to
/// `outgoing` and drains inbound frame text from `incoming`; the
/// transport signals close by ending the `incoming` stream.
pub struct Connection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Handshake failed before the session was established.
    Handshake(String),
    /// The peer closed the connection.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake(e) => write!(f, "Handshake failed: {e}"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Produces connections scoped to a room. Constructor-injected into
/// the client so independent sessions (and tests) never share global
/// state.
pub trait TransportFactory: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
        room: &RoomId,
        token: Option<&str>,
    ) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

/// WebSocket transport over `tokio-tungstenite`.
///
/// The session URL is `{endpoint}/{room}`; the bearer credential is
/// carried as an `access_token` query parameter on the handshake URL.
#[derive(Debug, Default)]
pub struct WsFactory;

impl WsFactory {
    pub fn new() -> Self {
        Self
    }

    fn session_url(endpoint: &str, room: &RoomId, token: Option<&str>) -> String {
        let base = format!("{}/{}", endpoint.trim_end_matches('/'), room);
        match token {
            Some(token) => format!("{base}?access_token={token}"),
            None => base,
        }
    }
}

impl TransportFactory for WsFactory {
    fn connect(
        &self,
        endpoint: &str,
        room: &RoomId,
        token: Option<&str>,
    ) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let url = Self::session_url(endpoint, room, token);
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);

            // Writer pump: outgoing channel -> socket, with keepalive
            // pings between frames. A failed ping tears the pump down,
            // which surfaces as a closed connection.
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
                let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        msg = out_rx.recv() => match msg {
                            Some(text) => {
                                if ws_writer
                                    .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = heartbeat.tick() => {
                            let ping = tokio_tungstenite::tungstenite::Message::Ping(
                                tokio_tungstenite::tungstenite::Bytes::new(),
                            );
                            if ws_writer.send(ping).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            // Reader pump: socket -> incoming channel. Dropping `in_tx`
            // ends the incoming stream, which the engine reads as a
            // transport-level close.
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                            if in_tx.send(text.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                            break;
                        }
                        _ => {}
                    }
                }
            });

            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// In-memory transport for deterministic tests.
pub mod memory {
    use super::*;

    /// The server side of an in-memory connection, handed to the test
    /// whenever the factory accepts a connect call.
    pub struct ServerEnd {
        pub room: RoomId,
        /// Frames the client sent.
        pub incoming: mpsc::Receiver<String>,
        /// Frames to deliver to the client.
        pub outgoing: mpsc::Sender<String>,
    }

    impl ServerEnd {
        /// Receive and decode the next frame from the client.
        pub async fn recv_frame(&mut self) -> Option<crate::protocol::Frame> {
            let text = self.incoming.recv().await?;
            crate::protocol::Frame::decode(&text).ok()
        }

        /// Deliver a broadcast message to the client.
        pub async fn send_message(&self, channel: &str, body: serde_json::Value) {
            let frame = crate::protocol::Frame::Message {
                channel: channel.to_string(),
                body,
            };
            if let Ok(text) = frame.encode() {
                let _ = self.outgoing.send(text).await;
            }
        }

        /// Deliver raw frame text (for malformed-input tests).
        pub async fn send_raw(&self, text: impl Into<String>) {
            let _ = self.outgoing.send(text.into()).await;
        }

        /// Close the connection from the server side.
        pub fn close(self) {
            drop(self.outgoing);
        }
    }

    /// Factory producing linked client/server pairs. Each accepted
    /// connect yields a [`ServerEnd`] on the accept channel; queued
    /// failures reject the handshake instead.
    pub struct MemoryFactory {
        accepts: mpsc::UnboundedSender<ServerEnd>,
        fail_remaining: AtomicUsize,
    }

    impl MemoryFactory {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    accepts: tx,
                    fail_remaining: AtomicUsize::new(0),
                }),
                rx,
            )
        }

        /// Make the next `n` connect calls fail at handshake.
        pub fn fail_next(&self, n: usize) {
            self.fail_remaining.store(n, Ordering::SeqCst);
        }
    }

    impl TransportFactory for MemoryFactory {
        fn connect(
            &self,
            _endpoint: &str,
            room: &RoomId,
            _token: Option<&str>,
        ) -> BoxFuture<'static, Result<Connection, TransportError>> {
            let room = room.clone();
            let accepts = self.accepts.clone();
            let fail = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Box::pin(async move {
                if fail {
                    return Err(TransportError::Handshake("scripted failure".to_string()));
                }
                let (client_tx, server_rx) = mpsc::channel(FRAME_BUFFER);
                let (server_tx, client_rx) = mpsc::channel(FRAME_BUFFER);
                let end = ServerEnd {
                    room,
                    incoming: server_rx,
                    outgoing: server_tx,
                };
                accepts
                    .send(end)
                    .map_err(|_| TransportError::Handshake("no acceptor".to_string()))?;
                Ok(Connection {
                    outgoing: client_tx,
                    incoming: client_rx,
                })
            })
        }
    }
}
