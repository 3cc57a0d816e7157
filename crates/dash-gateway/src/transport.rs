//! Socket transport.
//!
//! A [`Transport`] opens a [`Socket`]: an outbound text sender plus an
//! inbound stream of [`SocketEvent`]s. The WebSocket implementation runs a
//! reader task and a writer task over the split stream, the same shape the
//! connection layer expects from the in-memory transport used in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// Boxed future used at trait-object seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text message arrived.
    Message(String),
    /// The peer closed the socket.
    Closed {
        /// Close code, if one was sent.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
    /// The socket failed.
    Error(String),
}

/// Sending half of an open socket.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    /// Wrap a channel whose receiver feeds the socket writer.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionClosed`] if the writer has gone away.
    pub fn send_text(&self, text: String) -> Result<(), GatewayError> {
        self.tx
            .send(text)
            .map_err(|_| GatewayError::closed("socket writer closed"))
    }

    /// Whether the writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open socket.
#[derive(Debug)]
pub struct Socket {
    /// Outbound text frames.
    pub outbound: Outbound,
    /// Inbound socket events. The stream ends after `Closed` or `Error`.
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets to the gateway.
pub trait Transport: Send + Sync {
    /// Open a socket to `url`.
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Socket, GatewayError>>;
}

/// [`Transport`] over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl WebSocketTransport {
    /// Create a transport with the given socket-open timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for WebSocketTransport {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Socket, GatewayError>> {
        Box::pin(async move {
            let (ws, _response) =
                tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                    .await
                    .map_err(|_| GatewayError::Transport(format!("connect to {url} timed out")))?
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;

            debug!(url = %url, "websocket open");
            let (mut write, mut read) = ws.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            // Writer: ends when every Outbound is dropped, then closes the socket.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!(error = %e, "websocket write failed");
                        return;
                    }
                }
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
            });

            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    let event = match msg {
                        Ok(Message::Text(text)) => SocketEvent::Message(text.as_str().to_string()),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => SocketEvent::Message(text),
                            Err(_) => {
                                debug!("dropping non-utf8 binary frame");
                                continue;
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            let (code, reason) = frame.map_or((None, String::new()), |f| {
                                (Some(u16::from(f.code)), f.reason.as_str().to_string())
                            });
                            let _ = in_tx.send(SocketEvent::Closed { code, reason });
                            return;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                            return;
                        }
                    };
                    if in_tx.send(event).is_err() {
                        return;
                    }
                }
                let _ = in_tx.send(SocketEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                });
            });

            Ok(Socket {
                outbound: Outbound::new(out_tx),
                inbound: in_rx,
            })
        })
    }
}

/// In-process transport for tests and embedding.
pub mod memory {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use dash_proto::Frame;
    use tokio::sync::mpsc;

    use super::{BoxFuture, Outbound, Socket, SocketEvent, Transport};
    use crate::error::GatewayError;

    /// Client side: every `connect` hands a fresh [`ServerEnd`] to the
    /// paired [`MemoryListener`].
    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        accept_tx: mpsc::UnboundedSender<ServerEnd>,
        refusals: Arc<AtomicUsize>,
        attempts: Arc<AtomicUsize>,
    }

    /// Server side of a [`MemoryTransport`].
    #[derive(Debug)]
    pub struct MemoryListener {
        accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
    }

    /// One accepted in-memory connection, seen from the server.
    #[derive(Debug)]
    pub struct ServerEnd {
        /// Frames sent by the client.
        pub from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<SocketEvent>,
    }

    /// Create a connected transport/listener pair.
    #[must_use]
    pub fn pair() -> (MemoryTransport, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                accept_tx,
                refusals: Arc::new(AtomicUsize::new(0)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            MemoryListener { accept_rx },
        )
    }

    impl MemoryTransport {
        /// Fail the next `n` connection attempts.
        pub fn refuse_next(&self, n: usize) {
            self.refusals.store(n, Ordering::SeqCst);
        }

        /// Total connection attempts, refused ones included.
        #[must_use]
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Transport for MemoryTransport {
        fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Socket, GatewayError>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let refused = self
                    .refusals
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    return Err(GatewayError::Transport("connection refused".to_string()));
                }

                let (out_tx, from_client) = mpsc::unbounded_channel();
                let (to_client, inbound) = mpsc::unbounded_channel();
                self.accept_tx
                    .send(ServerEnd {
                        from_client,
                        to_client,
                    })
                    .map_err(|_| GatewayError::Transport("listener dropped".to_string()))?;

                Ok(Socket {
                    outbound: Outbound::new(out_tx),
                    inbound,
                })
            })
        }
    }

    impl MemoryListener {
        /// Wait for the next client connection.
        pub async fn accept(&mut self) -> Option<ServerEnd> {
            self.accept_rx.recv().await
        }
    }

    impl ServerEnd {
        /// Send a frame to the client.
        pub fn send_frame(&self, frame: &Frame) -> bool {
            frame
                .to_json()
                .is_ok_and(|text| self.send_text(text))
        }

        /// Send raw text to the client.
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.to_client.send(SocketEvent::Message(text.into())).is_ok()
        }

        /// Close the connection with a code and reason.
        pub fn close(&self, code: u16, reason: &str) {
            let _ = self.to_client.send(SocketEvent::Closed {
                code: Some(code),
                reason: reason.to_string(),
            });
        }

        /// Next frame from the client, skipping undecodable text.
        pub async fn recv_frame(&mut self) -> Option<Frame> {
            while let Some(text) = self.from_client.recv().await {
                if let Ok(frame) = Frame::from_json(&text) {
                    return Some(frame);
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;
    use dash_proto::{EventFrame, Frame};
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (transport, mut listener) = memory::pair();
        let mut socket = transport.connect("mem://gateway").await.unwrap();
        let mut server = listener.accept().await.unwrap();

        socket.outbound.send_text(r#"{"type":"event","event":"x"}"#.into()).unwrap();
        let Some(Frame::Event(event)) = server.recv_frame().await else {
            panic!("expected event");
        };
        assert_eq!(event.event, "x");

        assert!(server.send_frame(&Frame::Event(EventFrame::new("tick", json!({"ts": 1})))));
        let Some(SocketEvent::Message(text)) = socket.inbound.recv().await else {
            panic!("expected message");
        };
        assert!(text.contains("\"tick\""));

        server.close(1000, "bye");
        assert_eq!(
            socket.inbound.recv().await,
            Some(SocketEvent::Closed {
                code: Some(1000),
                reason: "bye".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_memory_refusal() {
        let (transport, _listener) = memory::pair();
        transport.refuse_next(1);
        assert!(matches!(
            transport.connect("mem://").await,
            Err(GatewayError::Transport(_))
        ));
        assert!(transport.connect("mem://").await.is_ok());
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn test_outbound_closed_after_receiver_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(tx);
        drop(rx);
        assert!(outbound.is_closed());
        assert_eq!(
            outbound.send_text("x".into()).unwrap_err().code(),
            "CONNECTION_CLOSED"
        );
    }

    #[tokio::test]
    async fn test_websocket_refused() {
        let transport = WebSocketTransport::new(Duration::from_millis(500));
        let result = transport.connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
    }
}
