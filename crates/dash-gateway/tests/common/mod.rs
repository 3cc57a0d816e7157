//! Mock gateway server shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use dash_gateway::{verify_signature, GatewayConfig};
use dash_proto::{
    ChallengeFrame, ErrorShape, Frame, HelloFrame, HelloOkFrame, Policy, RequestFrame,
    ResponseFrame, ServerInfo, SessionInfo, SignatureInput, Snapshot, PROTOCOL_VERSION,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// Generous bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(5);

/// A mock gateway bound to an ephemeral local port.
pub struct MockGateway {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockGateway {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Client config pointed at this gateway with fast retries.
    pub fn config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::new(self.url());
        config.identity.scopes = vec!["chat".to_string(), "pm.read".to_string()];
        config.reconnect.base_delay_ms = 20;
        config.reconnect.max_delay_ms = 100;
        config.handshake_timeout_ms = 2_000;
        config
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        ServerConn {
            ws: accept_async(stream).await.unwrap(),
        }
    }

    /// Accept and complete a challenge handshake with a default hello-ok.
    pub async fn accept_ready(&self, snapshot: Option<Snapshot>) -> (ServerConn, HelloFrame) {
        let mut conn = self.accept().await;
        let hello = conn.challenge("nonce-1").await;
        conn.send(&Frame::HelloOk(hello_ok(1, snapshot, None))).await;
        (conn, hello)
    }
}

pub fn hello_ok(state_version: u64, snapshot: Option<Snapshot>, token: Option<&str>) -> HelloOkFrame {
    HelloOkFrame {
        protocol: PROTOCOL_VERSION,
        server: Some(ServerInfo {
            version: "mock-1.0".to_string(),
            conn_id: Some("conn-1".to_string()),
        }),
        session: Some(SessionInfo {
            id: "session-1".to_string(),
            token: token.map(str::to_string),
        }),
        state_version,
        snapshot,
        policy: Policy::default(),
    }
}

/// One accepted WebSocket connection.
pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send(&mut self, frame: &Frame) {
        self.ws
            .send(Message::Text(frame.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Next decoded frame, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match timeout(WAIT, self.ws.next()).await.ok()?? {
                Ok(Message::Text(text)) => return Frame::from_json(text.as_str()).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn recv_hello(&mut self) -> HelloFrame {
        match self.recv().await {
            Some(Frame::Hello(hello)) => hello,
            other => panic!("expected hello, got {other:?}"),
        }
    }

    pub async fn recv_request(&mut self) -> RequestFrame {
        match self.recv().await {
            Some(Frame::Request(req)) => req,
            other => panic!("expected request, got {other:?}"),
        }
    }

    /// Read the unsigned hello, issue a challenge and verify the signed
    /// answer. Returns the signed hello.
    pub async fn challenge(&mut self, nonce: &str) -> HelloFrame {
        let first = self.recv_hello().await;
        assert!(first.device.is_none());

        self.send(&Frame::Challenge(ChallengeFrame {
            nonce: Some(nonce.to_string()),
            ts: None,
        }))
        .await;

        let signed = self.recv_hello().await;
        let proof = signed.device.clone().expect("signed hello carries a device proof");
        assert_eq!(proof.nonce.as_deref(), Some(nonce));

        let token = signed.auth.as_ref().and_then(|a| a.token.as_deref());
        let message = SignatureInput {
            device_id: &proof.id,
            client_id: &signed.client.id,
            client_mode: &signed.client.mode,
            role: &signed.role,
            scopes: &signed.scopes,
            signed_at_ms: proof.signed_at,
            token,
            nonce: proof.nonce.as_deref(),
        }
        .canonical_message();
        assert!(
            verify_signature(&proof.public_key, &message, &proof.signature),
            "device signature must verify"
        );
        signed
    }

    pub async fn reply_ok(&mut self, req: &RequestFrame, payload: serde_json::Value) {
        self.send(&Frame::Response(ResponseFrame::success(req.id.clone(), payload)))
            .await;
    }

    pub async fn reply_err(&mut self, id: dash_proto::RequestId, code: &str, message: &str) {
        self.send(&Frame::Response(ResponseFrame::failure(
            id,
            ErrorShape::new(code, message),
        )))
        .await;
    }

    pub async fn close(mut self, code: u16, reason: &str) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            }))
            .await;
        // Drain until the client acknowledges.
        while let Ok(Some(Ok(_))) = timeout(Duration::from_millis(200), self.ws.next()).await {}
    }
}
