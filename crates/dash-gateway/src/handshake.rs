//! Client side of the challenge/response handshake.

use std::time::Duration;

use dash_proto::{
    DeviceProof, Frame, HelloFrame, HelloOkFrame, RequestId, SignatureInput, PROTOCOL_VERSION,
};
use serde_json::json;
use tokio::time::Instant;

use crate::config::GatewayConfig;
use crate::diagnostics::{Category, DiagnosticLog};
use crate::error::GatewayError;
use crate::signer::DeviceSigner;
use crate::transport::{Socket, SocketEvent};

/// WebSocket close code for a policy violation; servers use it to reject
/// credentials.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Everything the handshake needs besides the socket.
pub(crate) struct HandshakeContext<'a> {
    pub config: &'a GatewayConfig,
    pub signer: &'a dyn DeviceSigner,
    pub token: Option<&'a str>,
    pub diagnostics: &'a DiagnosticLog,
}

impl HandshakeContext<'_> {
    fn hello(&self) -> HelloFrame {
        let identity = &self.config.identity;
        HelloFrame::new(
            identity.client_info(),
            identity.role.clone(),
            identity.scopes.clone(),
        )
        .with_token(self.token.map(str::to_string))
    }

    fn signed_hello(&self, nonce: Option<&str>) -> HelloFrame {
        let identity = &self.config.identity;
        let device_id = identity
            .device_id
            .clone()
            .unwrap_or_else(|| self.signer.device_id());
        let signed_at_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let nonce = nonce.filter(|n| !n.is_empty());

        let message = SignatureInput {
            device_id: &device_id,
            client_id: &identity.client_id,
            client_mode: &identity.client_mode,
            role: &identity.role,
            scopes: &identity.scopes,
            signed_at_ms,
            token: self.token,
            nonce,
        }
        .canonical_message();

        self.hello().with_device(DeviceProof {
            id: device_id,
            public_key: self.signer.public_key(),
            signature: self.signer.sign(&message),
            signed_at: signed_at_ms,
            nonce: nonce.map(str::to_string),
        })
    }

    fn auth_failed(&self, reason: String) -> GatewayError {
        self.diagnostics.error(
            Category::Auth,
            "handshake rejected",
            Some(json!({"reason": reason})),
        );
        GatewayError::AuthFailed(reason)
    }
}

fn send(socket: &Socket, hello: HelloFrame) -> Result<RequestId, GatewayError> {
    let id = hello.id.clone();
    socket.outbound.send_text(Frame::Hello(hello).to_json()?)?;
    Ok(id)
}

/// Run the handshake on a freshly opened socket.
///
/// Sends an unsigned hello, answers each challenge with a signed hello and
/// returns the server's acceptance. A server that accepts the unsigned
/// hello directly is also fine.
pub(crate) async fn perform(
    socket: &mut Socket,
    ctx: &HandshakeContext<'_>,
    timeout: Duration,
) -> Result<HelloOkFrame, GatewayError> {
    let deadline = Instant::now() + timeout;
    let mut hello_ids = vec![send(socket, ctx.hello())?];
    ctx.diagnostics.debug(Category::Auth, "hello sent", None);

    loop {
        let event = match tokio::time::timeout_at(deadline, socket.inbound.recv()).await {
            Err(_) => {
                ctx.diagnostics
                    .warn(Category::Auth, "handshake timed out", None);
                return Err(GatewayError::Timeout {
                    method: "handshake".to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ok(None) => return Err(GatewayError::closed("socket closed during handshake")),
            Ok(Some(event)) => event,
        };

        let text = match event {
            SocketEvent::Message(text) => text,
            SocketEvent::Closed { code, reason } if code == Some(CLOSE_POLICY_VIOLATION) => {
                return Err(ctx.auth_failed(reason));
            }
            SocketEvent::Closed { code, reason } => {
                return Err(GatewayError::closed(format!(
                    "closed during handshake (code {}): {reason}",
                    code.map_or_else(|| "none".to_string(), |c| c.to_string())
                )));
            }
            SocketEvent::Error(e) => return Err(GatewayError::Transport(e)),
        };

        let frame = match Frame::from_json(&text) {
            Ok(frame) => frame,
            Err(e) => {
                ctx.diagnostics.warn(
                    Category::Protocol,
                    "undecodable frame during handshake",
                    Some(json!({"error": e.to_string()})),
                );
                continue;
            }
        };

        match frame {
            Frame::Challenge(challenge) => {
                let hello = ctx.signed_hello(challenge.nonce.as_deref());
                hello_ids.push(send(socket, hello)?);
                ctx.diagnostics.info(
                    Category::Auth,
                    "challenge answered",
                    Some(json!({"nonce": challenge.nonce.is_some()})),
                );
            }
            Frame::HelloOk(ok) => {
                if ok.protocol != PROTOCOL_VERSION {
                    return Err(GatewayError::Protocol(format!(
                        "server negotiated protocol {}, client speaks {PROTOCOL_VERSION}",
                        ok.protocol
                    )));
                }
                ctx.diagnostics.info(
                    Category::Auth,
                    "handshake accepted",
                    Some(json!({
                        "stateVersion": ok.state_version,
                        "session": ok.session.as_ref().map(|s| &s.id),
                    })),
                );
                return Ok(ok);
            }
            Frame::Response(response) if hello_ids.contains(&response.id) && !response.ok => {
                let reason = response
                    .error
                    .map_or_else(|| "hello rejected".to_string(), |e| format!("{}: {}", e.code, e.message));
                return Err(ctx.auth_failed(reason));
            }
            other => ctx.diagnostics.debug(
                Category::Protocol,
                format!("ignoring {} frame during handshake", other.kind()),
                None,
            ),
        }
    }
}
