//! Top-level gateway connection.
//!
//! [`GatewayConnection`] is a cheaply cloneable handle. `connect` spawns a
//! supervisor task that owns the socket: it opens it, drives the handshake,
//! routes inbound frames and hands control to the [`Reconnector`] when the
//! connection drops. Callers interact only through the handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dash_proto::{
    is_snapshot_namespace, EventFrame, Frame, HelloOkFrame, KnownEvent, Policy, Snapshot,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{EventBus, Once, Scope};
use crate::config::{GatewayConfig, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::correlator::{Correlator, CorrelatorMetrics};
use crate::diagnostics::{Category, DiagnosticLog};
use crate::error::GatewayError;
use crate::handshake::{self, HandshakeContext};
use crate::liveness::LivenessMonitor;
use crate::reconnect::{ReconnectMetrics, ReconnectSignal, Reconnector};
use crate::signer::DeviceSigner;
use crate::snapshot::SnapshotStore;
use crate::state::{ConnectionState, StateChange, StateMachine};
use crate::subscription::Subscription;
use crate::transport::{Outbound, Socket, SocketEvent, Transport, WebSocketTransport};

/// Method used to fetch a snapshot when hello-ok does not embed one.
pub const SNAPSHOT_METHOD: &str = "snapshot.get";

/// What the server told us about the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    /// Negotiated protocol version.
    pub protocol: u32,
    /// Session id, if the server assigned one.
    pub session_id: Option<String>,
    /// Server version.
    pub server_version: Option<String>,
    /// Server-side connection id.
    pub conn_id: Option<String>,
    /// Connection policy.
    pub policy: Policy,
}

impl SessionDetails {
    fn from_hello_ok(ok: &HelloOkFrame) -> Self {
        Self {
            protocol: ok.protocol,
            session_id: ok.session.as_ref().map(|s| s.id.clone()),
            server_version: ok.server.as_ref().map(|s| s.version.clone()),
            conn_id: ok.server.as_ref().and_then(|s| s.conn_id.clone()),
            policy: ok.policy,
        }
    }
}

struct ActiveSession {
    outbound: Outbound,
    max_payload: Option<usize>,
    details: SessionDetails,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn DeviceSigner>,
    diagnostics: Arc<DiagnosticLog>,
    state: StateMachine,
    correlator: Correlator,
    bus: EventBus,
    snapshots: SnapshotStore,
    session: Mutex<Option<ActiveSession>>,
    config: Mutex<Option<GatewayConfig>>,
    supervisor: Mutex<Option<Supervisor>>,
    reconnect_metrics: Mutex<ReconnectMetrics>,
    last_error: Mutex<Option<GatewayError>>,
    state_version: AtomicU64,
}

/// Handle to the single gateway connection of a process.
#[derive(Clone)]
pub struct GatewayConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("state", &self.state())
            .field("state_version", &self.state_version())
            .finish_non_exhaustive()
    }
}

impl GatewayConnection {
    /// Create a connection with its own diagnostic log.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, signer: Arc<dyn DeviceSigner>) -> Self {
        Self::with_diagnostics(transport, signer, Arc::new(DiagnosticLog::default()))
    }

    /// Create a connection over the default WebSocket transport.
    #[must_use]
    pub fn websocket(signer: Arc<dyn DeviceSigner>) -> Self {
        Self::new(Arc::new(WebSocketTransport::default()), signer)
    }

    /// Create a connection recording into a shared diagnostic log.
    #[must_use]
    pub fn with_diagnostics(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn DeviceSigner>,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                signer,
                state: StateMachine::new(Arc::clone(&diagnostics)),
                correlator: Correlator::new(Arc::clone(&diagnostics)),
                bus: EventBus::new(Arc::clone(&diagnostics)),
                snapshots: SnapshotStore::new(Arc::clone(&diagnostics)),
                diagnostics,
                session: Mutex::new(None),
                config: Mutex::new(None),
                supervisor: Mutex::new(None),
                reconnect_metrics: Mutex::new(ReconnectMetrics::default()),
                last_error: Mutex::new(None),
                state_version: AtomicU64::new(0),
            }),
        }
    }

    /// Start connecting. Must be called inside a Tokio runtime.
    ///
    /// Returns once the state is `Connecting`; progress is observable via
    /// [`on_state_change`](Self::on_state_change) or
    /// [`wait_ready`](Self::wait_ready). A no-op while a previous `connect`
    /// is still connecting, connected or reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `config` fails validation.
    pub fn connect(&self, config: GatewayConfig) -> Result<(), GatewayError> {
        config.validate()?;

        let (go_tx, go_rx) = oneshot::channel();
        let cancel = {
            let mut supervisor = self.inner.supervisor.lock();
            if supervisor.is_some() && self.state().is_active() {
                self.inner.diagnostics.debug(
                    Category::Connection,
                    "connect ignored, already active",
                    Some(json!({"state": self.state()})),
                );
                return Ok(());
            }
            if let Some(old) = supervisor.take() {
                old.cancel.cancel();
            }

            *self.inner.config.lock() = Some(config.clone());
            *self.inner.last_error.lock() = None;

            let cancel = CancellationToken::new();
            let task = tokio::spawn(supervise(
                Arc::clone(&self.inner),
                config,
                cancel.clone(),
                go_rx,
            ));
            *supervisor = Some(Supervisor {
                cancel: cancel.clone(),
                task,
            });
            cancel
        };

        self.inner.state.transition_if(
            ConnectionState::Connecting,
            Some("connect requested"),
            || !cancel.is_cancelled(),
        );
        let _ = go_tx.send(());
        Ok(())
    }

    /// Tear everything down.
    ///
    /// Cancels any scheduled reconnection, closes the socket, fails every
    /// pending call with `CONNECTION_CLOSED`, drops connection-scoped
    /// subscriptions and moves to `Disconnected`.
    pub fn close(&self) {
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.cancel.cancel();
            supervisor.task.abort();
        }
        self.inner.session.lock().take();
        self.inner
            .correlator
            .clear(&GatewayError::closed("closed by client"));
        self.inner.bus.clear_scope(Scope::Connection);
        self.inner
            .state
            .transition(ConnectionState::Disconnected, Some("closed by client"));
    }

    /// Call `method` with the configured default timeout.
    ///
    /// # Errors
    ///
    /// `NOT_READY` outside `Ready`; otherwise whatever settled the call:
    /// the server's error, a timeout or the connection closing.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        let timeout = self.inner.config.lock().as_ref().map_or(
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            GatewayConfig::request_timeout,
        );
        self.call_with_timeout(method, params, timeout).await
    }

    /// Call `method` with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(GatewayError::NotReady { state });
        }

        let (outbound, max_payload) = {
            let session = self.inner.session.lock();
            match session.as_ref() {
                Some(s) => (s.outbound.clone(), s.max_payload),
                None => {
                    return Err(GatewayError::NotReady {
                        state: self.state(),
                    });
                }
            }
        };

        self.inner
            .correlator
            .send(method, params, timeout, &outbound, max_payload)?
            .await
    }

    /// Register a persistent event handler.
    pub fn on(
        &self,
        pattern: impl Into<String>,
        handler: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.on(pattern, handler)
    }

    /// Register an event handler with an explicit scope.
    pub fn on_scoped(
        &self,
        pattern: impl Into<String>,
        scope: Scope,
        handler: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.on_scoped(pattern, scope, handler)
    }

    /// Payload of the next matching event. Fails with `CONNECTION_CLOSED` if
    /// the connection is closed first.
    pub fn once(&self, pattern: impl Into<String>) -> Once {
        self.inner.bus.once(pattern)
    }

    /// Register a state-change listener.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state.on_change(handler)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Receiver that tracks the current state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until `Ready`.
    ///
    /// # Errors
    ///
    /// Fails with the terminal error if the connection gives up, or with
    /// `TIMEOUT` after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), GatewayError> {
        let mut rx = self.inner.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Disconnected => {
                        return Err(self
                            .last_error()
                            .unwrap_or(GatewayError::NotReady { state }));
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(GatewayError::closed("connection dropped"));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| GatewayError::Timeout {
                method: "wait_ready".to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Current snapshot generation.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.snapshots.get()
    }

    /// Receiver that changes once per snapshot replacement.
    #[must_use]
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.inner.snapshots.subscribe()
    }

    /// Whether the held snapshot predates the connection's state version.
    #[must_use]
    pub fn snapshot_is_stale(&self) -> bool {
        self.inner.snapshots.is_stale(self.state_version())
    }

    /// Highest server state version seen on the current session.
    #[must_use]
    pub fn state_version(&self) -> u64 {
        self.inner.state_version.load(Ordering::Acquire)
    }

    /// Details of the current session, while one is established.
    #[must_use]
    pub fn session(&self) -> Option<SessionDetails> {
        self.inner.session.lock().as_ref().map(|s| s.details.clone())
    }

    /// Error that ended the last supervisor run, if it gave up.
    #[must_use]
    pub fn last_error(&self) -> Option<GatewayError> {
        self.inner.last_error.lock().clone()
    }

    /// Shared diagnostic log.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<DiagnosticLog> {
        &self.inner.diagnostics
    }

    /// Diagnostic log as a JSON array.
    #[must_use]
    pub fn export_diagnostics(&self) -> String {
        self.inner.diagnostics.export_json()
    }

    /// Correlator counters.
    #[must_use]
    pub fn correlator_metrics(&self) -> CorrelatorMetrics {
        self.inner.correlator.metrics()
    }

    /// Reconnector counters.
    #[must_use]
    pub fn reconnect_metrics(&self) -> ReconnectMetrics {
        *self.inner.reconnect_metrics.lock()
    }
}

impl Inner {
    /// Transition unless the supervisor was cancelled. Returns whether the
    /// supervisor should keep going.
    fn advance(&self, to: ConnectionState, reason: &str, cancel: &CancellationToken) -> bool {
        self.state
            .transition_if(to, Some(reason), || !cancel.is_cancelled());
        !cancel.is_cancelled()
    }

    fn teardown(&self, reason: &GatewayError) {
        self.session.lock().take();
        let err = match reason {
            GatewayError::ConnectionClosed { .. } => reason.clone(),
            other => GatewayError::closed(other.to_string()),
        };
        self.correlator.clear(&err);
    }

    fn route(&self, text: &str, last_seq: &mut Option<u64>) {
        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.diagnostics.warn(
                    Category::Protocol,
                    "dropping undecodable frame",
                    Some(json!({"error": e.to_string(), "bytes": text.len()})),
                );
                return;
            }
        };

        match frame {
            Frame::Response(response) => {
                self.correlator.resolve(response);
            }
            Frame::Event(ref event) => {
                self.observe_event(event, last_seq);
                self.bus.handle_frame(&frame);
            }
            Frame::Snapshot(snapshot) => {
                self.state_version
                    .fetch_max(snapshot.state_version, Ordering::AcqRel);
                self.snapshots.replace(snapshot);
            }
            other => self.diagnostics.debug(
                Category::Protocol,
                format!("ignoring {} frame outside handshake", other.kind()),
                None,
            ),
        }
    }

    fn observe_event(&self, event: &EventFrame, last_seq: &mut Option<u64>) {
        if let Some(seq) = event.seq {
            if let Some(prev) = *last_seq {
                if seq != prev.wrapping_add(1) {
                    self.diagnostics.warn(
                        Category::Event,
                        "event sequence gap",
                        Some(json!({"expected": prev.wrapping_add(1), "received": seq, "event": event.event})),
                    );
                }
            }
            *last_seq = Some(seq);
        }
        if let Some(version) = event.state_version {
            self.state_version.fetch_max(version, Ordering::AcqRel);
        }
        if is_snapshot_namespace(&event.event) {
            self.snapshots.apply_event(event);
            return;
        }
        match KnownEvent::parse(event) {
            Ok(KnownEvent::Shutdown(shutdown)) => self.diagnostics.info(
                Category::Connection,
                "server announced shutdown",
                Some(json!({
                    "reason": shutdown.reason,
                    "restartExpectedMs": shutdown.restart_expected_ms,
                })),
            ),
            Ok(_) => {}
            Err(e) => self.diagnostics.warn(
                Category::Protocol,
                "malformed event payload",
                Some(json!({"event": event.event, "error": e.to_string()})),
            ),
        }
    }

    fn handshake_context<'a>(
        &'a self,
        config: &'a GatewayConfig,
        token: Option<&'a str>,
    ) -> HandshakeContext<'a> {
        HandshakeContext {
            config,
            signer: self.signer.as_ref(),
            token,
            diagnostics: &self.diagnostics,
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    config: GatewayConfig,
    cancel: CancellationToken,
    go: oneshot::Receiver<()>,
) {
    if go.await.is_err() {
        return;
    }

    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
    let mut reconnector = Reconnector::new(config.reconnect.clone(), Arc::clone(&inner.diagnostics));
    let mut token = config.token.clone();

    loop {
        if !inner.advance(ConnectionState::Connecting, "connecting", &cancel) {
            return;
        }

        let reason = tokio::select! {
            () = cancel.cancelled() => return,
            reason = run_session(&inner, &config, &mut token, &mut reconnector, &cancel) => reason,
        };

        inner.teardown(&reason);
        inner.diagnostics.warn(
            Category::Connection,
            "connection lost",
            Some(json!({"code": reason.code(), "reason": reason.to_string()})),
        );

        if matches!(reason, GatewayError::AuthFailed(_)) {
            *inner.last_error.lock() = Some(reason.clone());
            inner.advance(ConnectionState::Disconnected, "authentication failed", &cancel);
            return;
        }

        let scheduled = reconnector.schedule_retry(retry_tx.clone());
        *inner.reconnect_metrics.lock() = reconnector.metrics();
        if scheduled.is_none() {
            let why = if config.reconnect.enabled {
                "reconnect attempts exhausted"
            } else {
                "reconnect disabled"
            };
            *inner.last_error.lock() = Some(reason);
            inner.advance(ConnectionState::Disconnected, why, &cancel);
            return;
        }

        if !inner.advance(ConnectionState::Reconnecting, &reason.to_string(), &cancel) {
            return;
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            signal = retry_rx.recv() => match signal {
                Some(ReconnectSignal::RetryNow { attempt }) => {
                    debug!(attempt, "reconnect timer fired");
                }
                None => return,
            },
        }
    }
}

/// One socket lifetime: open, handshake, route until it ends. Returns why
/// it ended.
async fn run_session(
    inner: &Arc<Inner>,
    config: &GatewayConfig,
    token: &mut Option<String>,
    reconnector: &mut Reconnector,
    cancel: &CancellationToken,
) -> GatewayError {
    let mut socket = match inner.transport.connect(&config.url).await {
        Ok(socket) => socket,
        Err(e) => return e,
    };

    if !inner.advance(ConnectionState::Authenticating, "socket open", cancel) {
        return GatewayError::closed("cancelled");
    }

    let ctx = inner.handshake_context(config, token.as_deref());
    let hello_ok = match handshake::perform(&mut socket, &ctx, config.handshake_timeout()).await {
        Ok(ok) => ok,
        Err(e) => return e,
    };

    if let Some(next) = hello_ok.session.as_ref().and_then(|s| s.token.clone()) {
        inner
            .diagnostics
            .debug(Category::Auth, "session token rotated", None);
        *token = Some(next);
    }

    inner
        .state_version
        .store(hello_ok.state_version, Ordering::Release);
    let needs_snapshot = match hello_ok.snapshot.clone() {
        Some(mut snapshot) => {
            snapshot.state_version = snapshot.state_version.max(hello_ok.state_version);
            inner.snapshots.replace(snapshot);
            false
        }
        None => true,
    };

    {
        let mut session = inner.session.lock();
        if cancel.is_cancelled() {
            return GatewayError::closed("cancelled");
        }
        *session = Some(ActiveSession {
            outbound: socket.outbound.clone(),
            max_payload: hello_ok.policy.max_payload,
            details: SessionDetails::from_hello_ok(&hello_ok),
        });
    }

    reconnector.reset();
    *inner.reconnect_metrics.lock() = reconnector.metrics();

    if !inner.advance(ConnectionState::Ready, "handshake complete", cancel) {
        return GatewayError::closed("cancelled");
    }

    if needs_snapshot {
        fetch_snapshot(GatewayConnection {
            inner: Arc::clone(inner),
        });
    }

    let tick = hello_ok
        .policy
        .tick_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    route_frames(inner, &mut socket, tick).await
}

fn fetch_snapshot(conn: GatewayConnection) {
    tokio::spawn(async move {
        let result = conn.call(SNAPSHOT_METHOD, None).await.and_then(|payload| {
            serde_json::from_value::<Snapshot>(payload)
                .map_err(|e| GatewayError::Protocol(format!("invalid snapshot: {e}")))
        });
        match result {
            Ok(snapshot) => {
                conn.inner
                    .state_version
                    .fetch_max(snapshot.state_version, Ordering::AcqRel);
                conn.inner.snapshots.replace(snapshot);
            }
            Err(e) => conn.inner.diagnostics.warn(
                Category::Snapshot,
                "snapshot fetch failed",
                Some(json!({"code": e.code(), "error": e.to_string()})),
            ),
        }
    });
}

async fn route_frames(inner: &Inner, socket: &mut Socket, tick: Option<Duration>) -> GatewayError {
    let mut liveness = tick.map(LivenessMonitor::new);
    let mut last_seq = None;

    loop {
        let event = match &liveness {
            Some(monitor) => {
                match tokio::time::timeout_at(monitor.deadline(), socket.inbound.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        let missed = monitor.missed_ticks(tokio::time::Instant::now());
                        inner.diagnostics.warn(
                            Category::Connection,
                            "server went silent",
                            Some(json!({"missedTicks": missed})),
                        );
                        return GatewayError::closed(format!("no traffic for {missed} tick intervals"));
                    }
                }
            }
            None => socket.inbound.recv().await,
        };

        match event {
            Some(SocketEvent::Message(text)) => {
                if let Some(monitor) = liveness.as_mut() {
                    monitor.observe();
                }
                inner.route(&text, &mut last_seq);
            }
            Some(SocketEvent::Closed { code, reason }) => {
                return GatewayError::closed(match code {
                    Some(code) => format!("socket closed ({code}): {reason}"),
                    None => format!("socket closed: {reason}"),
                });
            }
            Some(SocketEvent::Error(e)) => return GatewayError::Transport(e),
            None => return GatewayError::closed("socket closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Ed25519Signer;
    use crate::transport::memory::{self, MemoryListener, MemoryTransport, ServerEnd};
    use dash_proto::{ChallengeFrame, ErrorShape, ResponseFrame};
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    fn setup() -> (GatewayConnection, MemoryTransport, MemoryListener) {
        let (transport, listener) = memory::pair();
        let conn = GatewayConnection::new(
            Arc::new(transport.clone()),
            Arc::new(Ed25519Signer::generate()),
        );
        (conn, transport, listener)
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::new("ws://gateway.test/ws");
        config.reconnect.base_delay_ms = 10;
        config.reconnect.max_delay_ms = 40;
        config.reconnect.jitter = 0.0;
        config
    }

    fn hello_ok(extra: Value) -> Frame {
        let mut value = json!({"type": "hello-ok", "protocol": 1, "stateVersion": 1});
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        Frame::from_json(&value.to_string()).unwrap()
    }

    /// Accept one connection and complete the handshake with a challenge.
    async fn accept(listener: &mut MemoryListener, extra: Value) -> ServerEnd {
        let mut server = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let Some(Frame::Hello(_)) = server.recv_frame().await else {
            panic!("expected hello");
        };
        server.send_frame(&Frame::Challenge(ChallengeFrame {
            nonce: Some("n".to_string()),
            ts: None,
        }));
        let Some(Frame::Hello(signed)) = server.recv_frame().await else {
            panic!("expected signed hello");
        };
        assert!(signed.device.is_some());
        server.send_frame(&hello_ok(extra));
        server
    }

    async fn next_request(server: &mut ServerEnd) -> dash_proto::RequestFrame {
        loop {
            match tokio::time::timeout(WAIT, server.recv_frame()).await.unwrap() {
                Some(Frame::Request(req)) => return req,
                Some(_) => {}
                None => panic!("client went away"),
            }
        }
    }

    #[tokio::test]
    async fn test_call_before_connect_is_not_ready() {
        let (conn, _t, _l) = setup();
        let err = conn.call("stats.get", None).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotReady {
                state: ConnectionState::Disconnected
            }
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_config() {
        let (conn, _t, _l) = setup();
        let err = conn.connect(GatewayConfig::new("http://nope")).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reverse_order_responses() {
        let (conn, _t, mut listener) = setup();
        conn.connect(config()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let mut server = accept(&mut listener, json!({"snapshot": {"stateVersion": 1}})).await;
        conn.wait_ready(WAIT).await.unwrap();

        let a = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call("stats.get", Some(json!({}))).await }
        });
        let first = next_request(&mut server).await;
        let b = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call("list.get", Some(json!({}))).await }
        });
        let second = next_request(&mut server).await;

        server.send_frame(&Frame::Response(ResponseFrame::success(second.id, json!("list"))));
        server.send_frame(&Frame::Response(ResponseFrame::success(first.id, json!("stats"))));

        assert_eq!(a.await.unwrap().unwrap(), json!("stats"));
        assert_eq!(b.await.unwrap().unwrap(), json!("list"));
        conn.close();
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_scoped_handlers() {
        let (conn, _t, mut listener) = setup();
        conn.connect(config()).unwrap();
        let mut server = accept(&mut listener, json!({"snapshot": {}})).await;
        conn.wait_ready(WAIT).await.unwrap();

        let _persistent = conn.on("chat.*", |_| {});
        let _scoped = conn.on_scoped("pm.*", Scope::Connection, |_| {});
        let next_tick = conn.once("tick");

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.call(&format!("m{i}"), None).await })
            })
            .collect();
        for _ in 0..3 {
            next_request(&mut server).await;
        }

        conn.close();
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap_err().code(), "CONNECTION_CLOSED");
        }
        assert_eq!(next_tick.await.unwrap_err().code(), "CONNECTION_CLOSED");
        assert_eq!(conn.correlator_metrics().in_flight, 0);
        assert_eq!(conn.inner.bus.handler_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_auth_failure_is_terminal() {
        let (conn, transport, mut listener) = setup();
        conn.connect(config()).unwrap();

        let mut server = listener.accept().await.unwrap();
        let Some(Frame::Hello(hello)) = server.recv_frame().await else {
            panic!("expected hello");
        };
        server.send_frame(&Frame::Response(ResponseFrame::failure(
            hello.id,
            ErrorShape::new("UNAUTHORIZED", "unknown device"),
        )));

        let err = conn.wait_ready(WAIT).await.unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.attempts(), 1);
        assert!(!conn.diagnostics().entries_for(Category::Auth).is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_and_resets_backoff() {
        let (conn, transport, mut listener) = setup();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let _sub = conn.on_state_change(move |change| sink.lock().push(change.to));

        transport.refuse_next(1);
        conn.connect(config()).unwrap();

        let server = accept(&mut listener, json!({"snapshot": {}})).await;
        conn.wait_ready(WAIT).await.unwrap();
        assert_eq!(conn.reconnect_metrics().total_reconnections, 1);
        assert_eq!(conn.reconnect_metrics().attempts, 0);

        server.close(1006, "network blip");
        drop(server);
        let _server = accept(&mut listener, json!({"snapshot": {}})).await;

        let mut rx = conn.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == ConnectionState::Ready))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.reconnect_metrics().total_reconnections, 2);
        assert_eq!(conn.reconnect_metrics().last_delay_ms, Some(10));

        let seen = states.lock().clone();
        assert_eq!(
            &seen[..4],
            &[
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
                ConnectionState::Authenticating,
            ]
        );
        assert!(seen.contains(&ConnectionState::Ready));
        conn.close();
    }

    #[tokio::test]
    async fn test_disabled_reconnect_goes_disconnected() {
        let (conn, _t, mut listener) = setup();
        let mut config = config();
        config.reconnect.enabled = false;
        conn.connect(config).unwrap();

        let server = accept(&mut listener, json!({"snapshot": {}})).await;
        conn.wait_ready(WAIT).await.unwrap();
        server.close(1001, "going away");

        let mut rx = conn.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.last_error().unwrap().code(), "CONNECTION_CLOSED");
    }

    #[tokio::test]
    async fn test_second_connect_is_noop() {
        let (conn, transport, mut listener) = setup();
        conn.connect(config()).unwrap();
        conn.connect(config()).unwrap();
        let _server = accept(&mut listener, json!({"snapshot": {}})).await;
        conn.wait_ready(WAIT).await.unwrap();
        conn.connect(config()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.attempts(), 1);
        conn.close();
    }

    #[tokio::test]
    async fn test_events_routed_and_snapshot_replaced() {
        let (conn, _t, mut listener) = setup();
        conn.connect(config()).unwrap();
        let server = accept(&mut listener, json!({"snapshot": {"stateVersion": 1}})).await;
        conn.wait_ready(WAIT).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = conn.on("pm.*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let presence = conn.once("presence");

        server.send_frame(&Frame::Event(
            EventFrame::new("pm.task.create", json!({"id": 1})).with_seq(1),
        ));
        server.send_frame(&Frame::Event(
            EventFrame::new("presence", json!({"presence": {"c1": {"host": "h"}}}))
                .with_seq(3)
                .with_state_version(7),
        ));

        tokio::time::timeout(WAIT, presence).await.unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state_version(), 7);
        let snapshot = conn.snapshot().unwrap();
        assert_eq!(snapshot.state_version, 7);
        assert!(snapshot.presence.contains_key("c1"));
        assert!(!conn.snapshot_is_stale());
        assert!(conn
            .diagnostics()
            .entries_for(Category::Event)
            .iter()
            .any(|e| e.message == "event sequence gap"));
        conn.close();
    }

    #[tokio::test]
    async fn test_shutdown_and_bad_tick_decoded_into_diagnostics() {
        let (conn, _t, mut listener) = setup();
        conn.connect(config()).unwrap();
        let server = accept(&mut listener, json!({"snapshot": {}})).await;
        conn.wait_ready(WAIT).await.unwrap();

        let shutdown = conn.once("shutdown");
        server.send_frame(&Frame::Event(EventFrame::new("tick", json!({"ts": "soon"}))));
        server.send_frame(&Frame::Event(EventFrame::new(
            "shutdown",
            json!({"reason": "upgrade", "restartExpectedMs": 5000, "extra": true}),
        )));
        tokio::time::timeout(WAIT, shutdown).await.unwrap().unwrap();

        let log = conn.diagnostics();
        let announced = log
            .entries_for(Category::Connection)
            .into_iter()
            .find(|e| e.message == "server announced shutdown")
            .unwrap();
        assert_eq!(
            announced.detail,
            Some(json!({"reason": "upgrade", "restartExpectedMs": 5000}))
        );
        assert!(log
            .entries_for(Category::Protocol)
            .iter()
            .any(|e| e.message == "malformed event payload"
                && e.detail.as_ref().is_some_and(|d| d["event"] == "tick")));
        conn.close();
    }

    #[tokio::test]
    async fn test_snapshot_fetched_when_not_embedded() {
        let (conn, _t, mut listener) = setup();
        conn.connect(config()).unwrap();
        let mut server = accept(&mut listener, json!({"stateVersion": 4})).await;

        let req = next_request(&mut server).await;
        assert_eq!(req.method, SNAPSHOT_METHOD);
        server.send_frame(&Frame::Response(ResponseFrame::success(
            req.id,
            json!({"presence": {}, "health": {"db": "ok"}, "stateVersion": 4}),
        )));

        let mut rx = conn.subscribe_snapshot();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(snapshot.health["db"], "ok");
        assert_eq!(conn.session().unwrap().protocol, 1);
        conn.close();
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (conn, _t, mut listener) = setup();
        conn.connect(config()).unwrap();
        let mut server = accept(&mut listener, json!({"snapshot": {}})).await;
        conn.wait_ready(WAIT).await.unwrap();

        server.send_text("{not json");
        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call("ping", None).await }
        });
        let req = next_request(&mut server).await;
        server.send_frame(&Frame::Response(ResponseFrame::success(req.id, json!("pong"))));

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(!conn.diagnostics().entries_for(Category::Protocol).is_empty());
        conn.close();
    }

    #[tokio::test]
    async fn test_silent_server_trips_liveness() {
        let (conn, _t, mut listener) = setup();
        let mut config = config();
        config.reconnect.enabled = false;
        conn.connect(config).unwrap();
        let _server = accept(
            &mut listener,
            json!({"snapshot": {}, "policy": {"tickIntervalMs": 20}}),
        )
        .await;

        let mut rx = conn.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        let connection_log = conn.diagnostics().entries_for(Category::Connection);
        assert!(connection_log.iter().any(|e| e.message.ends_with("-> ready")));
        assert!(connection_log.iter().any(|e| e.message == "server went silent"));
    }
}
