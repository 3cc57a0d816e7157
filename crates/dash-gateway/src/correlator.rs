//! Request/response correlation.
//!
//! Every outbound call gets a pending entry keyed by its [`RequestId`]. The
//! entry is settled exactly once: by a matching response, by its timeout,
//! or by [`Correlator::clear`] when the connection goes away.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dash_proto::{Frame, RequestFrame, RequestId, ResponseFrame};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::diagnostics::{Category, DiagnosticLog};
use crate::error::GatewayError;
use crate::transport::Outbound;

type Reply = oneshot::Sender<Result<Value, GatewayError>>;

struct Pending {
    method: String,
    sent_at: Instant,
    timeout_ms: u64,
    reply: Reply,
    timer: AbortHandle,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatorMetrics {
    /// Requests awaiting a response.
    pub in_flight: usize,
    /// Requests transmitted.
    pub total_sent: u64,
    /// Requests settled by a response.
    pub total_completed: u64,
    /// Requests settled by their timeout.
    pub total_timed_out: u64,
    /// Responses with no pending entry.
    pub total_unmatched: u64,
}

struct Inner {
    pending: Mutex<HashMap<RequestId, Pending>>,
    sent: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    unmatched: AtomicU64,
    diagnostics: Arc<DiagnosticLog>,
}

/// Tracks in-flight requests.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Resolves with the response payload or the failure that settled the call.
#[derive(Debug)]
pub struct ResponseFuture {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, GatewayError>>,
}

impl ResponseFuture {
    /// Correlation id of the request.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, GatewayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(GatewayError::closed("request abandoned"))))
    }
}

impl Correlator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new(diagnostics: Arc<DiagnosticLog>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                sent: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                unmatched: AtomicU64::new(0),
                diagnostics,
            }),
        }
    }

    /// Register and transmit a request.
    ///
    /// The pending entry exists before the frame leaves, so a response that
    /// races the send still finds it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Protocol`] if the frame cannot be encoded or
    /// exceeds `max_payload`, and [`GatewayError::ConnectionClosed`] if the
    /// socket writer is gone.
    pub fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        outbound: &Outbound,
        max_payload: Option<usize>,
    ) -> Result<ResponseFuture, GatewayError> {
        let request = RequestFrame::new(method, params);
        let id = request.id.clone();
        let text = Frame::Request(request).to_json()?;
        if let Some(max) = max_payload {
            if text.len() > max {
                return Err(GatewayError::Protocol(format!(
                    "{method} request is {} bytes, server accepts {max}",
                    text.len()
                )));
            }
        }

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let (tx, rx) = oneshot::channel();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer_id = id.clone();

        // The timer may fire on another worker before spawn returns; holding
        // the lock makes its expire wait for the entry.
        let mut pending = self.inner.pending.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Self { inner }.expire(&timer_id);
            }
        })
        .abort_handle();
        pending.insert(
            id.clone(),
            Pending {
                method: method.to_string(),
                sent_at: Instant::now(),
                timeout_ms,
                reply: tx,
                timer,
            },
        );
        drop(pending);

        if let Err(err) = outbound.send_text(text) {
            if let Some(pending) = self.inner.pending.lock().remove(&id) {
                pending.timer.abort();
            }
            return Err(err);
        }

        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.diagnostics.debug(
            Category::Rpc,
            format!("-> {method}"),
            Some(json!({"id": id, "timeoutMs": timeout_ms})),
        );
        Ok(ResponseFuture { id, rx })
    }

    /// Settle the pending entry for `response`.
    ///
    /// Returns `false` when no entry matches; late responses after a timeout
    /// land here and are only logged.
    pub fn resolve(&self, response: ResponseFrame) -> bool {
        let Some(pending) = self.inner.pending.lock().remove(&response.id) else {
            self.inner.unmatched.fetch_add(1, Ordering::Relaxed);
            self.inner.diagnostics.debug(
                Category::Rpc,
                "response with no pending request",
                Some(json!({"id": response.id, "ok": response.ok})),
            );
            return false;
        };

        pending.timer.abort();
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = u64::try_from(pending.sent_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.inner.diagnostics.debug(
            Category::Rpc,
            format!("<- {}", pending.method),
            Some(json!({"id": response.id, "ok": response.ok, "latencyMs": elapsed_ms})),
        );

        let result = response.into_result().map_err(GatewayError::from);
        let _ = pending.reply.send(result);
        true
    }

    /// Fail the pending entry for `id` with a timeout. No-op if already
    /// settled.
    pub fn expire(&self, id: &RequestId) -> bool {
        let Some(pending) = self.inner.pending.lock().remove(id) else {
            return false;
        };

        self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
        self.inner.diagnostics.warn(
            Category::Rpc,
            format!("{} timed out", pending.method),
            Some(json!({"id": id, "timeoutMs": pending.timeout_ms})),
        );
        let _ = pending.reply.send(Err(GatewayError::Timeout {
            method: pending.method,
            timeout_ms: pending.timeout_ms,
        }));
        true
    }

    /// Fail every pending entry with `err`. Returns how many were failed.
    pub fn clear(&self, err: &GatewayError) -> usize {
        let drained: Vec<Pending> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        if drained.is_empty() {
            return 0;
        }

        self.inner.diagnostics.info(
            Category::Rpc,
            format!("failing {} pending requests", drained.len()),
            Some(json!({"code": err.code()})),
        );
        let count = drained.len();
        for pending in drained {
            pending.timer.abort();
            let _ = pending.reply.send(Err(err.clone()));
        }
        count
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> CorrelatorMetrics {
        CorrelatorMetrics {
            in_flight: self.in_flight(),
            total_sent: self.inner.sent.load(Ordering::Relaxed),
            total_completed: self.inner.completed.load(Ordering::Relaxed),
            total_timed_out: self.inner.timed_out.load(Ordering::Relaxed),
            total_unmatched: self.inner.unmatched.load(Ordering::Relaxed),
        }
    }
}
