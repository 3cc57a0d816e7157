//! Connection state and the single authority that changes it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use crate::diagnostics::{Category, DiagnosticLog};
use crate::subscription::{panic_message, Subscription};

/// State of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, handshake in progress.
    Authenticating,
    /// Handshake complete; calls are accepted.
    Ready,
    /// Connection lost, waiting for the next retry.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether a supervisor is driving the connection in this state.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// State before.
    pub from: ConnectionState,
    /// State after.
    pub to: ConnectionState,
    /// Why it changed.
    pub reason: Option<String>,
}

type StateHandler = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Listeners {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, StateHandler)>>,
}

/// Owns the current [`ConnectionState`]; every change goes through here so
/// transitions are totally ordered.
pub(crate) struct StateMachine {
    tx: watch::Sender<ConnectionState>,
    listeners: Arc<Listeners>,
    diagnostics: Arc<DiagnosticLog>,
}

impl StateMachine {
    pub(crate) fn new(diagnostics: Arc<DiagnosticLog>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            listeners: Arc::new(Listeners {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(Vec::new()),
            }),
            diagnostics,
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `to` unconditionally. Returns whether the state changed.
    pub(crate) fn transition(&self, to: ConnectionState, reason: Option<&str>) -> bool {
        self.transition_if(to, reason, || true)
    }

    /// Move to `to` only if `allowed()` holds at the moment of the change.
    ///
    /// `allowed` runs under the state lock, so a check against a
    /// cancellation flag cannot interleave with another transition.
    pub(crate) fn transition_if(
        &self,
        to: ConnectionState,
        reason: Option<&str>,
        allowed: impl FnOnce() -> bool,
    ) -> bool {
        let mut from = None;
        self.tx.send_if_modified(|current| {
            if *current == to || !allowed() {
                return false;
            }
            from = Some(*current);
            *current = to;
            true
        });

        let Some(from) = from else {
            return false;
        };

        self.diagnostics.info(
            Category::Connection,
            format!("{from} -> {to}"),
            Some(json!({"from": from, "to": to, "reason": reason})),
        );

        let change = StateChange {
            from,
            to,
            reason: reason.map(str::to_string),
        };
        let handlers: Vec<StateHandler> = self
            .listeners
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&change))) {
                self.diagnostics.error(
                    Category::Connection,
                    "state listener panicked",
                    Some(json!({"panic": panic_message(payload.as_ref())})),
                );
            }
        }
        true
    }

    pub(crate) fn on_change(
        &self,
        handler: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .handlers
            .lock()
            .push((id, Arc::new(handler)));

        let weak: Weak<Listeners> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.handlers.lock().retain(|(i, _)| *i != id);
            }
        })
    }
}
