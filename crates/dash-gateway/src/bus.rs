//! In-process publish/subscribe router for server-pushed events.
//!
//! Exact-name handlers and wildcard handlers live in separate tables. A
//! wildcard pattern matches every event name that starts with the text
//! before its first `*`, so `pm.*` matches `pm.task.create` and `*` matches
//! everything.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use dash_proto::{EventFrame, Frame};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::diagnostics::{Category, DiagnosticLog};
use crate::error::GatewayError;
use crate::subscription::{panic_message, Subscription};

/// Wildcard marker in subscription patterns.
pub const WILDCARD: char = '*';

/// Lifetime of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Lives until unsubscribed, across reconnects and `close()`.
    #[default]
    Persistent,
    /// Removed when the owning connection is closed by the caller.
    Connection,
}

type Handler = Arc<dyn Fn(&EventFrame) + Send + Sync>;

struct Entry {
    id: u64,
    scope: Scope,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Entry>>,
    wildcard: BTreeMap<String, Vec<Entry>>,
}

impl Registry {
    fn bucket_mut(&mut self, pattern: &str) -> &mut Vec<Entry> {
        if is_wildcard(pattern) {
            self.wildcard.entry(pattern.to_string()).or_default()
        } else {
            self.exact.entry(pattern.to_string()).or_default()
        }
    }

    fn remove(&mut self, pattern: &str, id: u64) {
        if is_wildcard(pattern) {
            if let Some(bucket) = self.wildcard.get_mut(pattern) {
                bucket.retain(|e| e.id != id);
                if bucket.is_empty() {
                    self.wildcard.remove(pattern);
                }
            }
        } else if let Some(bucket) = self.exact.get_mut(pattern) {
            bucket.retain(|e| e.id != id);
            if bucket.is_empty() {
                self.exact.remove(pattern);
            }
        }
    }

    fn matching(&self, event: &str) -> Vec<Handler> {
        let mut handlers: Vec<Handler> = self
            .exact
            .get(event)
            .into_iter()
            .flatten()
            .map(|e| Arc::clone(&e.handler))
            .collect();

        for (pattern, bucket) in &self.wildcard {
            if event.starts_with(wildcard_prefix(pattern)) {
                handlers.extend(bucket.iter().map(|e| Arc::clone(&e.handler)));
            }
        }
        handlers
    }

    fn retain_scope(&mut self, scope: Scope) {
        for bucket in self.exact.values_mut() {
            bucket.retain(|e| e.scope != scope);
        }
        self.exact.retain(|_, bucket| !bucket.is_empty());
        for bucket in self.wildcard.values_mut() {
            bucket.retain(|e| e.scope != scope);
        }
        self.wildcard.retain(|_, bucket| !bucket.is_empty());
    }

    fn count(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>()
            + self.wildcard.values().map(Vec::len).sum::<usize>()
    }
}

struct BusInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    diagnostics: Arc<DiagnosticLog>,
}

/// Routes event frames to registered handlers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new(diagnostics: Arc<DiagnosticLog>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(1),
                diagnostics,
            }),
        }
    }

    /// Register a persistent handler for an exact name or wildcard pattern.
    pub fn on(
        &self,
        pattern: impl Into<String>,
        handler: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_scoped(pattern, Scope::Persistent, handler)
    }

    /// Register a handler with an explicit [`Scope`].
    pub fn on_scoped(
        &self,
        pattern: impl Into<String>,
        scope: Scope,
        handler: impl Fn(&EventFrame) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.register(pattern.into(), id, scope, Arc::new(handler))
    }

    /// Resolve with the payload of the next matching event.
    ///
    /// The handler removes itself after the first delivery, and dropping the
    /// returned [`Once`] before then removes it too. If the registration is
    /// cleared first the future fails with [`GatewayError::ConnectionClosed`].
    pub fn once(&self, pattern: impl Into<String>) -> Once {
        let pattern = pattern.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let weak = Arc::downgrade(&self.inner);
        let own_pattern = pattern.clone();

        let handler = move |frame: &EventFrame| {
            let Some(tx) = slot.lock().take() else {
                return;
            };
            let _ = tx.send(frame.payload().clone());
            if let Some(inner) = weak.upgrade() {
                inner.registry.write().remove(&own_pattern, id);
            }
        };
        let registration = self.register(pattern, id, Scope::Connection, Arc::new(handler));

        Once {
            rx,
            registration: Some(registration),
        }
    }

    fn register(&self, pattern: String, id: u64, scope: Scope, handler: Handler) -> Subscription {
        self.inner
            .registry
            .write()
            .bucket_mut(&pattern)
            .push(Entry { id, scope, handler });

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.registry.write().remove(&pattern, id);
            }
        })
    }

    /// Dispatch `frame` if it is an event. Returns `false` for any other
    /// frame kind.
    pub fn handle_frame(&self, frame: &Frame) -> bool {
        match frame {
            Frame::Event(event) => {
                self.dispatch(event);
                true
            }
            _ => false,
        }
    }

    /// Invoke every matching handler, exact matches first. Returns how many
    /// handlers ran to completion.
    pub fn dispatch(&self, event: &EventFrame) -> usize {
        let handlers = self.inner.registry.read().matching(&event.event);

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => self.inner.diagnostics.error(
                    Category::Event,
                    format!("handler for {} panicked", event.event),
                    Some(json!({"event": event.event, "panic": panic_message(payload.as_ref())})),
                ),
            }
        }
        delivered
    }

    /// Remove every registration in `scope`.
    pub fn clear_scope(&self, scope: Scope) {
        self.inner.registry.write().retain_scope(scope);
    }

    /// Remove every registration.
    pub fn clear(&self) {
        *self.inner.registry.write() = Registry::default();
    }

    /// Number of live registrations.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.registry.read().count()
    }
}

/// Future returned by [`EventBus::once`].
///
/// Owns its registration: it is released on completion or drop.
#[derive(Debug)]
#[must_use = "the registration is released when this is dropped"]
pub struct Once {
    rx: oneshot::Receiver<Value>,
    registration: Option<Subscription>,
}

impl Future for Once {
    type Output = Result<Value, GatewayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.rx).poll(cx));
        if let Some(registration) = self.registration.take() {
            registration.unsubscribe();
        }
        Poll::Ready(
            result.map_err(|_| GatewayError::closed("subscription cleared before delivery")),
        )
    }
}

impl Drop for Once {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.unsubscribe();
        }
    }
}

/// Whether `pattern` is stored as a wildcard.
#[must_use]
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(WILDCARD)
}

fn wildcard_prefix(pattern: &str) -> &str {
    pattern.find(WILDCARD).map_or(pattern, |i| &pattern[..i])
}
