//! Snapshot store.
//!
//! Holds the single current [`Snapshot`] generation. Every replacement swaps
//! an `Arc`, so a reader holding the previous generation keeps seeing it
//! whole while new readers see the new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dash_proto::{EventFrame, KnownEvent, Snapshot};
use serde_json::json;
use tokio::sync::watch;

use crate::diagnostics::{Category, DiagnosticLog};

/// Latest server-authoritative snapshot.
#[derive(Debug)]
pub struct SnapshotStore {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
    generation: AtomicU64,
    diagnostics: Arc<DiagnosticLog>,
}

impl SnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(diagnostics: Arc<DiagnosticLog>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            generation: AtomicU64::new(0),
            diagnostics,
        }
    }

    /// Swap in a new generation.
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.diagnostics.debug(
            Category::Snapshot,
            "snapshot replaced",
            Some(json!({
                "generation": generation,
                "stateVersion": snapshot.state_version,
                "presence": snapshot.presence_count(),
            })),
        );
        self.tx.send_replace(Some(Arc::clone(&snapshot)));
        snapshot
    }

    /// Current generation, if any snapshot has arrived.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        self.tx.borrow().clone()
    }

    /// Receiver that changes once per replacement.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.tx.subscribe()
    }

    /// `stateVersion` of the current generation.
    #[must_use]
    pub fn state_version(&self) -> Option<u64> {
        self.tx.borrow().as_ref().map(|s| s.state_version)
    }

    /// Whether the held snapshot predates `current_version`.
    #[must_use]
    pub fn is_stale(&self, current_version: u64) -> bool {
        self.state_version().is_none_or(|v| v < current_version)
    }

    /// Number of replacements so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fold a snapshot-namespace event into a new generation.
    ///
    /// `presence` and `health` events carry their complete map and replace
    /// that component wholesale; `snapshot` events replace everything.
    /// Returns whether a replacement happened.
    pub fn apply_event(&self, event: &EventFrame) -> bool {
        let parsed = match KnownEvent::parse(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.diagnostics.warn(
                    Category::Protocol,
                    format!("ignoring malformed {} event", event.event),
                    Some(json!({"error": e.to_string()})),
                );
                return false;
            }
        };

        let base = self.get().map(|s| (*s).clone()).unwrap_or_default();
        let version = event.state_version.unwrap_or(base.state_version);
        let next = match parsed {
            KnownEvent::Presence(p) => base.with_presence(p.presence, version),
            KnownEvent::Health(h) => base.with_health(h.health, version),
            KnownEvent::Snapshot(mut s) => {
                if let Some(v) = event.state_version {
                    s.state_version = s.state_version.max(v);
                }
                *s
            }
            _ => return false,
        };
        self.replace(next);
        true
    }
}
