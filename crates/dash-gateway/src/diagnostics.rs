//! Diagnostic log.
//!
//! A bounded ring of categorized diagnostic events shared by every component
//! of the client. One instance is created per process and injected; each
//! record is also emitted through `tracing`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of retained entries.
pub const DEFAULT_CAPACITY: usize = 500;

/// Which part of the client produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// State machine transitions and socket lifecycle.
    Connection,
    /// Handshake and credentials.
    Auth,
    /// Request/response correlation.
    Rpc,
    /// Event dispatch.
    Event,
    /// Backoff scheduling.
    Reconnect,
    /// Snapshot replacement.
    Snapshot,
    /// Malformed or unexpected frames.
    Protocol,
}

impl Category {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Rpc => "rpc",
            Self::Event => "event",
            Self::Reconnect => "reconnect",
            Self::Snapshot => "snapshot",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Verbose detail.
    Debug,
    /// Normal operation.
    Info,
    /// Recoverable problem.
    Warn,
    /// Failure.
    Error,
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    /// When it was recorded.
    pub ts: DateTime<Utc>,
    /// Producer.
    pub category: Category,
    /// Severity.
    pub level: Level,
    /// Short description.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Bounded ring buffer of [`DiagnosticEvent`]s.
#[derive(Debug)]
pub struct DiagnosticLog {
    entries: Mutex<VecDeque<DiagnosticEvent>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DiagnosticLog {
    /// Create a log retaining at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Append an entry, evicting the oldest if full.
    pub fn record(
        &self,
        category: Category,
        level: Level,
        message: impl Into<String>,
        detail: Option<Value>,
    ) {
        let message = message.into();
        match level {
            Level::Debug => tracing::debug!(category = %category, detail = ?detail, "{message}"),
            Level::Info => tracing::info!(category = %category, detail = ?detail, "{message}"),
            Level::Warn => tracing::warn!(category = %category, detail = ?detail, "{message}"),
            Level::Error => tracing::error!(category = %category, detail = ?detail, "{message}"),
        }

        let event = DiagnosticEvent {
            ts: Utc::now(),
            category,
            level,
            message,
            detail,
        };

        let mut entries = self.entries.lock();
        entries.push_back(event);
        while entries.len() > self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record at debug level.
    pub fn debug(&self, category: Category, message: impl Into<String>, detail: Option<Value>) {
        self.record(category, Level::Debug, message, detail);
    }

    /// Record at info level.
    pub fn info(&self, category: Category, message: impl Into<String>, detail: Option<Value>) {
        self.record(category, Level::Info, message, detail);
    }

    /// Record at warn level.
    pub fn warn(&self, category: Category, message: impl Into<String>, detail: Option<Value>) {
        self.record(category, Level::Warn, message, detail);
    }

    /// Record at error level.
    pub fn error(&self, category: Category, message: impl Into<String>, detail: Option<Value>) {
        self.record(category, Level::Error, message, detail);
    }

    /// All retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DiagnosticEvent> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Retained entries for one category, oldest first.
    #[must_use]
    pub fn entries_for(&self, category: Category) -> Vec<DiagnosticEvent> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of retained entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many entries have been evicted since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop all retained entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Serialize the retained entries as a JSON array.
    #[must_use]
    pub fn export_json(&self) -> String {
        let entries = self.entries();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}
