//! Journal - one ordered record of everything an engine emits.
//!
//! A [`Journal`] is both a [`MessageBus`] and a [`LogSink`]. Handing the same
//! journal to [`EngineBuilder::new`](crate::EngineBuilder::new) for both
//! roles interleaves publications and log records exactly as the engine
//! produced them:
//!
//! ```text
//! echo -> /devices/loopback/controls/set_loud/on: [1] (QoS 1)
//! engine -> /devices/loopback/controls/set_loud: [1] (QoS 1)
//! [info] set_loud button pressed
//! engine -> /devices/loopback/controls/gauge: [42] (QoS 1, retained)
//! [info] gauge set to 42
//! ```
//!
//! Publications are forwarded to an inner bus (an [`InMemoryBus`] unless one
//! is supplied), so subscriptions and retained replay keep working.
//!
//! # Verifying
//!
//! ```ignore
//! let journal = Journal::new();
//! let engine = EngineBuilder::new(Arc::new(journal.clone()), Arc::new(journal.clone()))
//!     .with_device(loopback_device())
//!     .build()?;
//!
//! engine.handle_inbound("/devices/loopback/controls/gauge/on", "3")?;
//! journal.verify_ordered(&[
//!     "echo -> /devices/loopback/controls/gauge/on: [3] (QoS 1)",
//!     "engine -> /devices/loopback/controls/gauge: [3] (QoS 1, retained)",
//! ]);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bus::{InMemoryBus, MessageBus, MessageHandler, Publication, SubscriptionId};
use crate::error::BusError;
use crate::log_sink::{LogLevel, LogRecord, LogSink};

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Published(Publication),
    Logged(LogRecord),
}

/// Publications render as `<origin> -> <publication>`, log records as `[<level>] <message>`.
impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalEntry::Published(p) => write!(f, "{} -> {}", p.origin, p),
            JournalEntry::Logged(record) => write!(f, "{record}"),
        }
    }
}

/// Recording bus and log sink.
#[derive(Clone)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
    inner: Arc<dyn MessageBus>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self::wrapping(Arc::new(InMemoryBus::new()))
    }

    /// Forward publications to `inner`, recording those it accepts.
    pub fn wrapping(inner: Arc<dyn MessageBus>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            inner,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(ToString::to_string).collect()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<JournalEntry> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Assert the journal holds exactly `expected`, in order.
    ///
    /// # Panics
    ///
    /// Panics with both listings when they differ.
    pub fn verify_ordered(&self, expected: &[&str]) {
        let actual = self.lines();
        assert!(
            actual.iter().map(String::as_str).eq(expected.iter().copied()),
            "journal mismatch\nexpected:\n  {}\nactual:\n  {}",
            expected.join("\n  "),
            actual.join("\n  ")
        );
    }

    /// Assert the journal holds exactly `expected`, in any order.
    ///
    /// # Panics
    ///
    /// Panics with both listings when the multisets differ.
    pub fn verify_unordered(&self, expected: &[&str]) {
        let mut actual = self.lines();
        let mut wanted: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        actual.sort();
        wanted.sort();
        assert!(
            actual == wanted,
            "journal mismatch (unordered)\nexpected:\n  {}\nactual:\n  {}",
            wanted.join("\n  "),
            actual.join("\n  ")
        );
    }
}

impl MessageBus for Journal {
    fn publish(&self, publication: &Publication) -> Result<(), BusError> {
        self.inner.publish(publication)?;
        self.lock()
            .push(JournalEntry::Published(publication.clone()));
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, BusError> {
        self.inner.subscribe(pattern, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.inner.unsubscribe(id)
    }
}

impl LogSink for Journal {
    fn log(&self, level: LogLevel, message: &str) {
        self.lock()
            .push(JournalEntry::Logged(LogRecord::new(level, message)));
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("entries", &self.lock().len())
            .finish_non_exhaustive()
    }
}
