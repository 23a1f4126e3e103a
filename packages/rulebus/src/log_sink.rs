//! Event Log Sink - leveled log records produced by rule execution.
//!
//! Rules log through their context; the engine itself reports rejected
//! writes and rule failures the same way. Records render as
//! `[<level>] <message>` and keep submission order.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Severity of a rule log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Destination for rule log records.
///
/// Implementations must keep the order of calls; nothing else is promised.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards rule log records to `tracing` under the `rulebus::rule` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "rulebus::rule", "{message}"),
            LogLevel::Info => info!(target: "rulebus::rule", "{message}"),
            LogLevel::Warn => warn!(target: "rulebus::rule", "{message}"),
            LogLevel::Error => error!(target: "rulebus::rule", "{message}"),
        }
    }
}

/// Keeps records in memory, in order.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Records rendered as `[<level>] <message>`.
    pub fn lines(&self) -> Vec<String> {
        self.records().iter().map(ToString::to_string).collect()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogRecord::new(level, message));
    }
}

impl<S: LogSink> LogSink for Arc<S> {
    fn log(&self, level: LogLevel, message: &str) {
        (**self).log(level, message)
    }
}
