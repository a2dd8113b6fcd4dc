//! Structured log records and the sinks they are delivered to.
//!
//! Components never call `tracing` directly for user-facing output; they hand
//! [`LogRecord`]s to an injected [`LogSink`] so callers can redirect, capture,
//! or silence them.

pub mod logging;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub component: &'static str,
    /// Wire name of the protocol event the record is about, if any.
    pub event: Option<String>,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: Level, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            level,
            component,
            event: None,
            message: message.into(),
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.component)?;
        if let Some(event) = &self.event {
            write!(f, " ({event})")?;
        }
        write!(f, ": {}", self.message)
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

pub type SharedSink = Arc<dyn LogSink>;

pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

/// Forwards records to the global `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: LogRecord) {
        let component = record.component;
        let event = record.event.as_deref().unwrap_or("-");
        let message = record.message.as_str();
        match record.level {
            Level::ERROR => tracing::error!(target: "flowline", component, event, "{message}"),
            Level::WARN => tracing::warn!(target: "flowline", component, event, "{message}"),
            Level::INFO => tracing::info!(target: "flowline", component, event, "{message}"),
            Level::DEBUG => tracing::debug!(target: "flowline", component, event, "{message}"),
            _ => tracing::trace!(target: "flowline", component, event, "{message}"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn log(&self, _record: LogRecord) {}
}

/// Keeps every record in memory. Mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| record.level == level && record.message.contains(needle))
    }

    pub fn count_at(&self, level: Level) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.level == level)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn log(&self, record: LogRecord) {
        self.records.lock().push(record);
    }
}

/// Adapts a plain callback into a sink.
#[derive(Clone)]
pub struct FnSink(Arc<dyn Fn(&LogRecord) + Send + Sync>);

impl FnSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for FnSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnSink(..)")
    }
}

impl LogSink for FnSink {
    fn log(&self, record: LogRecord) {
        (self.0)(&record);
    }
}
