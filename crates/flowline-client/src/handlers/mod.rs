//! Event handlers, the keys they are registered under, and how they are chosen.

pub mod profiles;
pub mod registry;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use flowline_proto::{EventKind, ServerEvent};
use tracing::Level;

use crate::telemetry::{LogRecord, LogSink};

pub use profiles::{HandlerProfile, ProfileKind};
pub use registry::{register, resolve, ListenerHost, Registration};

pub type EventHandler = Arc<dyn Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync>;

pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The name a listener is registered under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerKey {
    Known(EventKind),
    Custom(String),
}

impl HandlerKey {
    pub fn from_name(name: &str) -> Self {
        match EventKind::from_name(name) {
            Some(kind) => HandlerKey::Known(kind),
            None => HandlerKey::Custom(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HandlerKey::Known(kind) => kind.as_str(),
            HandlerKey::Custom(name) => name,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            HandlerKey::Known(kind) => Some(*kind),
            HandlerKey::Custom(_) => None,
        }
    }
}

impl From<EventKind> for HandlerKey {
    fn from(kind: EventKind) -> Self {
        HandlerKey::Known(kind)
    }
}

impl From<&str> for HandlerKey {
    fn from(name: &str) -> Self {
        HandlerKey::from_name(name)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One effective handler per key.
#[derive(Clone, Default)]
pub struct HandlerTable {
    entries: BTreeMap<HandlerKey, EventHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler, replacing any earlier one for the same key.
    pub fn insert(&mut self, key: impl Into<HandlerKey>, handler: EventHandler) {
        self.entries.insert(key.into(), handler);
    }

    pub fn get(&self, key: &HandlerKey) -> Option<&EventHandler> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for HandlerTable {
    type Item = (HandlerKey, EventHandler);
    type IntoIter = std::collections::btree_map::IntoIter<HandlerKey, EventHandler>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Caller-supplied replacements for profile handlers.
///
/// An entry set to `None` is explicitly unset and falls back to the profile.
#[derive(Clone, Default)]
pub struct HandlerOverrides {
    entries: BTreeMap<HandlerKey, Option<EventHandler>>,
}

impl HandlerOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(self, key: impl Into<HandlerKey>, f: F) -> Self
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with_handler(key, handler(f))
    }

    pub fn with_handler(mut self, key: impl Into<HandlerKey>, handler: EventHandler) -> Self {
        self.entries.insert(key.into(), Some(handler));
        self
    }

    pub fn unset(mut self, key: impl Into<HandlerKey>) -> Self {
        self.entries.insert(key.into(), None);
        self
    }

    pub fn set(&mut self, key: impl Into<HandlerKey>, handler: EventHandler) {
        self.entries.insert(key.into(), Some(handler));
    }

    /// The override for `key`, if one is present and set.
    pub fn get(&self, key: &HandlerKey) -> Option<&EventHandler> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HandlerKey, Option<&EventHandler>)> {
        self.entries.iter().map(|(key, handler)| (key, handler.as_ref()))
    }

    /// Layer `other` on top of `self`; entries in `other` win.
    pub fn merge(&self, other: &HandlerOverrides) -> HandlerOverrides {
        let mut entries = self.entries.clone();
        for (key, handler) in &other.entries {
            entries.insert(key.clone(), handler.clone());
        }
        HandlerOverrides { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for HandlerOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(key, handler)| (key.as_str(), if handler.is_some() { "set" } else { "unset" })),
            )
            .finish()
    }
}

/// Run `handler`, logging and swallowing any error or panic. Returns whether
/// the handler succeeded.
pub fn invoke_guarded(handler: &EventHandler, event: &ServerEvent, sink: &dyn LogSink) -> bool {
    let failure = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => return true,
        Ok(Err(err)) => format!("{err:#}"),
        Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
    };
    sink.log(
        LogRecord::new(
            Level::ERROR,
            "handlers",
            format!("handler for {} failed: {failure}", event.name()),
        )
        .with_event(event.name()),
    );
    false
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
