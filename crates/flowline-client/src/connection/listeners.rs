use std::collections::BTreeMap;

use crate::handlers::{EventHandler, HandlerKey};

/// Listeners attached to one connection, in registration order per key.
#[derive(Default)]
pub(crate) struct ListenerTable {
    entries: BTreeMap<HandlerKey, Vec<EventHandler>>,
}

impl ListenerTable {
    pub(crate) fn add(&mut self, key: HandlerKey, handler: EventHandler) {
        self.entries.entry(key).or_default().push(handler);
    }

    pub(crate) fn remove(&mut self, key: &HandlerKey) -> usize {
        self.entries.remove(key).map_or(0, |removed| removed.len())
    }

    pub(crate) fn clear(&mut self) -> usize {
        let removed = self.total();
        self.entries.clear();
        removed
    }

    pub(crate) fn count(&self, key: &HandlerKey) -> usize {
        self.entries.get(key).map_or(0, Vec::len)
    }

    pub(crate) fn total(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub(crate) fn keys(&self) -> Vec<HandlerKey> {
        self.entries.keys().cloned().collect()
    }

    /// Snapshot so dispatch can run without holding the table.
    pub(crate) fn handlers_for(&self, key: &HandlerKey) -> Vec<EventHandler> {
        self.entries.get(key).cloned().unwrap_or_default()
    }
}
