use std::collections::HashMap;

use parking_lot::Mutex;

/// Pending single-use destination overrides, keyed by the `host:port` a
/// client will ask the proxy to dial.
///
/// An entry stays until one dial consumes it. There is no expiry: a directive
/// that is never followed by a matching dial keeps its entry for the life of
/// the table.
#[derive(Default)]
pub struct RuleTable {
    entries: Mutex<HashMap<String, String>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an override without removing it.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Reads and removes an override in one step, so a directive applies to
    /// at most one dial.
    pub fn consume(&self, key: &str) -> Option<String> {
        self.entries.lock().remove(key)
    }

    /// Inserts an override, replacing any unconsumed one for the same key.
    pub fn store(&self, key: impl Into<String>, destination: impl Into<String>) {
        self.entries.lock().insert(key.into(), destination.into());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
