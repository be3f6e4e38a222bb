//! Process-lifetime set of raw lines already turned into tasks.

use std::collections::HashSet;

/// Exact-string dedup of accepted command lines.
///
/// Grows without bound and is never persisted; cross-restart dedup comes
/// from the content-hash task id instead.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seen(&self, raw: &str) -> bool {
        self.seen.contains(raw)
    }

    /// Returns false if the line was already marked
    pub fn mark_seen(&mut self, raw: &str) -> bool {
        self.seen.insert(raw.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
