//! Per-agent activity journal (spec.md §4.7).
//!
//! Grounded on `memory/journal.rs`'s append-only, timestamped log idiom.
//! `steward` keeps "append, never mutate" but drops the markdown-file
//! backing in favor of a bounded in-memory ring buffer: the journal exists
//! to answer "what has this agent been doing", not to be a durable record
//! (that is the Audit stream's job, C9).

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Default ring buffer capacity per agent.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Bounded, append-only activity log for a single agent. Oldest entries
/// are evicted once `capacity` is reached.
pub struct ActivityJournal {
    capacity: usize,
    entries: parking_lot::RwLock<VecDeque<JournalEntry>>,
}

impl ActivityJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: parking_lot::RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, message: impl Into<String>) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(JournalEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Read-only snapshot, most recent last.
    pub fn snapshot(&self) -> Vec<JournalEntry> {
        self.entries.read().iter().cloned().collect()
    }
}

impl Default for ActivityJournal {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let journal = ActivityJournal::new(3);
        for i in 0..5 {
            journal.record(format!("entry {i}"));
        }
        let snapshot = journal.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].message, "entry 2");
        assert_eq!(snapshot[2].message, "entry 4");
    }
}
