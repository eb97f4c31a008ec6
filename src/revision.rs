//! Revision Counter
//!
//! Per-replica write sequence number. Every head record carries the
//! revision it was written at, so appending the record is the durable
//! counter bump; the catalog only anchors the counter at chain commits and
//! administrative overrides.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter value anchored in the replica catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistedRevision {
    /// Counter at the time of the last chain commit
    pub counter: u64,
    /// Head length at the time of the last chain commit
    pub head_offset: u64,
}

impl PersistedRevision {
    /// Recover the counter after a restart.
    ///
    /// Records appended to the head after the anchor carry newer revisions;
    /// when none were appended the anchor itself is authoritative, which
    /// keeps an administrative override from being undone by older records.
    pub fn recover(&self, head_len: u64, head_last_revision: u64) -> u64 {
        if head_len > self.head_offset {
            self.counter.max(head_last_revision)
        } else {
            self.counter
        }
    }
}

/// In-memory revision counter of one replica
#[derive(Debug, Default)]
pub struct RevisionCounter {
    value: AtomicU64,
}

impl RevisionCounter {
    pub fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Current counter value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Revision the next applied write will carry
    pub fn next(&self) -> u64 {
        self.get() + 1
    }

    /// Record that a write carrying `revision` is durable
    pub fn advance_to(&self, revision: u64) {
        self.value.fetch_max(revision, Ordering::SeqCst);
    }

    /// Overwrite the counter (administrative or rebuild reset)
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }
}
