//! Collaborator traits consumed by the collection engine.
//!
//! These are the external seams of the session layer: record construction,
//! deduplication, and filtering. All of them are synchronous and free of
//! I/O from the engine's point of view; a store backed by durable storage
//! hides its own I/O behind the trait.

use std::collections::HashSet;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::CoreError;
use crate::models::AdRecord;

/// Builds a domain record from one raw result payload.
///
/// Implementations must be pure: no retries, no I/O. Failures surface as
/// errors which the engine absorbs and counts per record.
pub trait RecordBuilder: Send + Sync {
    /// Attempts to construct a record.
    fn build(&self, raw: &Value) -> Result<AdRecord, CoreError>;
}

/// Default builder using the canonical key cascades.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRecordBuilder;

impl RecordBuilder for DefaultRecordBuilder {
    fn build(&self, raw: &Value) -> Result<AdRecord, CoreError> {
        AdRecord::from_raw(raw)
    }
}

/// Deduplication store consulted per record.
///
/// The engine marks a record seen only after yielding it, so an aborted
/// consumer may see the last yielded record again on the next run
/// (at-least-once marking).
pub trait DedupStore: Send + Sync {
    /// True if the id has been marked seen before.
    fn has_seen(&self, id: &str) -> bool;
    /// Marks the id as seen.
    fn mark_seen(&self, id: &str);
}

/// In-memory dedup store.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    seen: Mutex<HashSet<String>>,
}

impl MemoryDedupStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids marked seen.
    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// True if nothing has been marked seen.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupStore for MemoryDedupStore {
    fn has_seen(&self, id: &str) -> bool {
        self.seen.lock().map(|s| s.contains(id)).unwrap_or(false)
    }

    fn mark_seen(&self, id: &str) {
        if let Ok(mut s) = self.seen.lock() {
            s.insert(id.to_string());
        }
    }
}

/// Per-record acceptance predicate.
pub trait RecordFilter: Send + Sync {
    /// True if the record should be yielded to the caller.
    fn accept(&self, record: &AdRecord) -> bool;
}

impl<F> RecordFilter for F
where
    F: Fn(&AdRecord) -> bool + Send + Sync,
{
    fn accept(&self, record: &AdRecord) -> bool {
        self(record)
    }
}
