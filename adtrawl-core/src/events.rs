//! Collection lifecycle events and the notification sink boundary.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::warn;

use crate::models::CollectStats;

/// Named lifecycle events emitted during a collection run.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A search started. Carries the query it was started with.
    Started {
        /// The free-text query of the search.
        query: String,
    },
    /// A page was fetched and classified as usable.
    PageFetched {
        /// 1-based page index within the search.
        page: u64,
        /// Raw results on the page before filtering.
        raw_count: usize,
    },
    /// A record passed construction, dedup, and filtering.
    RecordCollected {
        /// Archive id of the collected record.
        archive_id: String,
    },
    /// A non-fatal error was absorbed (record construction, ceiling hit).
    Error {
        /// Human-readable description.
        message: String,
    },
    /// The server signalled rate limiting in-band.
    RateLimited {
        /// Which in-band retry attempt this was.
        attempt: u32,
    },
    /// The session was refreshed mid-run.
    SessionRefreshed,
    /// The search finished, on any exit path. Fires exactly once.
    Finished {
        /// Final stats for the run.
        stats: CollectStats,
    },
}

impl LifecycleEvent {
    /// Short machine-readable name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::PageFetched { .. } => "page_fetched",
            Self::RecordCollected { .. } => "record_collected",
            Self::Error { .. } => "error",
            Self::RateLimited { .. } => "rate_limited",
            Self::SessionRefreshed => "session_refreshed",
            Self::Finished { .. } => "finished",
        }
    }

    /// Small JSON payload for sinks that forward events externally.
    pub fn payload(&self) -> Value {
        match self {
            Self::Started { query } => serde_json::json!({ "query": query }),
            Self::PageFetched { page, raw_count } => {
                serde_json::json!({ "page": page, "raw_count": raw_count })
            }
            Self::RecordCollected { archive_id } => {
                serde_json::json!({ "archive_id": archive_id })
            }
            Self::Error { message } => serde_json::json!({ "message": message }),
            Self::RateLimited { attempt } => serde_json::json!({ "attempt": attempt }),
            Self::SessionRefreshed => Value::Null,
            Self::Finished { stats } => serde_json::to_value(stats).unwrap_or(Value::Null),
        }
    }
}

/// Observer of collection lifecycle events.
///
/// Implementations must be cheap; the engine calls them inline. A sink that
/// panics is isolated per call and never aborts the collection.
pub trait NotificationSink: Send + Sync {
    /// Receives one lifecycle event.
    fn notify(&self, event: &LifecycleEvent);
}

/// Calls the sink with panic isolation.
pub fn emit_isolated(sink: Option<&dyn NotificationSink>, event: &LifecycleEvent) {
    let Some(sink) = sink else { return };
    if catch_unwind(AssertUnwindSafe(|| sink.notify(event))).is_err() {
        warn!(event = event.name(), "notification sink panicked, ignoring");
    }
}
