//! Cursor-driven collection engine.
//!
//! A search is a lazy, single-pass, non-restartable sequence of records
//! pulled page by page. In-band protocol signals (rate limiting, session
//! expiry) are retried up to an inner ceiling and then end the search
//! quietly with an error count; raised fetch errors exhaust the same
//! ceiling and re-raise. The `finished` notification fires exactly once on
//! every exit path, including abandonment, via `Drop`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use adtrawl_core::{
    emit_isolated, AdRecord, CollectStats, DedupStore, LifecycleEvent, NotificationSink,
    RecordBuilder, RecordFilter, SearchParams,
};

use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::retry::{exception_wait, jitter, rate_limit_wait};
use crate::session::{PageRequest, PageSource};
use crate::wire::{self, classify_page, PageClass};

// ============================================================================
// Shared step logic (used verbatim by the blocking flavor)
// ============================================================================

/// Collection pacing and ceilings, extracted from the client config.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// In-band retry ceiling for rate-limit and session-expiry signals.
    pub inband_retry_ceiling: u32,
    /// Delay between successfully fetched pages.
    pub page_delay: Duration,
    /// Jitter bound added to waits.
    pub max_jitter: Duration,
    /// Fixed wait after an in-band session-expiry signal.
    pub session_expiry_wait: Duration,
}

impl From<&ClientConfig> for CollectorSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            inband_retry_ceiling: config.inband_retry_ceiling,
            page_delay: config.page_delay,
            max_jitter: config.max_jitter,
            session_expiry_wait: config.session_expiry_wait,
        }
    }
}

/// What to do with one classified page payload.
#[derive(Debug)]
pub(crate) enum PagePlan {
    /// Wait, then fetch the same cursor again.
    Wait {
        delay: Duration,
        event: LifecycleEvent,
    },
    /// The inner ceiling is exhausted: end the search with an error count,
    /// not an exception.
    GiveUp { message: String },
    /// A usable page.
    Deliver {
        records: Vec<Value>,
        cursor: Option<String>,
    },
}

/// Decides the next step for a classified payload. `attempts` is the
/// in-band attempt count including the current one.
pub(crate) fn plan_class(class: PageClass, attempts: u32, settings: &CollectorSettings) -> PagePlan {
    match class {
        PageClass::RateLimited => {
            if attempts >= settings.inband_retry_ceiling {
                PagePlan::GiveUp {
                    message: format!("rate limited {attempts} times, giving up on search"),
                }
            } else {
                PagePlan::Wait {
                    delay: rate_limit_wait(attempts, settings.max_jitter),
                    event: LifecycleEvent::RateLimited { attempt: attempts },
                }
            }
        }
        PageClass::SessionExpired => {
            if attempts >= settings.inband_retry_ceiling {
                PagePlan::GiveUp {
                    message: format!("session signalled expired {attempts} times, giving up"),
                }
            } else {
                PagePlan::Wait {
                    delay: settings.session_expiry_wait,
                    event: LifecycleEvent::Error {
                        message: format!("in-band session expiry, attempt {attempts}"),
                    },
                }
            }
        }
        PageClass::Page { records, cursor } => PagePlan::Deliver { records, cursor },
    }
}

/// Runs one raw result through construction, dedup, and filtering.
///
/// A construction failure is isolated: it increments the error counter and
/// is skipped. A dedup or filter rejection is silently skipped, not
/// counted as an error.
pub(crate) fn process_raw(
    raw: &Value,
    builder: &dyn RecordBuilder,
    dedup: Option<&dyn DedupStore>,
    filter: Option<&dyn RecordFilter>,
    stats: &mut CollectStats,
    sink: Option<&dyn NotificationSink>,
) -> Option<AdRecord> {
    let record = match builder.build(raw) {
        Ok(r) => r,
        Err(e) => {
            stats.errors += 1;
            warn!(error = %e, "record construction failed, skipping item");
            emit_isolated(
                sink,
                &LifecycleEvent::Error {
                    message: format!("record construction failed: {e}"),
                },
            );
            return None;
        }
    };
    if dedup.is_some_and(|d| d.has_seen(&record.archive_id)) {
        debug!(archive_id = %record.archive_id, "duplicate record skipped");
        return None;
    }
    if filter.is_some_and(|f| !f.accept(&record)) {
        return None;
    }
    Some(record)
}

// ============================================================================
// Async collector
// ============================================================================

/// Lazily produced record sequence for one search.
///
/// Pull records with [`Collector::next_record`]; the sequence is
/// single-pass and non-restartable. Dropping the collector mid-stream
/// still emits the `finished` notification, but leaves the last yielded
/// record unmarked in the dedup store (at-least-once marking).
pub struct Collector<S: PageSource> {
    source: S,
    settings: CollectorSettings,
    builder: Arc<dyn RecordBuilder>,
    dedup: Option<Arc<dyn DedupStore>>,
    filter: Option<Arc<dyn RecordFilter>>,
    sink: Option<Arc<dyn NotificationSink>>,
    request: PageRequest,
    max_results: Option<usize>,
    buffer: VecDeque<Value>,
    to_mark: Option<String>,
    stats: CollectStats,
    inband_attempts: u32,
    exception_attempts: u32,
    need_page_delay: bool,
    done: bool,
    finished_emitted: bool,
}

impl<S: PageSource> Collector<S> {
    /// Starts a search over the given page source. Parameters are
    /// validated before any network call; the per-search correlation
    /// identifiers are generated here and never change across pages.
    pub fn new(
        source: S,
        settings: CollectorSettings,
        params: SearchParams,
        builder: Arc<dyn RecordBuilder>,
        dedup: Option<Arc<dyn DedupStore>>,
        filter: Option<Arc<dyn RecordFilter>>,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self, FetchError> {
        params.validate().map_err(FetchError::Core)?;

        let max_results = params.max_results;
        let request = PageRequest {
            cursor: None,
            session_id: wire::generate_session_id(),
            collation_token: wire::generate_collation_token(),
            params,
        };

        let stats = CollectStats {
            started_at: Some(Utc::now()),
            ..CollectStats::default()
        };
        emit_isolated(
            sink.as_deref(),
            &LifecycleEvent::Started {
                query: request.params.query.clone(),
            },
        );

        Ok(Self {
            source,
            settings,
            builder,
            dedup,
            filter,
            sink,
            request,
            max_results,
            buffer: VecDeque::new(),
            to_mark: None,
            stats,
            inband_attempts: 0,
            exception_attempts: 0,
            need_page_delay: false,
            done: false,
            finished_emitted: false,
        })
    }

    /// Stats snapshot, valid during and after the search.
    pub fn stats(&self) -> CollectStats {
        self.stats.clone()
    }

    fn max_reached(&self) -> bool {
        self.max_results
            .is_some_and(|max| self.stats.records_collected as usize >= max)
    }

    fn finish(&mut self) {
        if self.finished_emitted {
            return;
        }
        self.finished_emitted = true;
        self.done = true;
        self.stats.finished_at = Some(Utc::now());
        emit_isolated(
            self.sink.as_deref(),
            &LifecycleEvent::Finished {
                stats: self.stats.clone(),
            },
        );
    }

    fn mark_pending_seen(&mut self) {
        if let (Some(id), Some(dedup)) = (self.to_mark.take(), self.dedup.as_deref()) {
            dedup.mark_seen(&id);
        }
    }

    fn take_next_from_buffer(&mut self) -> Option<AdRecord> {
        while let Some(raw) = self.buffer.pop_front() {
            if self.max_reached() {
                return None;
            }
            if let Some(record) = process_raw(
                &raw,
                self.builder.as_ref(),
                self.dedup.as_deref(),
                self.filter.as_deref(),
                &mut self.stats,
                self.sink.as_deref(),
            ) {
                return Some(record);
            }
        }
        None
    }

    /// Fetches pages until one is delivered into the buffer, the search
    /// ends quietly (`Ok(false)`), or an error exhausts the ceiling.
    async fn fetch_next_page(&mut self) -> Result<bool, FetchError> {
        loop {
            if self.need_page_delay {
                self.need_page_delay = false;
                tokio::time::sleep(self.settings.page_delay + jitter(self.settings.max_jitter))
                    .await;
            }

            self.stats.requests_made += 1;
            let payload = match self.source.fetch_page(&self.request).await {
                Ok(p) => p,
                Err(e) => {
                    self.exception_attempts += 1;
                    warn!(
                        attempt = self.exception_attempts,
                        error = %e,
                        "page fetch raised"
                    );
                    if self.exception_attempts >= self.settings.inband_retry_ceiling {
                        return Err(e);
                    }
                    tokio::time::sleep(exception_wait(self.exception_attempts)).await;
                    continue;
                }
            };
            self.exception_attempts = 0;

            self.inband_attempts += 1;
            match plan_class(classify_page(&payload), self.inband_attempts, &self.settings) {
                PagePlan::Wait { delay, event } => {
                    emit_isolated(self.sink.as_deref(), &event);
                    tokio::time::sleep(delay).await;
                }
                PagePlan::GiveUp { message } => {
                    warn!(%message, "ending search early");
                    self.stats.errors += 1;
                    emit_isolated(self.sink.as_deref(), &LifecycleEvent::Error { message });
                    return Ok(false);
                }
                PagePlan::Deliver { records, cursor } => {
                    self.inband_attempts = 0;
                    self.stats.pages_fetched += 1;
                    emit_isolated(
                        self.sink.as_deref(),
                        &LifecycleEvent::PageFetched {
                            page: self.stats.pages_fetched,
                            raw_count: records.len(),
                        },
                    );
                    self.buffer.extend(records);
                    match cursor {
                        Some(c) => {
                            self.request.cursor = Some(c);
                            self.need_page_delay = true;
                        }
                        None => self.done = true,
                    }
                    return Ok(true);
                }
            }
        }
    }

    /// Pulls the next record. Returns `None` when the search is over;
    /// a returned error ends the sequence.
    pub async fn next_record(&mut self) -> Option<Result<AdRecord, FetchError>> {
        // The previous record is marked seen only now, after the caller
        // consumed it. Abandoning the iterator leaves it unmarked.
        self.mark_pending_seen();

        loop {
            if self.max_reached() {
                self.finish();
                return None;
            }

            if let Some(record) = self.take_next_from_buffer() {
                self.stats.records_collected += 1;
                self.to_mark = Some(record.archive_id.clone());
                emit_isolated(
                    self.sink.as_deref(),
                    &LifecycleEvent::RecordCollected {
                        archive_id: record.archive_id.clone(),
                    },
                );
                return Some(Ok(record));
            }

            if self.done {
                self.finish();
                return None;
            }

            match self.fetch_next_page().await {
                Ok(true) => {}
                Ok(false) => {
                    self.finish();
                    return None;
                }
                Err(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }

    /// Drains the remaining sequence into a vector, stopping at the first
    /// raised error.
    pub async fn collect_all(&mut self) -> Result<Vec<AdRecord>, FetchError> {
        let mut out = Vec::new();
        while let Some(item) = self.next_record().await {
            out.push(item?);
        }
        Ok(out)
    }

    /// Adapts the collector into a [`futures::Stream`] of records.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<AdRecord, FetchError>> {
        futures::stream::unfold(self, |mut collector| async move {
            collector
                .next_record()
                .await
                .map(|item| (item, collector))
        })
    }
}

impl<S: PageSource> Drop for Collector<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adtrawl_core::DefaultRecordBuilder;
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedSource {
        pages: Vec<Result<Value, FetchError>>,
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&mut self, _req: &PageRequest) -> Result<Value, FetchError> {
            if self.pages.is_empty() {
                return Ok(json!({"ads": [], "page_info": {}}));
            }
            self.pages.remove(0)
        }
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            inband_retry_ceiling: 3,
            page_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
            session_expiry_wait: Duration::ZERO,
        }
    }

    fn collector(pages: Vec<Result<Value, FetchError>>) -> Collector<ScriptedSource> {
        Collector::new(
            ScriptedSource { pages },
            settings(),
            SearchParams::new("coffee"),
            Arc::new(DefaultRecordBuilder),
            None,
            None,
            None,
        )
        .unwrap()
    }

    fn page(ids: &[&str], cursor: Option<&str>) -> Value {
        json!({
            "ads": ids.iter().map(|id| json!({"ad_archive_id": id})).collect::<Vec<_>>(),
            "page_info": {
                "end_cursor": cursor,
                "has_next_page": cursor.is_some(),
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_pages_yield_all_records() {
        let mut c = collector(vec![
            Ok(page(&["1"], Some("next"))),
            Ok(page(&["2"], None)),
        ]);
        let records = c.collect_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let stats = c.stats();
        assert_eq!(stats.pages_fetched, 2);
        assert_eq!(stats.records_collected, 2);
        assert_eq!(stats.errors, 0);
        assert!(stats.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_params_rejected_before_network() {
        let result = Collector::new(
            ScriptedSource { pages: vec![] },
            settings(),
            SearchParams::new(""),
            Arc::new(DefaultRecordBuilder),
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(FetchError::Core(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_ceiling_ends_quietly() {
        let limited = json!({"ads": [], "page_info": {}, "rate_limited": true});
        let mut c = collector(vec![
            Ok(limited.clone()),
            Ok(limited.clone()),
            Ok(limited),
        ]);
        let records = c.collect_all().await.unwrap();
        assert!(records.is_empty());
        let stats = c.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.pages_fetched, 0);
        assert_eq!(stats.requests_made, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_record_is_isolated() {
        let mixed = json!({
            "ads": [
                {"ad_archive_id": "1"},
                {"broken": true},
                {"ad_archive_id": "2"}
            ],
            "page_info": {"has_next_page": false}
        });
        let mut c = collector(vec![Ok(mixed)]);
        let records = c.collect_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(c.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_exhausts_and_reraises() {
        let mut c = collector(vec![
            Err(FetchError::InvalidResponse("boom 1".to_string())),
            Err(FetchError::InvalidResponse("boom 2".to_string())),
            Err(FetchError::InvalidResponse("boom 3".to_string())),
        ]);
        let first = c.next_record().await;
        assert!(matches!(first, Some(Err(FetchError::InvalidResponse(_)))));
        // finished fired despite the error path
        assert!(c.stats().finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_results_cuts_page_short() {
        let mut c = Collector::new(
            ScriptedSource {
                pages: vec![Ok(page(&["1", "2", "3"], Some("next")))],
            },
            settings(),
            SearchParams::new("x").with_max_results(2),
            Arc::new(DefaultRecordBuilder),
            None,
            None,
            None,
        )
        .unwrap();
        let records = c.collect_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(c.stats().pages_fetched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_signal_retries_then_gives_up() {
        let expired = json!({"errors": [{"code": 1357001, "message": "session"}]});
        let mut c = collector(vec![Ok(expired.clone()), Ok(expired.clone()), Ok(expired)]);
        let records = c.collect_all().await.unwrap();
        assert!(records.is_empty());
        assert_eq!(c.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inband_recovery_resets_attempts() {
        let limited = json!({"rate_limited": true});
        let mut c = collector(vec![
            Ok(limited.clone()),
            Ok(page(&["1"], Some("next"))),
            Ok(limited),
            Ok(page(&["2"], None)),
        ]);
        let records = c.collect_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(c.stats().errors, 0);
        assert_eq!(c.stats().pages_fetched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_adapter_yields_all_records() {
        use futures::StreamExt;

        let c = collector(vec![
            Ok(page(&["1"], Some("c1"))),
            Ok(page(&["2"], None)),
        ]);
        let ids: Vec<String> = c
            .into_stream()
            .map(|item| item.map(|r| r.archive_id))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
