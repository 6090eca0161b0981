//! Blocking flavor of the session and collection layer.
//!
//! Decision logic is identical to the async flavor by construction: token
//! extraction, envelope building, response classification, and the
//! page/record step planning all live in [`crate::wire`],
//! [`crate::session`], and [`crate::collector`] and are called from here
//! unchanged. Only the I/O substrate differs: `reqwest::blocking` and
//! `std::thread::sleep` instead of tokio.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use adtrawl_core::{
    emit_isolated, AdRecord, CollectStats, DedupStore, DefaultRecordBuilder, LifecycleEvent,
    NotificationSink, RecordBuilder, RecordFilter, SearchParams,
};

use crate::collector::{plan_class, process_raw, CollectorSettings, PagePlan};
use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::executor::{execute_with_retry_blocking, RawResponse, RequestSpec};
use crate::pool::ProxyPool;
use crate::retry::{exception_wait, jitter, BackoffPolicy};
use crate::session::{
    apply_bootstrap_document, build_call_envelope, check_refresh_allowed, cursor_of,
    variables_for_detail, variables_for_search, variables_for_typeahead, PageRequest,
    SessionState, GRAPHQL_PATH, LANDING_PATH,
};
use crate::transport::{BlockingTransport, CHALLENGE_ACK_COOKIE};
use crate::wire::{self, classify_page, parse_protocol_body, Operation};

/// Challenge attempts before bootstrap gives up.
const MAX_CHALLENGE_ATTEMPTS: u32 = 2;

// ============================================================================
// Blocking page source
// ============================================================================

/// Blocking source of raw page payloads.
pub trait BlockingPageSource {
    /// Fetches one raw page payload for the request.
    fn fetch_page(&mut self, req: &PageRequest) -> Result<Value, FetchError>;
}

impl<S: BlockingPageSource + ?Sized> BlockingPageSource for &mut S {
    fn fetch_page(&mut self, req: &PageRequest) -> Result<Value, FetchError> {
        (**self).fetch_page(req)
    }
}

// ============================================================================
// Blocking session manager
// ============================================================================

/// Blocking twin of [`crate::session::SessionManager`].
pub struct BlockingSessionManager {
    config: ClientConfig,
    policy: BackoffPolicy,
    transport: Option<BlockingTransport>,
    pool: Option<Arc<ProxyPool>>,
    sink: Option<Arc<dyn NotificationSink>>,
    state: SessionState,
}

impl BlockingSessionManager {
    /// Creates an uninitialized manager.
    pub fn new(
        config: ClientConfig,
        pool: Option<Arc<ProxyPool>>,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        let policy = BackoffPolicy::new(config.max_retries, config.base_delay, config.max_jitter);
        Self {
            config,
            policy,
            transport: None,
            pool,
            sink,
            state: SessionState::new(),
        }
    }

    /// True once a bootstrap has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state.is_initialized()
    }

    /// True if the session must be refreshed before further use.
    pub fn is_stale(&self) -> bool {
        self.state.is_stale(self.config.max_session_age)
    }

    fn next_proxy(&self) -> Result<Option<String>, FetchError> {
        match &self.pool {
            Some(pool) => Ok(Some(pool.get_next()?)),
            None => Ok(None),
        }
    }

    fn ensure_transport(&mut self) -> Result<(), FetchError> {
        if self.transport.is_none() {
            let proxy = self.next_proxy()?;
            self.transport = Some(BlockingTransport::new(
                &self.config.base_url,
                self.config.timeout,
                proxy,
            )?);
        }
        Ok(())
    }

    fn execute(&mut self, spec: &RequestSpec) -> Result<RawResponse, FetchError> {
        self.ensure_transport()?;
        let pool = self.pool.clone();
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| FetchError::InvalidResponse("transport unavailable".to_string()))?;
        execute_with_retry_blocking(transport, pool.as_deref(), &self.policy, spec)
    }

    /// Fetches the landing document and populates the session tokens,
    /// solving the anti-automation challenge when presented.
    #[instrument(skip(self))]
    pub fn bootstrap(&mut self) -> Result<(), FetchError> {
        let spec = RequestSpec::Get {
            path: LANDING_PATH.to_string(),
        };
        let mut challenge_attempts = 0u32;
        loop {
            let resp = self.execute(&spec)?;

            if let Some(path) = wire::detect_challenge(&resp.body) {
                if challenge_attempts >= MAX_CHALLENGE_ATTEMPTS {
                    return Err(FetchError::Authentication(
                        "verification challenge persisted after retries".to_string(),
                    ));
                }
                challenge_attempts += 1;
                info!(attempt = challenge_attempts, "verification challenge presented");
                self.solve_challenge(&path)?;
                continue;
            }

            if !resp.status.is_success() {
                return Err(FetchError::Authentication(format!(
                    "bootstrap fetch returned HTTP {}",
                    resp.status
                )));
            }

            apply_bootstrap_document(&mut self.state, &resp.body)?;
            info!("session initialized");
            return Ok(());
        }
    }

    fn solve_challenge(&mut self, path: &str) -> Result<(), FetchError> {
        let spec = RequestSpec::PostForm {
            path: path.to_string(),
            fields: Vec::new(),
        };
        let resp = self.execute(&spec)?;
        debug!(status = %resp.status, "challenge response submitted");

        let acknowledged = self
            .transport
            .as_ref()
            .is_some_and(|t| t.has_cookie(CHALLENGE_ACK_COOKIE));
        if !acknowledged {
            warn!("challenge acknowledgement cookie not set, proceeding optimistically");
        }
        Ok(())
    }

    /// Tears down and recreates the connection context, then re-runs
    /// bootstrap. Gated by the refresh-failure ceiling.
    #[instrument(skip(self))]
    pub fn refresh(&mut self) -> Result<(), FetchError> {
        check_refresh_allowed(&self.state, self.config.max_refresh_failures)?;

        let proxy = self.next_proxy()?;
        self.transport = Some(BlockingTransport::new(
            &self.config.base_url,
            self.config.timeout,
            proxy,
        )?);
        self.state.clear();

        match self.bootstrap() {
            Ok(()) => {
                emit_isolated(self.sink.as_deref(), &LifecycleEvent::SessionRefreshed);
                Ok(())
            }
            Err(e) => {
                self.state.refresh_failures += 1;
                warn!(failures = self.state.refresh_failures, error = %e, "session refresh failed");
                Err(e)
            }
        }
    }

    /// Ensures a usable session: bootstraps if uninitialized, refreshes if
    /// stale.
    pub fn ensure_ready(&mut self) -> Result<(), FetchError> {
        if !self.state.is_initialized() {
            self.bootstrap()
        } else if self.is_stale() {
            debug!("session stale, refreshing");
            self.refresh()
        } else {
            Ok(())
        }
    }

    /// Issues one protocol operation; HTTP 403 triggers exactly one
    /// refresh and one retry.
    pub fn call_operation(
        &mut self,
        operation: Operation,
        variables: &Value,
    ) -> Result<Value, FetchError> {
        self.ensure_ready()?;

        let fields = build_call_envelope(&mut self.state, operation, variables)?;
        let spec = RequestSpec::PostForm {
            path: GRAPHQL_PATH.to_string(),
            fields,
        };
        let mut resp = self.execute(&spec)?;

        if resp.status == reqwest::StatusCode::FORBIDDEN {
            info!("HTTP 403 on operation call, refreshing session once");
            self.refresh()?;
            let fields = build_call_envelope(&mut self.state, operation, variables)?;
            let spec = RequestSpec::PostForm {
                path: GRAPHQL_PATH.to_string(),
                fields,
            };
            resp = self.execute(&spec)?;
        }

        if !resp.status.is_success() {
            return Err(FetchError::InvalidResponse(format!(
                "operation {} returned HTTP {}",
                operation.friendly_name(),
                resp.status
            )));
        }

        Ok(parse_protocol_body(&resp.body)?)
    }

    /// Fetches one search page, returning the payload and continuation
    /// cursor.
    pub fn search_page(
        &mut self,
        params: &SearchParams,
        cursor: Option<&str>,
        session_id: &str,
        collation_token: &str,
    ) -> Result<(Value, Option<String>), FetchError> {
        let variables = variables_for_search(params, cursor, session_id, collation_token);
        let payload = self.call_operation(Operation::Search, &variables)?;
        let next = cursor_of(&payload);
        Ok((payload, next))
    }

    /// Typeahead suggestions for a partial query.
    pub fn typeahead(
        &mut self,
        query: &str,
        country: &str,
    ) -> Result<(Value, Option<String>), FetchError> {
        let variables = variables_for_typeahead(query, country);
        let payload = self.call_operation(Operation::Typeahead, &variables)?;
        let next = cursor_of(&payload);
        Ok((payload, next))
    }

    /// Detail lookup for one archived ad.
    pub fn ad_detail(&mut self, archive_id: &str) -> Result<(Value, Option<String>), FetchError> {
        let variables = variables_for_detail(archive_id);
        let payload = self.call_operation(Operation::Detail, &variables)?;
        let next = cursor_of(&payload);
        Ok((payload, next))
    }

    /// Releases the connection context and marks the session
    /// uninitialized. Safe to call multiple times.
    pub fn close(&mut self) {
        self.transport = None;
        self.state.clear();
    }
}

impl BlockingPageSource for BlockingSessionManager {
    fn fetch_page(&mut self, req: &PageRequest) -> Result<Value, FetchError> {
        let variables = variables_for_search(
            &req.params,
            req.cursor.as_deref(),
            &req.session_id,
            &req.collation_token,
        );
        self.call_operation(Operation::Search, &variables)
    }
}

// ============================================================================
// Blocking collector
// ============================================================================

/// Blocking twin of [`crate::collector::Collector`]; an [`Iterator`] over
/// collected records.
pub struct BlockingCollector<S: BlockingPageSource> {
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

impl<S: BlockingPageSource> BlockingCollector<S> {
    /// Starts a search over the given page source.
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

    fn fetch_next_page(&mut self) -> Result<bool, FetchError> {
        loop {
            if self.need_page_delay {
                self.need_page_delay = false;
                std::thread::sleep(self.settings.page_delay + jitter(self.settings.max_jitter));
            }

            self.stats.requests_made += 1;
            let payload = match self.source.fetch_page(&self.request) {
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
                    std::thread::sleep(exception_wait(self.exception_attempts));
                    continue;
                }
            };
            self.exception_attempts = 0;

            self.inband_attempts += 1;
            match plan_class(classify_page(&payload), self.inband_attempts, &self.settings) {
                PagePlan::Wait { delay, event } => {
                    emit_isolated(self.sink.as_deref(), &event);
                    std::thread::sleep(delay);
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
}

impl<S: BlockingPageSource> Iterator for BlockingCollector<S> {
    type Item = Result<AdRecord, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
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

            match self.fetch_next_page() {
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
}

impl<S: BlockingPageSource> Drop for BlockingCollector<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ============================================================================
// Blocking client
// ============================================================================

/// Blocking client over the ad archive. One instance serves one logical
/// search at a time; parallel searches need separate instances.
pub struct BlockingAdClient {
    config: ClientConfig,
    pool: Option<Arc<ProxyPool>>,
    session: BlockingSessionManager,
    builder: Arc<dyn RecordBuilder>,
    dedup: Option<Arc<dyn DedupStore>>,
    filter: Option<Arc<dyn RecordFilter>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl BlockingAdClient {
    /// Creates a client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a client with the given configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        let session = BlockingSessionManager::new(config.clone(), None, None);
        Self {
            config,
            pool: None,
            session,
            builder: Arc::new(DefaultRecordBuilder),
            dedup: None,
            filter: None,
            sink: None,
        }
    }

    /// Attaches an outbound identity pool.
    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self.rebuild_session();
        self
    }

    /// Attaches a notification sink.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self.rebuild_session();
        self
    }

    fn rebuild_session(&mut self) {
        self.session = BlockingSessionManager::new(
            self.config.clone(),
            self.pool.clone(),
            self.sink.clone(),
        );
    }

    /// Attaches a deduplication store.
    pub fn with_dedup(mut self, dedup: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Attaches a record filter.
    pub fn with_filter(mut self, filter: Arc<dyn RecordFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Replaces the record builder.
    pub fn with_builder(mut self, builder: Arc<dyn RecordBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Direct access to the session surface.
    pub fn session(&mut self) -> &mut BlockingSessionManager {
        &mut self.session
    }

    /// Starts a lazy search; records are pulled through the returned
    /// iterator.
    pub fn search(
        &mut self,
        params: SearchParams,
    ) -> Result<BlockingCollector<&mut BlockingSessionManager>, FetchError> {
        BlockingCollector::new(
            &mut self.session,
            CollectorSettings::from(&self.config),
            params,
            Arc::clone(&self.builder),
            self.dedup.clone(),
            self.filter.clone(),
            self.sink.clone(),
        )
    }

    /// Typeahead suggestions for a partial query.
    pub fn typeahead(&mut self, query: &str, country: &str) -> Result<Value, FetchError> {
        let (payload, _) = self.session.typeahead(query, country)?;
        Ok(payload)
    }

    /// Detail lookup for one archived ad.
    pub fn ad_detail(&mut self, archive_id: &str) -> Result<Value, FetchError> {
        let (payload, _) = self.session.ad_detail(archive_id)?;
        Ok(payload)
    }

    /// Releases the connection context. Safe to call multiple times.
    pub fn close(&mut self) {
        self.session.close();
    }
}

impl Default for BlockingAdClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct ScriptedSource {
        pages: Vec<Result<Value, FetchError>>,
    }

    impl BlockingPageSource for ScriptedSource {
        fn fetch_page(&mut self, _req: &PageRequest) -> Result<Value, FetchError> {
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

    #[test]
    fn test_blocking_collector_iterates_pages() {
        let pages = vec![
            Ok(json!({
                "ads": [{"ad_archive_id": "1"}],
                "page_info": {"end_cursor": "c1", "has_next_page": true}
            })),
            Ok(json!({
                "ads": [{"ad_archive_id": "2"}],
                "page_info": {"has_next_page": false}
            })),
        ];
        let collector = BlockingCollector::new(
            ScriptedSource { pages },
            settings(),
            SearchParams::new("coffee"),
            Arc::new(DefaultRecordBuilder),
            None,
            None,
            None,
        )
        .unwrap();
        let records: Vec<_> = collector.map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].archive_id, "1");
        assert_eq!(records[1].archive_id, "2");
    }

    #[test]
    fn test_blocking_collector_dedup_marks_after_yield() {
        let dedup = Arc::new(adtrawl_core::MemoryDedupStore::new());
        let pages = vec![Ok(json!({
            "ads": [{"ad_archive_id": "a"}, {"ad_archive_id": "b"}],
            "page_info": {"has_next_page": false}
        }))];
        let mut collector = BlockingCollector::new(
            ScriptedSource { pages },
            settings(),
            SearchParams::new("q"),
            Arc::new(DefaultRecordBuilder),
            Some(dedup.clone() as Arc<dyn DedupStore>),
            None,
            None,
        )
        .unwrap();

        let first = collector.next().unwrap().unwrap();
        assert_eq!(first.archive_id, "a");
        // not yet marked: marking happens on the next pull
        assert!(!dedup.has_seen("a"));
        let second = collector.next().unwrap().unwrap();
        assert_eq!(second.archive_id, "b");
        assert!(dedup.has_seen("a"));
        // abandon mid-stream: "b" stays unmarked
        drop(collector);
        assert!(!dedup.has_seen("b"));
    }

    #[test]
    fn test_blocking_client_close_idempotent() {
        let mut client = BlockingAdClient::new();
        client.close();
        client.close();
    }
}
