//! Session lifecycle: bootstrap, token extraction, staleness, refresh, and
//! the anti-automation challenge.
//!
//! The manager owns the connection context exclusively; nothing else may
//! tear it down or recreate it. All parsing and envelope construction is
//! delegated to [`crate::wire`] so the blocking flavor shares it verbatim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use adtrawl_core::{emit_isolated, LifecycleEvent, NotificationSink, SearchParams};

use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::executor::{execute_with_retry, RawResponse, RequestSpec};
use crate::pool::ProxyPool;
use crate::retry::BackoffPolicy;
use crate::transport::{Transport, CHALLENGE_ACK_COOKIE};
use crate::wire::{
    self, build_envelope, classify_page, parse_protocol_body, EnvelopeInputs, Operation,
    PageClass, TokenSet,
};

/// Landing path of the archive product; the bootstrap target.
pub const LANDING_PATH: &str = "/ads/library/";

/// Protocol endpoint all operations POST to.
pub const GRAPHQL_PATH: &str = "/api/graphql/";

/// Challenge attempts before bootstrap gives up.
const MAX_CHALLENGE_ATTEMPTS: u32 = 2;

// ============================================================================
// Session state (shared by both flavors)
// ============================================================================

/// Mutable session state: tokens, counters, and the staleness clock.
#[derive(Debug)]
pub struct SessionState {
    /// Tokens and operation identifiers from the last bootstrap.
    pub tokens: TokenSet,
    /// When the session was last initialized; `None` if never.
    pub initialized_at: Option<Instant>,
    /// Monotonically increasing per-session request counter.
    pub request_seq: u64,
    /// Consecutive failed refresh attempts.
    pub refresh_failures: u32,
    /// Short per-request tracking id, regenerated per session.
    pub tracking_id: String,
}

impl SessionState {
    /// Creates an uninitialized session.
    pub fn new() -> Self {
        Self {
            tokens: TokenSet::default(),
            initialized_at: None,
            request_seq: 0,
            refresh_failures: 0,
            tracking_id: wire::generate_tracking_id(),
        }
    }

    /// True once a bootstrap has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized_at.is_some()
    }

    /// True if never initialized or older than the maximum session age.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.initialized_at {
            None => true,
            Some(t) => t.elapsed() > max_age,
        }
    }

    /// Drops tokens, identifiers, and counters; keeps the refresh-failure
    /// count, which only a successful bootstrap resets.
    pub fn clear(&mut self) {
        self.tokens = TokenSet::default();
        self.initialized_at = None;
        self.request_seq = 0;
        self.tracking_id = wire::generate_tracking_id();
    }

    /// Increments and returns the request counter.
    pub fn next_seq(&mut self) -> u64 {
        self.request_seq += 1;
        self.request_seq
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies one bootstrap document to the session state.
///
/// The credential token is mandatory; its absence is an authentication
/// failure. Everything else degrades to fallbacks with a log line.
pub fn apply_bootstrap_document(state: &mut SessionState, body: &str) -> Result<(), FetchError> {
    let tokens = wire::extract_session_tokens(body);
    match tokens.lsd() {
        Some(t) if !t.is_empty() => {}
        _ => {
            return Err(FetchError::Authentication(
                "bootstrap document did not contain the credential token".to_string(),
            ));
        }
    }
    state.tokens = tokens;
    state.initialized_at = Some(Instant::now());
    state.refresh_failures = 0;
    Ok(())
}

/// Gate applied before any refresh attempt. Once the ceiling is hit, only
/// a successful bootstrap (through a new client) resets it.
pub fn check_refresh_allowed(state: &SessionState, ceiling: u32) -> Result<(), FetchError> {
    if state.refresh_failures >= ceiling {
        return Err(FetchError::SessionExpired(format!(
            "{} consecutive refresh failures",
            state.refresh_failures
        )));
    }
    Ok(())
}

/// Builds the envelope for one protocol call, consuming one sequence slot.
pub fn build_call_envelope(
    state: &mut SessionState,
    operation: Operation,
    variables: &Value,
) -> Result<Vec<(String, String)>, FetchError> {
    let seq = state.next_seq();
    let variables = serde_json::to_string(variables)?;
    Ok(build_envelope(&EnvelopeInputs {
        seq,
        tracking_id: &state.tracking_id,
        tokens: &state.tokens,
        operation,
        variables,
    }))
}

/// Variables object for one search page, matching the server's key set.
pub fn variables_for_search(
    params: &SearchParams,
    cursor: Option<&str>,
    session_id: &str,
    collation_token: &str,
) -> Value {
    json!({
        "activeStatus": if params.active_only { "ACTIVE" } else { "ALL" },
        "adType": "ALL",
        "countries": [params.country],
        "cursor": cursor,
        "first": params.limit,
        "queryString": params.query,
        "sessionID": session_id,
        "collationToken": collation_token,
    })
}

/// Variables object for a typeahead lookup.
pub fn variables_for_typeahead(query: &str, country: &str) -> Value {
    json!({ "queryString": query, "country": country })
}

/// Variables object for a single-ad detail lookup.
pub fn variables_for_detail(archive_id: &str) -> Value {
    json!({ "adArchiveID": archive_id })
}

/// Continuation cursor of a parsed payload, if any.
pub fn cursor_of(payload: &Value) -> Option<String> {
    match classify_page(payload) {
        PageClass::Page { cursor, .. } => cursor,
        _ => None,
    }
}

// ============================================================================
// Page source seam
// ============================================================================

/// One page request within a search. The session and collation identifiers
/// are generated once per search and never change across its pages.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Search parameters.
    pub params: SearchParams,
    /// Continuation cursor; `None` before the first page.
    pub cursor: Option<String>,
    /// Per-search session identifier.
    pub session_id: String,
    /// Per-search collation token.
    pub collation_token: String,
}

/// Source of raw page payloads; implemented by the session manager and by
/// test doubles.
#[async_trait]
pub trait PageSource: Send {
    /// Fetches one raw page payload for the request.
    async fn fetch_page(&mut self, req: &PageRequest) -> Result<Value, FetchError>;
}

#[async_trait]
impl<S: PageSource + ?Sized> PageSource for &mut S {
    async fn fetch_page(&mut self, req: &PageRequest) -> Result<Value, FetchError> {
        (**self).fetch_page(req).await
    }
}

// ============================================================================
// Session manager
// ============================================================================

/// Async session manager: produces and maintains the opaque credentials a
/// protocol call needs, and survives their expiry.
pub struct SessionManager {
    config: ClientConfig,
    policy: BackoffPolicy,
    transport: Option<Transport>,
    pool: Option<Arc<ProxyPool>>,
    sink: Option<Arc<dyn NotificationSink>>,
    state: SessionState,
}

impl SessionManager {
    /// Creates an uninitialized manager. The connection context is created
    /// lazily on first use.
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

    /// Read access to the session state, mainly for inspection.
    pub fn state(&self) -> &SessionState {
        &self.state
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
            self.transport = Some(Transport::new(&self.config.base_url, self.config.timeout, proxy)?);
        }
        Ok(())
    }

    async fn execute(&mut self, spec: &RequestSpec) -> Result<RawResponse, FetchError> {
        self.ensure_transport()?;
        let pool = self.pool.clone();
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| FetchError::InvalidResponse("transport unavailable".to_string()))?;
        execute_with_retry(transport, pool.as_deref(), &self.policy, spec).await
    }

    /// Fetches the landing document and populates the session tokens,
    /// solving the anti-automation challenge when presented.
    #[instrument(skip(self))]
    pub async fn bootstrap(&mut self) -> Result<(), FetchError> {
        let spec = RequestSpec::Get {
            path: LANDING_PATH.to_string(),
        };
        let mut challenge_attempts = 0u32;
        loop {
            let resp = self.execute(&spec).await?;

            if let Some(path) = wire::detect_challenge(&resp.body) {
                if challenge_attempts >= MAX_CHALLENGE_ATTEMPTS {
                    return Err(FetchError::Authentication(
                        "verification challenge persisted after retries".to_string(),
                    ));
                }
                challenge_attempts += 1;
                info!(attempt = challenge_attempts, "verification challenge presented");
                self.solve_challenge(&path).await?;
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

    /// Answers the scripted verification step with the same session
    /// cookies. A missing acknowledgement cookie is a soft failure; the
    /// server sometimes unblocks the session without setting it.
    async fn solve_challenge(&mut self, path: &str) -> Result<(), FetchError> {
        let spec = RequestSpec::PostForm {
            path: path.to_string(),
            fields: Vec::new(),
        };
        let resp = self.execute(&spec).await?;
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
    pub async fn refresh(&mut self) -> Result<(), FetchError> {
        check_refresh_allowed(&self.state, self.config.max_refresh_failures)?;

        let proxy = self.next_proxy()?;
        self.transport = Some(Transport::new(&self.config.base_url, self.config.timeout, proxy)?);
        self.state.clear();

        match self.bootstrap().await {
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
    pub async fn ensure_ready(&mut self) -> Result<(), FetchError> {
        if !self.state.is_initialized() {
            self.bootstrap().await
        } else if self.is_stale() {
            debug!("session stale, refreshing");
            self.refresh().await
        } else {
            Ok(())
        }
    }

    /// Issues one protocol operation and parses the response.
    ///
    /// HTTP 403 here is read as a probable session expiry: it triggers
    /// exactly one refresh and one retry, never a loop.
    pub async fn call_operation(
        &mut self,
        operation: Operation,
        variables: &Value,
    ) -> Result<Value, FetchError> {
        self.ensure_ready().await?;

        let fields = build_call_envelope(&mut self.state, operation, variables)?;
        let spec = RequestSpec::PostForm {
            path: GRAPHQL_PATH.to_string(),
            fields,
        };
        let mut resp = self.execute(&spec).await?;

        if resp.status == reqwest::StatusCode::FORBIDDEN {
            info!("HTTP 403 on operation call, refreshing session once");
            self.refresh().await?;
            let fields = build_call_envelope(&mut self.state, operation, variables)?;
            let spec = RequestSpec::PostForm {
                path: GRAPHQL_PATH.to_string(),
                fields,
            };
            resp = self.execute(&spec).await?;
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

    /// Fetches one search page. Returns the parsed payload and the
    /// continuation cursor, `None` on the terminal page.
    pub async fn search_page(
        &mut self,
        params: &SearchParams,
        cursor: Option<&str>,
        session_id: &str,
        collation_token: &str,
    ) -> Result<(Value, Option<String>), FetchError> {
        let variables = variables_for_search(params, cursor, session_id, collation_token);
        let payload = self.call_operation(Operation::Search, &variables).await?;
        let next = cursor_of(&payload);
        Ok((payload, next))
    }

    /// Typeahead suggestions for a partial query.
    pub async fn typeahead(
        &mut self,
        query: &str,
        country: &str,
    ) -> Result<(Value, Option<String>), FetchError> {
        let variables = variables_for_typeahead(query, country);
        let payload = self.call_operation(Operation::Typeahead, &variables).await?;
        let next = cursor_of(&payload);
        Ok((payload, next))
    }

    /// Detail lookup for one archived ad.
    pub async fn ad_detail(&mut self, archive_id: &str) -> Result<(Value, Option<String>), FetchError> {
        let variables = variables_for_detail(archive_id);
        let payload = self.call_operation(Operation::Detail, &variables).await?;
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

#[async_trait]
impl PageSource for SessionManager {
    async fn fetch_page(&mut self, req: &PageRequest) -> Result<Value, FetchError> {
        let variables = variables_for_search(
            &req.params,
            req.cursor.as_deref(),
            &req.session_id,
            &req.collation_token,
        );
        self.call_operation(Operation::Search, &variables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_session_is_stale() {
        let state = SessionState::new();
        assert!(state.is_stale(Duration::from_secs(1800)));
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_fresh_session_is_not_stale() {
        let mut state = SessionState::new();
        apply_bootstrap_document(
            &mut state,
            r#"["LSD",[],{"token":"tok123"}]"#,
        )
        .unwrap();
        assert!(state.is_initialized());
        assert!(!state.is_stale(Duration::from_secs(1800)));
    }

    #[test]
    fn test_old_session_is_stale() {
        let mut state = SessionState::new();
        state.initialized_at = Some(Instant::now() - Duration::from_secs(3600));
        assert!(state.is_stale(Duration::from_secs(1800)));
        assert!(!state.is_stale(Duration::from_secs(7200)));
    }

    #[test]
    fn test_bootstrap_without_token_is_auth_failure() {
        let mut state = SessionState::new();
        let err = apply_bootstrap_document(&mut state, "<html>nothing here</html>");
        assert!(matches!(err, Err(FetchError::Authentication(_))));
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_bootstrap_resets_refresh_failures() {
        let mut state = SessionState::new();
        state.refresh_failures = 2;
        apply_bootstrap_document(&mut state, r#"["LSD",[],{"token":"t"}]"#).unwrap();
        assert_eq!(state.refresh_failures, 0);
    }

    #[test]
    fn test_refresh_ceiling() {
        let mut state = SessionState::new();
        state.refresh_failures = 2;
        assert!(check_refresh_allowed(&state, 3).is_ok());
        state.refresh_failures = 3;
        assert!(matches!(
            check_refresh_allowed(&state, 3),
            Err(FetchError::SessionExpired(_))
        ));
    }

    #[test]
    fn test_clear_keeps_refresh_failures() {
        let mut state = SessionState::new();
        state.refresh_failures = 2;
        state.request_seq = 10;
        state.clear();
        assert_eq!(state.refresh_failures, 2);
        assert_eq!(state.request_seq, 0);
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_seq_counter_increments_per_call() {
        let mut state = SessionState::new();
        state.tokens.tokens.insert("lsd".to_string(), "t".to_string());
        let v = json!({});
        let f1 = build_call_envelope(&mut state, Operation::Search, &v).unwrap();
        let f2 = build_call_envelope(&mut state, Operation::Search, &v).unwrap();
        let req_of = |f: &Vec<(String, String)>| {
            f.iter()
                .find(|(k, _)| k == "__req")
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(req_of(&f1), "1");
        assert_eq!(req_of(&f2), "2");
        assert_eq!(state.request_seq, 2);
    }

    #[test]
    fn test_search_variables_hold_correlation_ids() {
        let params = SearchParams::new("coffee").with_country("DE");
        let v = variables_for_search(&params, Some("cur"), "sid", "ctok");
        assert_eq!(v["sessionID"], "sid");
        assert_eq!(v["collationToken"], "ctok");
        assert_eq!(v["cursor"], "cur");
        assert_eq!(v["countries"][0], "DE");
        assert_eq!(v["activeStatus"], "ALL");
        let first_page = variables_for_search(&params, None, "sid", "ctok");
        assert!(first_page["cursor"].is_null());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut mgr = SessionManager::new(ClientConfig::default(), None, None);
        mgr.close();
        mgr.close();
        assert!(!mgr.is_initialized());
    }
}
