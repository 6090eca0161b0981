//! Retrying request execution with outbound-identity bookkeeping.
//!
//! The executor is agnostic to which protocol operation it carries: it
//! rotates identities per attempt, backs off on HTTP 429 and on
//! connection-level failures, and returns every other outcome to the
//! caller untouched. Session-expiry interception (HTTP 403) is not handled
//! here; that belongs to the protocol call site.

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::pool::ProxyPool;
use crate::retry::BackoffPolicy;
use crate::transport::{BlockingTransport, Transport};

/// One HTTP call, independent of substrate.
#[derive(Debug, Clone)]
pub enum RequestSpec {
    /// GET the given path.
    Get {
        /// Path relative to the base URL.
        path: String,
    },
    /// POST an ordered form to the given path.
    PostForm {
        /// Path relative to the base URL.
        path: String,
        /// Ordered form fields.
        fields: Vec<(String, String)>,
    },
}

/// Status and body of one completed HTTP exchange.
#[derive(Debug)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Full response body.
    pub body: String,
}

/// True if the connection must be rebuilt for the selected identity.
fn needs_rebind(bound: Option<&str>, next: &str) -> bool {
    bound != Some(next)
}

fn exhausted(last_transient: Option<FetchError>) -> FetchError {
    last_transient
        .unwrap_or_else(|| FetchError::InvalidResponse("retry attempts exhausted".to_string()))
}

/// Selects the next identity and rebinds the transport if it changed.
/// Returns the identity bound for this attempt.
fn select_identity_async(
    transport: &mut Transport,
    pool: Option<&ProxyPool>,
) -> Result<Option<String>, FetchError> {
    let Some(pool) = pool else {
        return Ok(transport.bound_proxy().map(str::to_string));
    };
    let next = pool.get_next()?;
    if needs_rebind(transport.bound_proxy(), &next) {
        debug!(proxy = %next, "rebinding connection to next identity");
        transport.rebind(Some(next.clone()))?;
    }
    Ok(Some(next))
}

fn select_identity_blocking(
    transport: &mut BlockingTransport,
    pool: Option<&ProxyPool>,
) -> Result<Option<String>, FetchError> {
    let Some(pool) = pool else {
        return Ok(transport.bound_proxy().map(str::to_string));
    };
    let next = pool.get_next()?;
    if needs_rebind(transport.bound_proxy(), &next) {
        debug!(proxy = %next, "rebinding connection to next identity");
        transport.rebind(Some(next.clone()))?;
    }
    Ok(Some(next))
}

fn record_outcome(pool: Option<&ProxyPool>, identity: Option<&str>, success: bool) {
    if let (Some(pool), Some(identity)) = (pool, identity) {
        if success {
            pool.mark_success(identity);
        } else {
            pool.mark_failure(identity);
        }
    }
}

/// Performs one logical HTTP call with retry, backoff, and identity
/// rotation.
pub async fn execute_with_retry(
    transport: &mut Transport,
    pool: Option<&ProxyPool>,
    policy: &BackoffPolicy,
    spec: &RequestSpec,
) -> Result<RawResponse, FetchError> {
    let mut last_transient: Option<FetchError> = None;

    for attempt in 0..policy.max_retries {
        let identity = select_identity_async(transport, pool)?;

        let result = match spec {
            RequestSpec::Get { path } => transport.get(path).await,
            RequestSpec::PostForm { path, fields } => transport.post_form(path, fields).await,
        };

        match result {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    record_outcome(pool, identity.as_deref(), false);
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(attempt, delay = ?delay, "HTTP 429, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                record_outcome(pool, identity.as_deref(), true);
                let body = resp.text().await?;
                return Ok(RawResponse { status, body });
            }
            Err(e) if e.is_transient() => {
                record_outcome(pool, identity.as_deref(), false);
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, error = %e, delay = ?delay, "transient network failure, retrying");
                last_transient = Some(e);
                if attempt + 1 < policy.max_retries {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                record_outcome(pool, identity.as_deref(), false);
                return Err(e);
            }
        }
    }

    Err(exhausted(last_transient))
}

/// Blocking twin of [`execute_with_retry`]; same decisions, thread-blocking
/// waits.
pub fn execute_with_retry_blocking(
    transport: &mut BlockingTransport,
    pool: Option<&ProxyPool>,
    policy: &BackoffPolicy,
    spec: &RequestSpec,
) -> Result<RawResponse, FetchError> {
    let mut last_transient: Option<FetchError> = None;

    for attempt in 0..policy.max_retries {
        let identity = select_identity_blocking(transport, pool)?;

        let result = match spec {
            RequestSpec::Get { path } => transport.get(path),
            RequestSpec::PostForm { path, fields } => transport.post_form(path, fields),
        };

        match result {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    record_outcome(pool, identity.as_deref(), false);
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(attempt, delay = ?delay, "HTTP 429, backing off");
                    std::thread::sleep(delay);
                    continue;
                }
                record_outcome(pool, identity.as_deref(), true);
                let body = resp.text().map_err(FetchError::Http)?;
                return Ok(RawResponse { status, body });
            }
            Err(e) if e.is_transient() => {
                record_outcome(pool, identity.as_deref(), false);
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, error = %e, delay = ?delay, "transient network failure, retrying");
                last_transient = Some(e);
                if attempt + 1 < policy.max_retries {
                    std::thread::sleep(delay);
                }
            }
            Err(e) => {
                record_outcome(pool, identity.as_deref(), false);
                return Err(e);
            }
        }
    }

    Err(exhausted(last_transient))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_rebind() {
        assert!(needs_rebind(None, "http://a:1"));
        assert!(needs_rebind(Some("http://a:1"), "http://b:2"));
        assert!(!needs_rebind(Some("http://a:1"), "http://a:1"));
    }

    #[test]
    fn test_exhausted_prefers_last_network_error() {
        let generic = exhausted(None);
        assert!(matches!(generic, FetchError::InvalidResponse(_)));
    }

    #[test]
    fn test_record_outcome_updates_pool() {
        let pool = ProxyPool::with_policy(&["1.2.3.4:8080"], 1, std::time::Duration::from_secs(300))
            .unwrap();
        record_outcome(Some(&pool), Some("http://1.2.3.4:8080"), false);
        assert!(pool.alive_proxies().is_empty());
        record_outcome(Some(&pool), Some("http://1.2.3.4:8080"), true);
        assert_eq!(pool.alive_proxies().len(), 1);
    }
}
