//! Client configuration.

use std::time::Duration;

/// Default base URL of the ad archive product.
pub const DEFAULT_BASE_URL: &str = "https://www.facebook.com";

/// Settings for session lifecycle, retries, and pacing.
///
/// All durations are per-call or per-wait budgets; a search has no
/// aggregate deadline.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the remote product.
    pub base_url: String,
    /// Per-call timeout applied to the underlying connection.
    pub timeout: Duration,
    /// Attempt ceiling for the request executor.
    pub max_retries: u32,
    /// Base delay for executor backoff (doubled per attempt).
    pub base_delay: Duration,
    /// Upper bound of uniform jitter added to every backoff wait.
    pub max_jitter: Duration,
    /// Sessions older than this are treated as stale.
    pub max_session_age: Duration,
    /// Consecutive refresh failures before the session is declared expired.
    pub max_refresh_failures: u32,
    /// Consecutive failures before a proxy is marked dead.
    pub proxy_max_failures: u32,
    /// How long a dead proxy stays excluded before automatic revival.
    pub proxy_cooldown: Duration,
    /// In-band retry ceiling for rate-limit and session-expiry signals.
    pub inband_retry_ceiling: u32,
    /// Delay between successfully fetched pages.
    pub page_delay: Duration,
    /// Fixed wait before retrying after an in-band session-expiry signal.
    pub session_expiry_wait: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_jitter: Duration::from_secs(1),
            max_session_age: Duration::from_secs(1800),
            max_refresh_failures: 3,
            proxy_max_failures: 3,
            proxy_cooldown: Duration::from_secs(300),
            inband_retry_ceiling: 3,
            page_delay: Duration::from_secs(2),
            session_expiry_wait: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Overrides the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the executor attempt ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overrides the maximum session age.
    pub fn with_max_session_age(mut self, age: Duration) -> Self {
        self.max_session_age = age;
        self
    }

    /// Overrides the in-band retry ceiling.
    pub fn with_inband_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.inband_retry_ceiling = ceiling;
        self
    }

    /// Overrides the inter-page delay.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_operating_policy() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.max_session_age, Duration::from_secs(1800));
        assert_eq!(cfg.max_refresh_failures, 3);
        assert_eq!(cfg.proxy_max_failures, 3);
        assert_eq!(cfg.proxy_cooldown, Duration::from_secs(300));
        assert_eq!(cfg.inband_retry_ceiling, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = ClientConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(1)
            .with_page_delay(Duration::ZERO);
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.page_delay, Duration::ZERO);
    }
}
