//! Outbound identity pool: proxy rotation, health tracking, and
//! cooldown-based revival.
//!
//! The pool is the one shared piece of the client: failure counters and the
//! round-robin cursor sit behind a mutex and are safe to update from
//! concurrent callers. Exact round-robin fairness under contention is
//! best-effort.

use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Default consecutive failures before an identity is marked dead.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Default cooldown before a dead identity is revived on read.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct ProxyEntry {
    url: String,
    failures: u32,
    dead_since: Option<Instant>,
}

impl ProxyEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            failures: 0,
            dead_since: None,
        }
    }

    fn is_alive(&self, cooldown: Duration) -> bool {
        match self.dead_since {
            None => true,
            Some(t) => t.elapsed() >= cooldown,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    entries: Vec<ProxyEntry>,
    cursor: usize,
}

/// Round-robin pool of outbound identities with automatic exclusion and
/// revival of unhealthy entries.
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    max_failures: u32,
    cooldown: Duration,
}

/// Normalizes one raw identity string to a scheme URL.
///
/// Accepts bare `host:port`, `host:port:user:pass`, or an already
/// qualified URL.
fn normalize(raw: &str) -> Result<String, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FetchError::Proxy("empty proxy entry".to_string()));
    }
    if raw.contains("://") {
        url::Url::parse(raw)
            .map_err(|e| FetchError::Proxy(format!("unparseable proxy URL {raw:?}: {e}")))?;
        return Ok(raw.to_string());
    }
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [host, port] => Ok(format!("http://{host}:{port}")),
        [host, port, user, pass] => Ok(format!("http://{user}:{pass}@{host}:{port}")),
        _ => Err(FetchError::Proxy(format!(
            "unparseable proxy entry {raw:?} (expected host:port or host:port:user:pass)"
        ))),
    }
}

impl ProxyPool {
    /// Builds a pool from raw identity strings.
    pub fn new<S: AsRef<str>>(raw: &[S]) -> Result<Self, FetchError> {
        Self::with_policy(raw, DEFAULT_MAX_FAILURES, DEFAULT_COOLDOWN)
    }

    /// Builds a pool with explicit failure threshold and cooldown.
    pub fn with_policy<S: AsRef<str>>(
        raw: &[S],
        max_failures: u32,
        cooldown: Duration,
    ) -> Result<Self, FetchError> {
        if raw.is_empty() {
            return Err(FetchError::Proxy("proxy list is empty".to_string()));
        }
        let entries = raw
            .iter()
            .map(|s| normalize(s.as_ref()).map(ProxyEntry::new))
            .collect::<Result<Vec<_>, _>>()?;
        info!(count = entries.len(), "proxy pool initialized");
        Ok(Self {
            state: Mutex::new(PoolState { entries, cursor: 0 }),
            max_failures,
            cooldown,
        })
    }

    /// Loads a pool from a file, one identity per line. Blank lines and
    /// `#` comments are ignored.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        Self::new(&lines)
    }

    /// Returns the next alive identity in round-robin order over the
    /// currently alive subset. A dead identity whose cooldown has elapsed
    /// is revived by this read: its dead marker and failure counter are
    /// cleared so a later run of failures counts from zero again.
    pub fn get_next(&self) -> Result<String, FetchError> {
        let mut state = self.state.lock();
        let cooldown = self.cooldown;
        for entry in &mut state.entries {
            if entry.dead_since.is_some_and(|t| t.elapsed() >= cooldown) {
                debug!(proxy = %entry.url, "proxy revived after cooldown");
                entry.dead_since = None;
                entry.failures = 0;
            }
        }
        let alive: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_alive(cooldown))
            .map(|(i, _)| i)
            .collect();
        if alive.is_empty() {
            return Err(FetchError::Proxy("All proxies are dead".to_string()));
        }
        let pick = alive[state.cursor % alive.len()];
        state.cursor = state.cursor.wrapping_add(1);
        Ok(state.entries[pick].url.clone())
    }

    /// Records a successful use: clears the failure counter and any dead
    /// marker, reviving the identity immediately.
    pub fn mark_success(&self, url: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.url == url) {
            entry.failures = 0;
            entry.dead_since = None;
        }
    }

    /// Records a failed use; at the threshold the identity is stamped
    /// dead. Re-stamping an already dead entry restarts its cooldown, so
    /// an identity that failed again after revival goes dead again.
    pub fn mark_failure(&self, url: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.url == url) {
            entry.failures += 1;
            if entry.failures >= self.max_failures {
                warn!(proxy = %url, failures = entry.failures, "proxy marked dead");
                entry.dead_since = Some(Instant::now());
            } else {
                debug!(proxy = %url, failures = entry.failures, "proxy failure recorded");
            }
        }
    }

    /// Currently alive identities, in configuration order.
    pub fn alive_proxies(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.is_alive(self.cooldown))
            .map(|e| e.url.clone())
            .collect()
    }

    /// Number of configured identities, dead or alive.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if the pool has no identities. Construction forbids this, so
    /// it only holds for a pool emptied by a future API.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operator escape hatch: clears all failure state and rewinds the
    /// round-robin cursor. Not used automatically.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for entry in &mut state.entries {
            entry.failures = 0;
            entry.dead_since = None;
        }
        state.cursor = 0;
        info!("proxy pool reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(normalize("1.2.3.4:8080").unwrap(), "http://1.2.3.4:8080");
        assert_eq!(
            normalize("1.2.3.4:8080:bob:pw").unwrap(),
            "http://bob:pw@1.2.3.4:8080"
        );
        assert_eq!(
            normalize("socks5://1.2.3.4:1080").unwrap(),
            "socks5://1.2.3.4:1080"
        );
        assert!(normalize("1.2.3.4").is_err());
        assert!(normalize("a:b:c").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn test_empty_list_rejected() {
        let empty: &[&str] = &[];
        assert!(matches!(ProxyPool::new(empty), Err(FetchError::Proxy(_))));
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let pool = ProxyPool::new(&["a.example:1", "b.example:2", "c.example:3"]).unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.get_next().unwrap());
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "http://a.example:1",
                "http://b.example:2",
                "http://c.example:3"
            ]
        );
        // wraps around
        assert_eq!(pool.get_next().unwrap(), "http://a.example:1");
    }

    #[test]
    fn test_failure_threshold_excludes_identity() {
        let pool =
            ProxyPool::with_policy(&["1.2.3.4:8080", "5.6.7.8:8080"], 1, DEFAULT_COOLDOWN)
                .unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        assert_eq!(pool.alive_proxies(), vec!["http://5.6.7.8:8080"]);
        for _ in 0..4 {
            assert_eq!(pool.get_next().unwrap(), "http://5.6.7.8:8080");
        }
    }

    #[test]
    fn test_success_revives_immediately() {
        let pool =
            ProxyPool::with_policy(&["1.2.3.4:8080", "5.6.7.8:8080"], 1, DEFAULT_COOLDOWN)
                .unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        assert_eq!(pool.alive_proxies().len(), 1);
        pool.mark_success("http://1.2.3.4:8080");
        assert_eq!(pool.alive_proxies().len(), 2);
    }

    #[test]
    fn test_cooldown_revival_on_read() {
        let pool = ProxyPool::with_policy(&["1.2.3.4:8080"], 1, Duration::ZERO).unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        // zero cooldown: dead-since is already older than the window
        assert_eq!(pool.get_next().unwrap(), "http://1.2.3.4:8080");
    }

    #[test]
    fn test_refailure_after_cooldown_revival_dies_again() {
        let pool =
            ProxyPool::with_policy(&["1.2.3.4:8080"], 1, Duration::from_millis(50)).unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        assert!(pool.alive_proxies().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        // cooldown elapsed: the read revives it with a clean counter
        assert_eq!(pool.get_next().unwrap(), "http://1.2.3.4:8080");

        pool.mark_failure("http://1.2.3.4:8080");
        assert!(pool.alive_proxies().is_empty());
        assert!(pool.get_next().is_err());
    }

    #[test]
    fn test_revival_resets_failure_counter() {
        let pool =
            ProxyPool::with_policy(&["1.2.3.4:8080"], 2, Duration::from_millis(50)).unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        pool.mark_failure("http://1.2.3.4:8080");
        assert!(pool.alive_proxies().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.get_next().unwrap(), "http://1.2.3.4:8080");

        // counter restarted: one failure stays below the threshold of two
        pool.mark_failure("http://1.2.3.4:8080");
        assert_eq!(pool.alive_proxies().len(), 1);
        pool.mark_failure("http://1.2.3.4:8080");
        assert!(pool.alive_proxies().is_empty());
    }

    #[test]
    fn test_all_dead_errors() {
        let pool = ProxyPool::with_policy(&["1.2.3.4:8080"], 1, DEFAULT_COOLDOWN).unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        match pool.get_next() {
            Err(FetchError::Proxy(msg)) => assert_eq!(msg, "All proxies are dead"),
            other => panic!("expected proxy error, got {other:?}"),
        }
    }

    #[test]
    fn test_failures_below_threshold_stay_alive() {
        let pool = ProxyPool::with_policy(&["1.2.3.4:8080"], 3, DEFAULT_COOLDOWN).unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        pool.mark_failure("http://1.2.3.4:8080");
        assert_eq!(pool.alive_proxies().len(), 1);
        pool.mark_failure("http://1.2.3.4:8080");
        assert!(pool.alive_proxies().is_empty());
    }

    #[test]
    fn test_reset_clears_everything() {
        let pool = ProxyPool::with_policy(&["1.2.3.4:8080"], 1, DEFAULT_COOLDOWN).unwrap();
        pool.mark_failure("http://1.2.3.4:8080");
        assert!(pool.get_next().is_err());
        pool.reset();
        assert_eq!(pool.get_next().unwrap(), "http://1.2.3.4:8080");
    }

    #[test]
    fn test_from_file_skips_blank_and_comments() {
        let dir = std::env::temp_dir().join("adtrawl-pool-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxies.txt");
        std::fs::write(&path, "# fleet A\n1.2.3.4:8080\n\n5.6.7.8:9090\n").unwrap();
        let pool = ProxyPool::from_file(&path).unwrap();
        assert_eq!(pool.len(), 2);
    }
}
