//! Connection contexts: cookie jar, browser header profile, and optional
//! outbound identity binding.
//!
//! The session manager exclusively owns a transport and is the only
//! component allowed to tear one down and recreate it. Rebinding to a new
//! identity rebuilds the HTTP client but keeps the jar and profile;
//! a refresh replaces the whole transport.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use url::Url;

use crate::error::FetchError;

/// Browser user agents the profile generator picks from.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

/// Window dimensions seeded into the identity cookies.
const WINDOW_DIMS: &[&str] = &["1920x1080", "1680x1050", "1536x864", "2560x1440"];

/// Cookie set when the anti-automation challenge has been acknowledged.
pub const CHALLENGE_ACK_COOKIE: &str = "vrf";

// ============================================================================
// Browser profile
// ============================================================================

/// A consistent-looking browser identity: an opaque header set plus
/// pre-seeded device cookies. Generated fresh per transport.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    /// User agent string.
    pub user_agent: String,
    /// Identity cookies seeded into the jar before the first request.
    pub cookies: Vec<(String, String)>,
}

impl BrowserProfile {
    /// Generates a fresh profile.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let user_agent = USER_AGENTS
            .choose(&mut rng)
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        let device_id: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let wd = WINDOW_DIMS.choose(&mut rng).copied().unwrap_or("1920x1080");
        Self {
            user_agent,
            cookies: vec![
                ("datr".to_string(), device_id),
                ("wd".to_string(), wd.to_string()),
                ("locale".to_string(), "en_US".to_string()),
            ],
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(
            HeaderName::from_static("sec-fetch-mode"),
            HeaderValue::from_static("navigate"),
        );
        headers.insert(
            HeaderName::from_static("sec-fetch-site"),
            HeaderValue::from_static("same-origin"),
        );
        headers.insert(
            HeaderName::from_static("x-asbd-id"),
            HeaderValue::from_static("129477"),
        );
        headers
    }
}

fn seeded_jar(profile: &BrowserProfile, base_url: &Url) -> Arc<Jar> {
    let jar = Arc::new(Jar::default());
    let host = base_url.host_str().unwrap_or_default();
    for (name, value) in &profile.cookies {
        jar.add_cookie_str(&format!("{name}={value}; Domain={host}; Path=/"), base_url);
    }
    jar
}

fn parse_base_url(base_url: &str) -> Result<Url, FetchError> {
    Url::parse(base_url)
        .map_err(|e| FetchError::InvalidResponse(format!("invalid base url {base_url:?}: {e}")))
}

// ============================================================================
// Async transport
// ============================================================================

/// Async connection context bound to at most one outbound identity.
#[derive(Debug)]
pub struct Transport {
    client: reqwest::Client,
    jar: Arc<Jar>,
    base_url: Url,
    proxy: Option<String>,
    profile: BrowserProfile,
    timeout: Duration,
}

impl Transport {
    /// Creates a transport with a fresh jar and profile.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        proxy: Option<String>,
    ) -> Result<Self, FetchError> {
        let base_url = parse_base_url(base_url)?;
        let profile = BrowserProfile::generate();
        let jar = seeded_jar(&profile, &base_url);
        let client = build_client(&profile, &jar, timeout, proxy.as_deref())?;
        Ok(Self {
            client,
            jar,
            base_url,
            proxy,
            profile,
            timeout,
        })
    }

    /// The identity currently bound to this connection, if any.
    pub fn bound_proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Rebuilds the client bound to a different identity, keeping cookies
    /// and profile.
    pub fn rebind(&mut self, proxy: Option<String>) -> Result<(), FetchError> {
        self.client = build_client(&self.profile, &self.jar, self.timeout, proxy.as_deref())?;
        self.proxy = proxy;
        Ok(())
    }

    /// Resolves a path against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::InvalidResponse(format!("invalid path {path:?}: {e}")))
    }

    /// Issues a GET.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response, FetchError> {
        let url = self.url_for(path)?;
        Ok(self.client.get(url).send().await?)
    }

    /// Issues a form-encoded POST preserving field order.
    pub async fn post_form(
        &self,
        path: &str,
        fields: &[(String, String)],
    ) -> Result<reqwest::Response, FetchError> {
        let url = self.url_for(path)?;
        Ok(self.client.post(url).form(fields).send().await?)
    }

    /// True if the jar currently carries a cookie with the given name.
    pub fn has_cookie(&self, name: &str) -> bool {
        jar_has_cookie(&self.jar, &self.base_url, name)
    }
}

// ============================================================================
// Blocking transport
// ============================================================================

/// Blocking twin of [`Transport`]; identical responsibilities, different
/// I/O substrate.
#[derive(Debug)]
pub struct BlockingTransport {
    client: reqwest::blocking::Client,
    jar: Arc<Jar>,
    base_url: Url,
    proxy: Option<String>,
    profile: BrowserProfile,
    timeout: Duration,
}

impl BlockingTransport {
    /// Creates a transport with a fresh jar and profile.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        proxy: Option<String>,
    ) -> Result<Self, FetchError> {
        let base_url = parse_base_url(base_url)?;
        let profile = BrowserProfile::generate();
        let jar = seeded_jar(&profile, &base_url);
        let client = build_blocking_client(&profile, &jar, timeout, proxy.as_deref())?;
        Ok(Self {
            client,
            jar,
            base_url,
            proxy,
            profile,
            timeout,
        })
    }

    /// The identity currently bound to this connection, if any.
    pub fn bound_proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Rebuilds the client bound to a different identity, keeping cookies
    /// and profile.
    pub fn rebind(&mut self, proxy: Option<String>) -> Result<(), FetchError> {
        self.client =
            build_blocking_client(&self.profile, &self.jar, self.timeout, proxy.as_deref())?;
        self.proxy = proxy;
        Ok(())
    }

    /// Resolves a path against the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::InvalidResponse(format!("invalid path {path:?}: {e}")))
    }

    /// Issues a GET.
    pub fn get(&self, path: &str) -> Result<reqwest::blocking::Response, FetchError> {
        let url = self.url_for(path)?;
        Ok(self.client.get(url).send()?)
    }

    /// Issues a form-encoded POST preserving field order.
    pub fn post_form(
        &self,
        path: &str,
        fields: &[(String, String)],
    ) -> Result<reqwest::blocking::Response, FetchError> {
        let url = self.url_for(path)?;
        Ok(self.client.post(url).form(fields).send()?)
    }

    /// True if the jar currently carries a cookie with the given name.
    pub fn has_cookie(&self, name: &str) -> bool {
        jar_has_cookie(&self.jar, &self.base_url, name)
    }
}

// ============================================================================
// Shared construction
// ============================================================================

fn jar_has_cookie(jar: &Arc<Jar>, base_url: &Url, name: &str) -> bool {
    let needle = format!("{name}=");
    CookieStore::cookies(jar.as_ref(), base_url)
        .and_then(|v| v.to_str().map(str::to_string).ok())
        .is_some_and(|cookies| {
            cookies
                .split(';')
                .any(|c| c.trim_start().starts_with(&needle))
        })
}

fn build_client(
    profile: &BrowserProfile,
    jar: &Arc<Jar>,
    timeout: Duration,
    proxy: Option<&str>,
) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .default_headers(profile.headers())
        .cookie_provider(Arc::clone(jar))
        .timeout(timeout);
    if let Some(p) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(p)?);
    }
    Ok(builder.build()?)
}

fn build_blocking_client(
    profile: &BrowserProfile,
    jar: &Arc<Jar>,
    timeout: Duration,
    proxy: Option<&str>,
) -> Result<reqwest::blocking::Client, FetchError> {
    let mut builder = reqwest::blocking::Client::builder()
        .default_headers(profile.headers())
        .cookie_provider(Arc::clone(jar))
        .timeout(timeout);
    if let Some(p) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(p)?);
    }
    Ok(builder.build()?)
}
