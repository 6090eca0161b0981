//! High-level async client over the ad archive.
//!
//! The client ties together the session manager, the collaborator set
//! (record builder, dedup store, filter, notification sink), and the
//! collector. One instance serves one logical search at a time; parallel
//! searches need separate instances, each with its own session.

use std::sync::Arc;

use serde_json::Value;

use adtrawl_core::{
    DedupStore, DefaultRecordBuilder, NotificationSink, RecordBuilder, RecordFilter, SearchParams,
};

use crate::collector::{Collector, CollectorSettings};
use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::pool::ProxyPool;
use crate::session::SessionManager;

/// Async client over the ad archive.
///
/// ```no_run
/// use adtrawl_fetch::AdClient;
/// use adtrawl_core::SearchParams;
///
/// # async fn run() -> Result<(), adtrawl_fetch::FetchError> {
/// let mut client = AdClient::new();
/// let mut search = client.search(SearchParams::new("coffee").with_country("US"))?;
/// while let Some(record) = search.next_record().await {
///     println!("{}", record?.archive_id);
/// }
/// # Ok(())
/// # }
/// ```
pub struct AdClient {
    config: ClientConfig,
    pool: Option<Arc<ProxyPool>>,
    session: SessionManager,
    builder: Arc<dyn RecordBuilder>,
    dedup: Option<Arc<dyn DedupStore>>,
    filter: Option<Arc<dyn RecordFilter>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl AdClient {
    /// Creates a client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a client with the given configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        let session = SessionManager::new(config.clone(), None, None);
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

    fn rebuild_session(&mut self) {
        self.session =
            SessionManager::new(self.config.clone(), self.pool.clone(), self.sink.clone());
    }

    /// Direct access to the session surface.
    pub fn session(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    /// Starts a lazy search; records are pulled through the returned
    /// collector.
    pub fn search(
        &mut self,
        params: SearchParams,
    ) -> Result<Collector<&mut SessionManager>, FetchError> {
        Collector::new(
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
    pub async fn typeahead(
        &mut self,
        query: &str,
        country: &str,
    ) -> Result<Value, FetchError> {
        let (payload, _) = self.session.typeahead(query, country).await?;
        Ok(payload)
    }

    /// Detail lookup for one archived ad.
    pub async fn ad_detail(&mut self, archive_id: &str) -> Result<Value, FetchError> {
        let (payload, _) = self.session.ad_detail(archive_id).await?;
        Ok(payload)
    }

    /// Releases the connection context. Safe to call multiple times.
    pub fn close(&mut self) {
        self.session.close();
    }
}

impl Default for AdClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_starts_uninitialized() {
        let mut client = AdClient::new();
        assert!(!client.session().is_initialized());
    }

    #[test]
    fn test_close_idempotent() {
        let mut client = AdClient::new();
        client.close();
        client.close();
    }

    #[test]
    fn test_invalid_params_rejected_without_session() {
        let mut client = AdClient::new();
        assert!(client.search(SearchParams::new("")).is_err());
    }
}
