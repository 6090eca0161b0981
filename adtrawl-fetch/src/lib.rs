// Lint configuration for this crate
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # AdTrawl Fetch
//!
//! Session management and resilient collection against the ad archive's
//! GraphQL-over-HTTP endpoint.
//!
//! The endpoint is undocumented and hostile to automation: bootstrap
//! tokens must be scraped out of an HTML landing page, responses may
//! arrive wrapped in a hijack-protection prefix, failures are frequently
//! reported in-band inside HTTP 200 bodies, and sessions expire without
//! warning. This crate absorbs all of that behind two client surfaces:
//!
//! ## Async surface
//!
//! - [`AdClient`] - entry point; owns one [`SessionManager`]
//! - [`Collector`] - lazy, pull-based record sequence over cursor pages
//! - [`SessionManager`] - bootstrap, refresh, and protocol calls
//!
//! ## Blocking surface
//!
//! - [`blocking::BlockingAdClient`] - same behavior without a runtime
//! - [`blocking::BlockingCollector`] - an [`Iterator`] over records
//!
//! Both surfaces share one set of decision functions: wire formats and
//! response classification in [`wire`], retry timing in [`retry`], and
//! page/record planning in [`collector`]. Only the I/O substrate differs.
//!
//! ## Example
//!
//! ```no_run
//! use adtrawl_fetch::AdClient;
//! use adtrawl_core::SearchParams;
//!
//! # async fn run() -> Result<(), adtrawl_fetch::FetchError> {
//! let mut client = AdClient::new();
//! let mut search = client.search(
//!     SearchParams::new("coffee").with_country("US").with_max_results(100),
//! )?;
//! while let Some(record) = search.next_record().await {
//!     println!("{}", record?.archive_id);
//! }
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod blocking;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod retry;
pub mod session;
pub mod transport;
pub mod wire;

// Re-export key types at crate root

// Errors
pub use error::FetchError;

// Clients & collection
pub use client::AdClient;
pub use collector::{Collector, CollectorSettings};
pub use config::ClientConfig;

// Session surface
pub use session::{PageRequest, PageSource, SessionManager};

// Infrastructure
pub use pool::ProxyPool;
pub use retry::BackoffPolicy;
pub use wire::Operation;
