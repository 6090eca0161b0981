// Lint configuration for this crate
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # adtrawl Core
//!
//! Core types, collaborator traits, and lifecycle events shared by the
//! adtrawl crates.
//!
//! This crate provides:
//!
//! - Domain models ([`AdRecord`], [`SearchParams`], [`CollectStats`])
//! - The collaborator seams of the collection engine ([`RecordBuilder`],
//!   [`DedupStore`], [`RecordFilter`])
//! - Lifecycle events and the [`NotificationSink`] boundary
//! - The core error type ([`CoreError`])
//!
//! None of the types here perform network I/O; the fetch crate owns every
//! connection.

pub mod error;
pub mod events;
pub mod models;
pub mod traits;

pub use error::CoreError;
pub use events::{emit_isolated, LifecycleEvent, NotificationSink};
pub use models::{pick, pick_i64, pick_str, AdRecord, CollectStats, SearchParams, MAX_PAGE_LIMIT};
pub use traits::{DedupStore, DefaultRecordBuilder, MemoryDedupStore, RecordBuilder, RecordFilter};
