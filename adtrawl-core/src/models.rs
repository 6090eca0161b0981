//! Domain models: records, search parameters, and collection stats.
//!
//! The remote endpoint is shape-unstable: the same logical field may arrive
//! under a camelCase or snake_case key, at the top level or nested under a
//! snapshot object, depending on server build. Extraction therefore goes
//! through small ordered key cascades feeding one canonical record shape,
//! never deep shape-branching in downstream code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Maximum page size the endpoint accepts.
pub const MAX_PAGE_LIMIT: u32 = 50;

// ============================================================================
// Shape cascade helpers
// ============================================================================

/// Returns the first present, non-null value among the given keys.
pub fn pick<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| value.get(k))
        .find(|v| !v.is_null())
}

/// First non-empty string among the given keys.
pub fn pick_str(value: &Value, keys: &[&str]) -> Option<String> {
    pick(value, keys)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// First integer among the given keys, accepting both numbers and
/// numeric strings.
pub fn pick_i64(value: &Value, keys: &[&str]) -> Option<i64> {
    let v = pick(value, keys)?;
    v.as_i64().or_else(|| v.as_str()?.parse().ok())
}

// ============================================================================
// Ad Record
// ============================================================================

/// Canonical domain record for one collected ad.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdRecord {
    /// Archive identifier, unique per ad. Used as the dedup key.
    pub archive_id: String,
    /// Identifier of the page that ran the ad.
    pub page_id: Option<String>,
    /// Display name of the page that ran the ad.
    pub page_name: Option<String>,
    /// Creative title, if present.
    pub title: Option<String>,
    /// Creative body text, if present.
    pub body: Option<String>,
    /// Unix timestamp when delivery started.
    pub start_time: Option<i64>,
    /// Unix timestamp when delivery ended, if the ad is inactive.
    pub end_time: Option<i64>,
    /// Platforms the ad was delivered on.
    pub platforms: Vec<String>,
    /// Link to the archived creative snapshot.
    pub snapshot_url: Option<String>,
    /// The raw payload the record was built from.
    pub raw: Value,
}

impl AdRecord {
    /// Builds a record from a raw result payload.
    ///
    /// The only mandatory field is the archive identifier; everything else
    /// is best-effort through the key cascades.
    pub fn from_raw(raw: &Value) -> Result<Self, CoreError> {
        let node = pick(raw, &["node", "result"]).unwrap_or(raw);
        let snapshot = pick(node, &["snapshot", "adCreative", "ad_creative"]).unwrap_or(node);

        let archive_id = pick_str(node, &["adArchiveID", "ad_archive_id", "archiveID", "id"])
            .ok_or_else(|| CoreError::InvalidData("missing archive id".to_string()))?;

        let platforms = pick(node, &["publisherPlatform", "publisher_platform", "platforms"])
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            archive_id,
            page_id: pick_str(node, &["pageID", "page_id"]),
            page_name: pick_str(node, &["pageName", "page_name"]),
            title: pick_str(snapshot, &["title", "linkTitle", "link_title"]),
            body: pick_str(snapshot, &["body", "adBody", "ad_body"])
                .or_else(|| pick(snapshot, &["body"]).and_then(|b| pick_str(b, &["text", "markup"]))),
            start_time: pick_i64(node, &["startDate", "start_date", "startTime", "start_time"]),
            end_time: pick_i64(node, &["endDate", "end_date", "endTime", "end_time"]),
            platforms,
            snapshot_url: pick_str(node, &["snapshotURL", "snapshot_url", "adSnapshotURL"]),
            raw: raw.clone(),
        })
    }
}

// ============================================================================
// Search Parameters
// ============================================================================

/// Parameters for one search invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    /// Free-text search query.
    pub query: String,
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    /// Page size requested from the server.
    pub limit: u32,
    /// Stop after this many records have been yielded, if set.
    pub max_results: Option<usize>,
    /// Restrict results to currently active ads.
    pub active_only: bool,
}

impl SearchParams {
    /// Creates parameters with defaults for everything but the query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            country: "US".to_string(),
            limit: 30,
            max_results: None,
            active_only: false,
        }
    }

    /// Sets the country code.
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Caps the number of yielded records.
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Validates the parameters before any network call is made.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.query.trim().is_empty() {
            return Err(CoreError::InvalidParameter(
                "query must not be empty".to_string(),
            ));
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoreError::InvalidParameter(format!(
                "country must be an ISO alpha-2 code, got {:?}",
                self.country
            )));
        }
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(CoreError::InvalidParameter(format!(
                "limit must be in 1..={MAX_PAGE_LIMIT}, got {}",
                self.limit
            )));
        }
        if self.max_results == Some(0) {
            return Err(CoreError::InvalidParameter(
                "max_results must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Collection Stats
// ============================================================================

/// Snapshot of collection progress, visible to callers during and after a
/// search. Early termination (retry ceilings exhausted) shows up here as a
/// nonzero error count, not as an exception.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CollectStats {
    /// Protocol calls issued, including retried ones.
    pub requests_made: u64,
    /// Records yielded to the caller.
    pub records_collected: u64,
    /// Pages successfully fetched and processed.
    pub pages_fetched: u64,
    /// Record-construction failures plus exhausted in-band retry ceilings.
    pub errors: u64,
    /// When the search started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the search finished, on any exit path.
    pub finished_at: Option<DateTime<Utc>>,
}

impl CollectStats {
    /// Wall-clock duration of the search, once finished.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pick_cascade_prefers_first_present() {
        let v = json!({"page_name": "snake", "pageName": "camel"});
        assert_eq!(pick_str(&v, &["pageName", "page_name"]), Some("camel".to_string()));
        assert_eq!(pick_str(&v, &["page_name", "pageName"]), Some("snake".to_string()));
    }

    #[test]
    fn test_pick_skips_null() {
        let v = json!({"pageID": null, "page_id": "42"});
        assert_eq!(pick_str(&v, &["pageID", "page_id"]), Some("42".to_string()));
    }

    #[test]
    fn test_pick_i64_accepts_numeric_string() {
        let v = json!({"start_date": "1700000000"});
        assert_eq!(pick_i64(&v, &["startDate", "start_date"]), Some(1_700_000_000));
    }

    #[test]
    fn test_record_from_camel_case() {
        let raw = json!({
            "adArchiveID": "123456",
            "pageName": "Some Page",
            "publisherPlatform": ["FACEBOOK", "INSTAGRAM"],
            "snapshot": {"title": "Hello", "body": {"text": "World"}}
        });
        let rec = AdRecord::from_raw(&raw).unwrap();
        assert_eq!(rec.archive_id, "123456");
        assert_eq!(rec.page_name.as_deref(), Some("Some Page"));
        assert_eq!(rec.title.as_deref(), Some("Hello"));
        assert_eq!(rec.body.as_deref(), Some("World"));
        assert_eq!(rec.platforms, vec!["FACEBOOK", "INSTAGRAM"]);
    }

    #[test]
    fn test_record_from_snake_case_node() {
        let raw = json!({
            "node": {
                "ad_archive_id": "9",
                "page_id": 77,
                "start_time": 1700000000
            }
        });
        let rec = AdRecord::from_raw(&raw).unwrap();
        assert_eq!(rec.archive_id, "9");
        // page_id is numeric in this shape; cascade only takes strings
        assert_eq!(rec.start_time, Some(1_700_000_000));
    }

    #[test]
    fn test_record_missing_id_fails() {
        let raw = json!({"pageName": "No id here"});
        assert!(AdRecord::from_raw(&raw).is_err());
    }

    #[test]
    fn test_params_validation() {
        assert!(SearchParams::new("shoes").validate().is_ok());
        assert!(SearchParams::new("").validate().is_err());
        assert!(SearchParams::new("x").with_country("USA").validate().is_err());
        assert!(SearchParams::new("x").with_limit(0).validate().is_err());
        assert!(SearchParams::new("x").with_limit(MAX_PAGE_LIMIT + 1).validate().is_err());
        assert!(SearchParams::new("x").with_max_results(0).validate().is_err());
    }
}
