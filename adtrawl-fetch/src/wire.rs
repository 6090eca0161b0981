//! Pure wire-format logic shared by the async and blocking flavors.
//!
//! Everything here is free of I/O: token extraction from the bootstrap
//! document, envelope construction, response parsing, and in-band error
//! classification. Both execution substrates call into this module so the
//! decision logic exists exactly once.

use std::collections::HashMap;
use std::sync::LazyLock;

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use adtrawl_core::{pick, pick_str};

/// Anti-hijacking literal some responses are prefixed with.
pub const HIJACK_PREFIX: &str = "for (;;);";

/// Constant caller class carried in every envelope.
pub const CALLER_CLASS: &str = "RelayModern";

/// Checksum value used when the token is empty.
const EMPTY_TOKEN_CHECKSUM: &str = "2893";

/// Numeric in-band error codes signalling rate limiting.
const RATE_LIMIT_CODES: &[i64] = &[1_675_004, 17];

/// Numeric in-band error codes signalling an expired session.
const SESSION_CODES: &[i64] = &[1_357_001, 1_357_005];

// ============================================================================
// Operations
// ============================================================================

/// Server operations the session can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Paginated archive search.
    Search,
    /// Typeahead suggestions for a partial query.
    Typeahead,
    /// Detail lookup for a single archived ad.
    Detail,
}

impl Operation {
    /// All supported operations.
    pub const ALL: &[Operation] = &[Self::Search, Self::Typeahead, Self::Detail];

    /// Friendly name carried in the envelope.
    pub fn friendly_name(self) -> &'static str {
        match self {
            Self::Search => "AdLibrarySearchPaginationQuery",
            Self::Typeahead => "AdLibraryTypeaheadSuggestionDataSourceQuery",
            Self::Detail => "AdLibraryAdDetailsV2Query",
        }
    }

    /// Last-known-good operation identifier, used when the bootstrap
    /// document does not reveal one. The server rotates these; fallbacks
    /// are an accepted operating condition, not a guarantee.
    pub fn fallback_doc_id(self) -> &'static str {
        match self {
            Self::Search => "24394895826947298",
            Self::Typeahead => "24261753080148476",
            Self::Detail => "24407252205541719",
        }
    }
}

// ============================================================================
// Checksum and counters
// ============================================================================

/// Derived checksum of the mandatory token: `2 + sum(char codes)`.
///
/// An empty token yields the fixed historical value `"2893"`.
pub fn checksum(token: &str) -> String {
    if token.is_empty() {
        return EMPTY_TOKEN_CHECKSUM.to_string();
    }
    let sum: u32 = token.chars().map(|c| c as u32).sum();
    (2 + sum).to_string()
}

/// Renders a sequence counter in base 36, lowercase.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Random short per-request tracking id.
pub fn generate_tracking_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Random per-search session identifier, held constant across pages.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

/// Random per-search collation token in UUID form, held constant across
/// pages so the server can correlate them.
pub fn generate_collation_token() -> String {
    let mut rng = rand::thread_rng();
    let h: String = (0..32).map(|_| format!("{:x}", rng.gen_range(0..16))).collect();
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

// ============================================================================
// Token extraction
// ============================================================================

/// Ordered extraction candidates for one named token. First match wins.
struct TokenPattern {
    name: &'static str,
    candidates: &'static [&'static str],
}

/// Session tokens recoverable from the bootstrap document. Only `lsd` is
/// mandatory; the rest degrade to fallbacks.
const TOKEN_PATTERNS: &[TokenPattern] = &[
    TokenPattern {
        name: "lsd",
        candidates: &[
            r#""LSD",\[\],\{"token":"([^"]+)"\}"#,
            r#"name="lsd" value="([^"]+)""#,
            r#""lsd":"([^"]+)""#,
        ],
    },
    TokenPattern {
        name: "rev",
        candidates: &[
            r#""__spin_r":(\d+)"#,
            r#""client_revision":(\d+)"#,
            r#""server_revision":(\d+)"#,
        ],
    },
    TokenPattern {
        name: "hsi",
        candidates: &[r#""hsi":"(\d+)""#],
    },
    TokenPattern {
        name: "spin_t",
        candidates: &[r#""__spin_t":(\d+)"#],
    },
];

/// Extraction candidates for per-operation identifiers.
const DOC_ID_CANDIDATE_TEMPLATES: &[&str] = &[
    r#"\{"id":"(\d+)","metadata":[^}]*\},?"name":"{NAME}""#,
    r#""{NAME}_[A-Za-z]+","id":"(\d+)""#,
    r#""{NAME}"[^{}]{0,80}?"id":"(\d+)""#,
];

static TOKEN_REGEXES: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    TOKEN_PATTERNS
        .iter()
        .map(|p| {
            let compiled = p
                .candidates
                .iter()
                .filter_map(|c| Regex::new(c).ok())
                .collect();
            (p.name, compiled)
        })
        .collect()
});

static DOC_ID_REGEXES: LazyLock<Vec<(Operation, Vec<Regex>)>> = LazyLock::new(|| {
    Operation::ALL
        .iter()
        .map(|op| {
            let compiled = DOC_ID_CANDIDATE_TEMPLATES
                .iter()
                .filter_map(|t| Regex::new(&t.replace("{NAME}", op.friendly_name())).ok())
                .collect();
            (*op, compiled)
        })
        .collect()
});

/// Tokens and operation identifiers recovered from one bootstrap document.
#[derive(Debug, Default, Clone)]
pub struct TokenSet {
    /// Token name to value. `lsd` is the mandatory credential token.
    pub tokens: HashMap<String, String>,
    /// Operation to discovered identifier.
    pub doc_ids: HashMap<Operation, String>,
}

impl TokenSet {
    /// The mandatory credential token, if extracted.
    pub fn lsd(&self) -> Option<&str> {
        self.tokens.get("lsd").map(String::as_str)
    }

    /// Token value or empty string.
    pub fn token_or_empty(&self, name: &str) -> &str {
        self.tokens.get(name).map_or("", String::as_str)
    }

    /// Operation identifier, falling back to the last-known-good constant.
    pub fn doc_id(&self, op: Operation) -> &str {
        self.doc_ids
            .get(&op)
            .map_or_else(|| op.fallback_doc_id(), String::as_str)
    }
}

/// Runs the pattern cascades over a bootstrap document.
///
/// Missing optional tokens are logged and left absent; callers decide what
/// is mandatory. Operation identifiers not found keep their fallbacks.
pub fn extract_session_tokens(html: &str) -> TokenSet {
    let mut set = TokenSet::default();

    for (name, regexes) in TOKEN_REGEXES.iter() {
        let found = regexes.iter().find_map(|re| {
            re.captures(html)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
        });
        match found {
            Some(value) => {
                set.tokens.insert((*name).to_string(), value);
            }
            None => warn!(token = name, "token not found in bootstrap document"),
        }
    }

    for (op, regexes) in DOC_ID_REGEXES.iter() {
        let found = regexes.iter().find_map(|re| {
            re.captures(html)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        });
        match found {
            Some(id) => {
                debug!(operation = op.friendly_name(), doc_id = %id, "discovered operation id");
                set.doc_ids.insert(*op, id);
            }
            None => warn!(
                operation = op.friendly_name(),
                "operation id not found, keeping fallback"
            ),
        }
    }

    set
}

// ============================================================================
// Challenge detection
// ============================================================================

static CHALLENGE_PATH_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"location\.replace\(\\?"([^")]+?)\\?"\)"#).ok());

/// Detects the script-based verification step in a bootstrap response and
/// extracts its one-time path. Usually co-occurs with HTTP 403, but the
/// body marker is authoritative.
pub fn detect_challenge(body: &str) -> Option<String> {
    if !body.contains("location.replace") {
        return None;
    }
    let re = CHALLENGE_PATH_RE.as_ref()?;
    let raw = re.captures(body)?.get(1)?.as_str();
    let path = raw.replace("\\/", "/");
    if path.contains("/challenge") || path.contains("__verify") {
        Some(path)
    } else {
        None
    }
}

// ============================================================================
// Envelope construction
// ============================================================================

/// Inputs for one request envelope.
#[derive(Debug)]
pub struct EnvelopeInputs<'a> {
    /// Per-session request sequence number, already incremented.
    pub seq: u64,
    /// Short per-request tracking id.
    pub tracking_id: &'a str,
    /// Extracted tokens and operation identifiers.
    pub tokens: &'a TokenSet,
    /// The operation being addressed.
    pub operation: Operation,
    /// Compact-JSON serialized variables object.
    pub variables: String,
}

/// Builds the ordered form-field envelope for one protocol call.
///
/// Field order matters to the remote endpoint and is part of the browser
/// request shape being reproduced.
pub fn build_envelope(inputs: &EnvelopeInputs<'_>) -> Vec<(String, String)> {
    let lsd = inputs.tokens.token_or_empty("lsd");
    let rev = inputs.tokens.token_or_empty("rev");
    vec![
        ("__a".to_string(), "1".to_string()),
        ("__req".to_string(), to_base36(inputs.seq)),
        ("__s".to_string(), inputs.tracking_id.to_string()),
        ("__rev".to_string(), rev.to_string()),
        ("__hsi".to_string(), inputs.tokens.token_or_empty("hsi").to_string()),
        ("__spin_r".to_string(), rev.to_string()),
        ("__spin_t".to_string(), inputs.tokens.token_or_empty("spin_t").to_string()),
        ("lsd".to_string(), lsd.to_string()),
        ("jazoest".to_string(), checksum(lsd)),
        ("fb_api_caller_class".to_string(), CALLER_CLASS.to_string()),
        (
            "fb_api_req_friendly_name".to_string(),
            inputs.operation.friendly_name().to_string(),
        ),
        ("variables".to_string(), inputs.variables.clone()),
        ("doc_id".to_string(), inputs.tokens.doc_id(inputs.operation).to_string()),
    ]
}

// ============================================================================
// Response parsing and in-band classification
// ============================================================================

/// Strips the anti-hijacking prefix if present.
pub fn strip_hijack_prefix(body: &str) -> &str {
    body.strip_prefix(HIJACK_PREFIX).unwrap_or(body).trim_start()
}

/// Parses a protocol response body into JSON, stripping the prefix.
pub fn parse_protocol_body(body: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(strip_hijack_prefix(body))
}

/// In-band classification of one parsed page payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PageClass {
    /// The server signalled rate limiting inside a well-formed response.
    RateLimited,
    /// The server signalled that the session credentials are no longer
    /// accepted.
    SessionExpired,
    /// A usable page of raw results and an optional continuation cursor.
    Page {
        /// Raw result payloads, unconstructed.
        records: Vec<Value>,
        /// Continuation cursor, `None` on the terminal page.
        cursor: Option<String>,
    },
}

fn error_signals(errors: &[Value]) -> Option<PageClass> {
    for err in errors {
        let code = err.get("code").and_then(Value::as_i64);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        if code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) || message.contains("rate limit") {
            return Some(PageClass::RateLimited);
        }
        if code.is_some_and(|c| SESSION_CODES.contains(&c)) || message.contains("session") {
            return Some(PageClass::SessionExpired);
        }
    }
    None
}

/// Classifies one parsed response independently of its HTTP status.
///
/// Rate-limit and session-expiry signals are structured results, not
/// errors; only the collection engine decides whether to retry or stop.
/// Never returns an error: an unrecognizable payload classifies as an
/// empty terminal page.
pub fn classify_page(payload: &Value) -> PageClass {
    if payload
        .get("rate_limited")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return PageClass::RateLimited;
    }

    if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
        if let Some(class) = error_signals(errors) {
            return class;
        }
    }

    let data = payload.get("data").unwrap_or(payload);
    let connection = pick(data, &["ad_library_main", "adLibraryMain"])
        .and_then(|m| pick(m, &["search_results_connection", "searchResultsConnection"]))
        .unwrap_or(data);

    let records = pick(connection, &["edges", "ads", "results"])
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let page_info = pick(connection, &["page_info", "pageInfo"]);
    let cursor = page_info.and_then(|info| {
        let has_next = pick(info, &["has_next_page", "hasNextPage"])
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !has_next {
            return None;
        }
        pick_str(info, &["end_cursor", "endCursor", "forward_cursor"])
    });

    PageClass::Page { records, cursor }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_matches_char_codes() {
        // 2 + sum of ASCII codes
        assert_eq!(checksum("abc"), (2 + 97 + 98 + 99).to_string());
        assert_eq!(checksum("A"), "67");
    }

    #[test]
    fn test_checksum_empty_token_is_fixed() {
        assert_eq!(checksum(""), "2893");
    }

    #[test]
    fn test_base36_rendering() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(9), "9");
        assert_eq!(to_base36(10), "a");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(71), "1z");
    }

    #[test]
    fn test_lsd_extraction_from_bootstrap() {
        let html = r#"<script>stuff;["LSD",[],{"token":"abc123xyz"}],more</script>"#;
        let set = extract_session_tokens(html);
        assert_eq!(set.lsd(), Some("abc123xyz"));
    }

    #[test]
    fn test_lsd_extraction_fallback_pattern() {
        let html = r#"<input type="hidden" name="lsd" value="fallbacktok">"#;
        let set = extract_session_tokens(html);
        assert_eq!(set.lsd(), Some("fallbacktok"));
    }

    #[test]
    fn test_missing_doc_id_keeps_fallback() {
        let set = extract_session_tokens("<html></html>");
        assert_eq!(
            set.doc_id(Operation::Search),
            Operation::Search.fallback_doc_id()
        );
    }

    #[test]
    fn test_doc_id_discovery() {
        let html = r#"{"id":"987654321","metadata":{},"name":"AdLibrarySearchPaginationQuery"}"#;
        let set = extract_session_tokens(html);
        assert_eq!(set.doc_id(Operation::Search), "987654321");
    }

    #[test]
    fn test_rev_cascade_first_match_wins() {
        let html = r#""client_revision":111,"__spin_r":222"#;
        let set = extract_session_tokens(html);
        assert_eq!(set.token_or_empty("rev"), "222");
    }

    #[test]
    fn test_challenge_detection() {
        let body = r#"<script>window.location.replace("\/challenge\/?next=x");</script>"#;
        assert_eq!(detect_challenge(body), Some("/challenge/?next=x".to_string()));
        assert_eq!(detect_challenge("<html>plain</html>"), None);
        // replace to a non-challenge path is not a challenge
        let other = r#"window.location.replace("\/home\/")"#;
        assert_eq!(detect_challenge(other), None);
    }

    #[test]
    fn test_envelope_shape_and_order() {
        let mut set = TokenSet::default();
        set.tokens.insert("lsd".to_string(), "tok".to_string());
        set.tokens.insert("rev".to_string(), "1001".to_string());
        let fields = build_envelope(&EnvelopeInputs {
            seq: 11,
            tracking_id: "ab12cd",
            tokens: &set,
            operation: Operation::Search,
            variables: "{}".to_string(),
        });
        let names: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "__a", "__req", "__s", "__rev", "__hsi", "__spin_r", "__spin_t", "lsd",
                "jazoest", "fb_api_caller_class", "fb_api_req_friendly_name", "variables",
                "doc_id"
            ]
        );
        let get = |k: &str| fields.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("__req"), Some("b"));
        assert_eq!(get("jazoest"), Some(checksum("tok").as_str()));
        assert_eq!(get("doc_id"), Some(Operation::Search.fallback_doc_id()));
    }

    #[test]
    fn test_hijack_prefix_stripped() {
        let body = r#"for (;;);{"data":{}}"#;
        let parsed = parse_protocol_body(body).unwrap();
        assert!(parsed.get("data").is_some());
        // absent prefix also parses
        assert!(parse_protocol_body(r#"{"ok":1}"#).is_ok());
    }

    #[test]
    fn test_classify_rate_limit_code() {
        let payload = json!({"errors": [{"code": 1675004, "message": "whatever"}]});
        assert_eq!(classify_page(&payload), PageClass::RateLimited);
    }

    #[test]
    fn test_classify_rate_limit_substring_case_insensitive() {
        let payload = json!({"errors": [{"message": "Hit the RATE LIMIT, slow down"}]});
        assert_eq!(classify_page(&payload), PageClass::RateLimited);
    }

    #[test]
    fn test_classify_session_expiry() {
        let payload = json!({"errors": [{"code": 1357001, "message": "x"}]});
        assert_eq!(classify_page(&payload), PageClass::SessionExpired);
        let by_msg = json!({"errors": [{"message": "Your Session has ended"}]});
        assert_eq!(classify_page(&by_msg), PageClass::SessionExpired);
    }

    #[test]
    fn test_classify_rate_limited_flag() {
        let payload = json!({"ads": [], "page_info": {}, "rate_limited": true});
        assert_eq!(classify_page(&payload), PageClass::RateLimited);
    }

    #[test]
    fn test_classify_page_with_cursor() {
        let payload = json!({
            "data": {"ad_library_main": {"search_results_connection": {
                "edges": [{"node": {"ad_archive_id": "1"}}],
                "page_info": {"end_cursor": "abc", "has_next_page": true}
            }}}
        });
        match classify_page(&payload) {
            PageClass::Page { records, cursor } => {
                assert_eq!(records.len(), 1);
                assert_eq!(cursor.as_deref(), Some("abc"));
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_classify_terminal_page() {
        let payload = json!({
            "ads": [{"ad_archive_id": "9"}],
            "page_info": {"end_cursor": "zzz", "has_next_page": false}
        });
        match classify_page(&payload) {
            PageClass::Page { records, cursor } => {
                assert_eq!(records.len(), 1);
                assert_eq!(cursor, None);
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_correlation_ids_shape() {
        let sid = generate_session_id();
        assert_eq!(sid.len(), 32);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
        let tok = generate_collation_token();
        assert_eq!(tok.len(), 36);
        assert_eq!(tok.matches('-').count(), 4);
        assert_eq!(generate_tracking_id().len(), 6);
    }
}
