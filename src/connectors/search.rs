//! Paginated search connector
//!
//! Walks `GET {url}/api/{collection}/search/?q=..&search_after=..` until the
//! service stops returning a cursor, then writes every hit as one JSON line.
//! Queries are restricted to one board and checked with a `size=0` request
//! first, so a query without hits or with an unexpectedly large result set
//! never starts paginating. Records gathered before an interrupt or an
//! aborted page are still written out.

use bon::Builder;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{RunReport, RunStatus};
use crate::config::{Config, SearchConfig};
use crate::engine::{
    AttemptError, CanonicalKey, FailureKind, Page, PageSource, PaginationError,
    PaginationOptions, Paginator, Partial, ProgressCounters, RequestOptions, Target,
};
use crate::error::{Result, RunError};
use crate::transport::Transport;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// Chan fields kept verbatim next to the mapped columns
const KNOWN_CHAN_FIELDS: &[&str] = &[
    "deleted",
    "timestamp_deleted",
    "replies_to",
    "capcode",
    "trip",
    "filename",
    "tim",
    "md5",
    "w",
    "h",
    "tw",
    "th",
    "fsize",
    "country",
    "country_name",
    "op",
    "replies",
    "images",
    "semantic_url",
    "sticky",
    "closed",
    "archived_on",
    "scraped_on",
    "modified_on",
    "unique_ips",
    "bumplimit",
    "imagelimit",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("You must provide a search query")]
    MissingQuery,

    #[error("You must provide a collection")]
    MissingCollection,

    #[error("search.url is not configured")]
    MissingUrl,

    #[error("search.user is not configured")]
    MissingUser,

    #[error("BULKFETCH_SEARCH_PASSWORD is not set")]
    MissingPassword,

    #[error("No board selected")]
    MissingBoard,

    #[error("Your search does not result in any results")]
    NoResults,

    #[error("Your search matches {hits} items; confirm to continue")]
    NeedsConfirmation { hits: u64 },

    /// Message sent by the search service with a 4xx response
    #[error("{0}")]
    Rejected(String),

    #[error("Search service couldn't respond: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Builder)]
pub struct SearchJob {
    #[builder(into)]
    pub collection: String,
    #[builder(into)]
    pub query: String,
    #[builder(into)]
    pub board: Option<String>,
    /// Accept result sets above `search.confirm_above`
    #[builder(default)]
    pub confirm: bool,
    /// Stop after the page that reaches this many records; 0 = all
    #[builder(default)]
    pub max_records: u64,
    /// NDJSON destination; defaults to `<staging_root>/<run id>.ndjson`
    pub output: Option<PathBuf>,
}

impl SearchJob {
    pub fn validate(&self) -> std::result::Result<(), QueryError> {
        if self.query.trim().is_empty() {
            return Err(QueryError::MissingQuery);
        }
        if self.collection.trim().is_empty() {
            return Err(QueryError::MissingCollection);
        }
        if self.board.as_deref().is_none_or(|b| b.trim().is_empty()) {
            return Err(QueryError::MissingBoard);
        }
        Ok(())
    }

    /// Query as sent to the service, restricted to the job's board
    pub fn qualified_query(&self) -> String {
        format!(
            "board:{} AND {}",
            self.board.as_deref().unwrap_or_default().trim(),
            self.query.trim()
        )
    }
}

/// Search endpoint as a page source
pub struct SearchSource {
    endpoint: String,
    query: String,
    options: RequestOptions,
}

impl SearchSource {
    pub fn new(
        config: &SearchConfig,
        job: &SearchJob,
        options: RequestOptions,
    ) -> std::result::Result<Self, QueryError> {
        job.validate()?;
        let url = config.url.as_deref().ok_or(QueryError::MissingUrl)?;
        let user = config.user.clone().ok_or(QueryError::MissingUser)?;
        let password = config.password.clone().ok_or(QueryError::MissingPassword)?;

        Ok(Self {
            endpoint: format!(
                "{}/api/{}/search/",
                url.trim().trim_end_matches('/'),
                job.collection.trim()
            ),
            query: job.qualified_query(),
            options: RequestOptions {
                basic_auth: Some((user, Some(password))),
                ..options
            },
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identity of the page request following `cursor`
    pub fn page_key(&self, cursor: Option<&str>) -> CanonicalKey {
        CanonicalKey::from_raw(format!(
            "{}?q={}&search_after={}",
            self.endpoint,
            self.query,
            cursor.unwrap_or_default()
        ))
    }

    pub fn preflight_key(&self) -> CanonicalKey {
        CanonicalKey::from_raw(format!("{}?q={}&size=0", self.endpoint, self.query))
    }

    /// Hit count request: no records, short timeout
    pub fn preflight_request(&self) -> Target {
        let options = RequestOptions {
            timeout: PREFLIGHT_TIMEOUT.min(self.options.timeout),
            ..self.options.clone()
        };
        Target::new(self.preflight_key(), &self.endpoint, options)
            .with_query("q", &self.query)
            .with_query("size", "0")
    }
}

/// `message` of a JSON error body
fn server_message(body: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(body).ok()?;
    json.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl PageSource for SearchSource {
    type Item = Value;

    fn request(&self, cursor: Option<&str>) -> Target {
        let target = Target::new(self.page_key(cursor), &self.endpoint, self.options.clone())
            .with_query("q", &self.query);
        match cursor {
            Some(cursor) => target.with_query("search_after", cursor),
            None => target,
        }
    }

    fn parse(&self, body: &[u8]) -> std::result::Result<Page<Value>, AttemptError> {
        let json: Value =
            serde_json::from_slice(body).map_err(|e| AttemptError::parse(e.to_string()))?;

        if let Some(error) = json.get("error").and_then(Value::as_str) {
            if error.to_ascii_lowercase().contains("limit exceeded") {
                return Err(AttemptError::rate_limited(error));
            }
            return Err(AttemptError::new(FailureKind::FatalClient, error));
        }

        let results = json
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| AttemptError::new(FailureKind::TransientServer, "response has no results"))?;

        Ok(Page {
            items: results.iter().cloned().map(normalize_item).collect(),
            total: json.get("total").and_then(Value::as_u64),
            cursor: json.get("search_after").and_then(cursor_token),
        })
    }

    /// A 4xx carrying a `message` is the service rejecting the query
    fn reject(&self, status: u16, body: &[u8]) -> AttemptError {
        match server_message(body) {
            Some(message) if (400..500).contains(&status) && status != 429 => {
                AttemptError::terminal(FailureKind::FatalClient, message)
            }
            _ => AttemptError::new(FailureKind::from_status(status), format!("HTTP {}", status)),
        }
    }
}

/// Strings pass through; any other cursor travels as its JSON text
fn cursor_token(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(a) if a.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Map chan posts (`board` + `no`) onto the common record columns; other
/// items pass through untouched
pub fn normalize_item(item: Value) -> Value {
    let Value::Object(post) = item else {
        return item;
    };
    if !truthy(post.get("board")) || !post.contains_key("no") {
        return Value::Object(post);
    }

    let field = |name: &str| post.get(name).cloned().unwrap_or_else(|| Value::from(""));
    let text = |name: &str| strip_tags(post.get(name).and_then(Value::as_str).unwrap_or_default());

    let thread = if truthy(post.get("resto")) {
        field("resto")
    } else if post.contains_key("thread") {
        field("thread")
    } else {
        field("no")
    };

    let mut mapped = Map::new();
    mapped.insert("board".into(), field("board"));
    mapped.insert("thread".into(), thread);
    mapped.insert("id".into(), field("no"));
    mapped.insert("unix_timestamp".into(), field("time"));
    mapped.insert("etd_timestamp".into(), field("now"));
    mapped.insert("author".into(), field("name"));
    mapped.insert("post_id".into(), field("id"));
    mapped.insert("title".into(), Value::from(text("sub")));
    mapped.insert("body".into(), field("com"));
    for name in KNOWN_CHAN_FIELDS {
        mapped.insert((*name).into(), field(*name));
    }

    Value::Object(mapped)
}

pub struct SearchRunner {
    config: Config,
    transport: Arc<dyn Transport>,
    interrupt: CancellationToken,
}

impl SearchRunner {
    pub fn new(config: Config, transport: Arc<dyn Transport>, interrupt: CancellationToken) -> Self {
        Self {
            config,
            transport,
            interrupt,
        }
    }

    pub async fn run(&self, job: &SearchJob) -> Result<RunReport> {
        let run_id = Uuid::now_v7();
        let source = SearchSource::new(
            &self.config.search,
            job,
            self.config.request_options(true),
        )?;

        info!(%run_id, endpoint = source.endpoint(), query = %source.query, "Search started");

        let hits = self.preflight(&source, job).await?;
        info!(%run_id, hits, "Query accepted");

        let output = job.output.clone().unwrap_or_else(|| {
            self.config
                .downloads
                .staging_root
                .join(format!("{}.ndjson", run_id))
        });

        let paginator = Paginator::new(
            Arc::clone(&self.transport),
            source,
            self.config.retry_policy(),
            self.interrupt.clone(),
            PaginationOptions {
                max_records: job.max_records,
                courtesy_delay: self.config.search.courtesy_delay.as_duration(),
                max_page_failures: self.config.search.max_page_failures,
            },
        );

        let collected = match paginator.collect_all().await {
            Ok(collected) => collected,
            Err(Partial { error, collected }) => {
                let found = collected.items.len();
                let written = write_partial(&output, &collected.items).await?;

                if let PaginationError::Interrupted { .. } = error {
                    let report = RunReport::cancelled(run_id, counters(found, collected.total))
                        .with_successes(found as u64);
                    return Ok(match written {
                        Some(path) => report.with_output(path),
                        None => report,
                    });
                }

                return Err(RunError::Pagination {
                    source: error,
                    partial: found,
                    output: written,
                });
            }
        };

        let found = collected.items.len();
        let counters = counters(found, collected.total);
        if found == 0 {
            return Ok(RunReport::empty(run_id, "No results found").with_counters(counters));
        }

        write_ndjson(&output, &collected.items).await?;

        info!(%run_id, records = found, pages = collected.pages, output = %output.display(), "Search finished");

        Ok(RunReport::new(
            run_id,
            RunStatus::Completed,
            format!("Collected {} record(s) in {} page(s)", found, collected.pages),
        )
        .with_successes(found as u64)
        .with_counters(counters)
        .with_output(output))
    }

    /// Ask for the hit count only. Rejects queries without hits and, unless
    /// the job is confirmed, queries above `search.confirm_above`.
    async fn preflight(&self, source: &SearchSource, job: &SearchJob) -> Result<u64> {
        let request = source.preflight_request();
        let response = tokio::time::timeout(request.options().timeout, self.transport.send(&request))
            .await
            .map_err(|_| QueryError::Unavailable("hit count request timed out".to_string()))?
            .map_err(|e| QueryError::Unavailable(e.to_string()))?;
        let status = response.status;
        let success = response.is_success();
        let body = response
            .bytes()
            .await
            .map_err(|e| QueryError::Unavailable(e.to_string()))?;

        if !success {
            return Err(match server_message(&body) {
                Some(message) if (400..500).contains(&status) => QueryError::Rejected(message),
                _ => QueryError::Unavailable(format!("HTTP {}", status)),
            }
            .into());
        }

        let json: Value = serde_json::from_slice(&body)
            .map_err(|e| QueryError::Unavailable(format!("invalid JSON: {}", e)))?;
        let hits = json.get("total").and_then(Value::as_u64).unwrap_or(0);

        if hits == 0 {
            return Err(QueryError::NoResults.into());
        }
        let limit = self.config.search.confirm_above;
        if hits > limit && !job.confirm {
            warn!(hits, limit, "Query needs confirmation");
            return Err(QueryError::NeedsConfirmation { hits }.into());
        }
        Ok(hits)
    }
}

fn counters(retrieved: usize, total: Option<u64>) -> ProgressCounters {
    let retrieved = retrieved as u64;
    ProgressCounters {
        discovered: total.unwrap_or(retrieved).max(retrieved),
        retrieved,
        ..ProgressCounters::default()
    }
}

/// Write what was collected before a failed or interrupted run
async fn write_partial(path: &Path, items: &[Value]) -> Result<Option<PathBuf>> {
    if items.is_empty() {
        return Ok(None);
    }
    write_ndjson(path, items).await?;
    info!(records = items.len(), output = %path.display(), "Partial results written");
    Ok(Some(path.to_path_buf()))
}

async fn write_ndjson(path: &Path, items: &[Value]) -> Result<()> {
    let mut body = Vec::new();
    for item in items {
        serde_json::to_writer(&mut body, item).map_err(|source| RunError::Serialize {
            what: "search record",
            source,
        })?;
        body.push(b'\n');
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RunError::io(parent, e))?;
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|e| RunError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_config() -> SearchConfig {
        SearchConfig {
            url: Some("https://search.example/ ".to_string()),
            user: Some("reader".to_string()),
            password: Some("secret".to_string()),
            ..SearchConfig::default()
        }
    }

    fn job(query: &str) -> SearchJob {
        SearchJob::builder().collection("4chan").query(query).board("g").build()
    }

    #[test]
    fn test_query_validation() {
        assert_eq!(job("  ").validate(), Err(QueryError::MissingQuery));
        assert_eq!(
            SearchJob::builder().collection("").query("cats").build().validate(),
            Err(QueryError::MissingCollection)
        );
        assert!(job("cats").validate().is_ok());
        assert_eq!(
            SearchJob::builder().collection("4chan").query("cats").build().validate(),
            Err(QueryError::MissingBoard)
        );
        assert_eq!(
            SearchJob::builder().collection("4chan").query("cats").board(" ").build().validate(),
            Err(QueryError::MissingBoard)
        );
        assert_eq!(QueryError::MissingBoard.to_string(), "No board selected");

        let no_password = SearchConfig {
            password: None,
            ..search_config()
        };
        let err = SearchSource::new(&no_password, &job("cats"), RequestOptions::default());
        assert!(matches!(err, Err(QueryError::MissingPassword)));
    }

    #[test]
    fn test_page_requests_carry_cursor() {
        let source = SearchSource::new(&search_config(), &job("cats"), RequestOptions::default()).unwrap();
        assert_eq!(source.endpoint(), "https://search.example/api/4chan/search/");

        let first = source.request(None);
        assert_eq!(first.query(), &[("q".to_string(), "board:g AND cats".to_string())]);
        assert_eq!(
            first.options().basic_auth,
            Some(("reader".to_string(), Some("secret".to_string())))
        );

        let next = source.request(Some("[17,\"b\"]"));
        assert_eq!(next.query().len(), 2);
        assert_ne!(first.key(), next.key());

        let preflight = source.preflight_request();
        assert_eq!(preflight.query()[1], ("size".to_string(), "0".to_string()));
        assert_eq!(preflight.options().timeout, Duration::from_secs(5));
        assert_ne!(preflight.key(), first.key());
    }

    #[test]
    fn test_parse_page() {
        let source = SearchSource::new(&search_config(), &job("cats"), RequestOptions::default()).unwrap();
        let body = json!({"results": [{"x": 1}], "total": 40, "search_after": [17, "b"]});
        let page = source.parse(body.to_string().as_bytes()).unwrap();

        assert_eq!(page.items, vec![json!({"x": 1})]);
        assert_eq!(page.total, Some(40));
        assert_eq!(page.cursor.as_deref(), Some("[17,\"b\"]"));

        let last = source.parse(br#"{"results": [], "search_after": null}"#).unwrap();
        assert!(last.cursor.is_none());
        assert!(last.total.is_none());
    }

    #[test]
    fn test_parse_failures_are_classified() {
        let source = SearchSource::new(&search_config(), &job("cats"), RequestOptions::default()).unwrap();

        let err = source.parse(br#"{"error": "Search limit exceeded"}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::RateLimited);

        let err = source.parse(br#"{"hits": []}"#).unwrap_err();
        assert_eq!(err.kind, FailureKind::TransientServer);

        let err = source.parse(b"<html>").unwrap_err();
        assert_eq!(err.kind, FailureKind::ParseError);
    }

    #[test]
    fn test_rejected_query_keeps_server_message() {
        let source = SearchSource::new(&search_config(), &job("cats AND ("), RequestOptions::default()).unwrap();

        let err = source.reject(400, br#"{"message": "Malformed query near '('"}"#);
        assert!(err.terminal);
        assert_eq!(err.kind, FailureKind::FatalClient);
        assert_eq!(err.reason, "Malformed query near '('");

        let err = source.reject(400, b"<html>bad request</html>");
        assert_eq!(err.reason, "HTTP 400");

        let err = source.reject(503, br#"{"message": "overloaded"}"#);
        assert_eq!(err.kind, FailureKind::TransientServer);
        assert!(!err.terminal);
    }

    #[test]
    fn test_chan_items_are_mapped() {
        let item = json!({
            "board": "g",
            "no": 1234,
            "resto": 1000,
            "time": 1700000000,
            "name": "Anonymous",
            "sub": "<b>Hello</b> world",
            "com": "text",
            "md5": "abc==",
            "extra": "dropped",
        });
        let mapped = normalize_item(item);

        assert_eq!(mapped["id"], 1234);
        assert_eq!(mapped["thread"], 1000);
        assert_eq!(mapped["title"], "Hello world");
        assert_eq!(mapped["author"], "Anonymous");
        assert_eq!(mapped["md5"], "abc==");
        assert_eq!(mapped["trip"], "");
        assert!(mapped.get("extra").is_none());

        let op = normalize_item(json!({"board": "g", "no": 5, "resto": 0}));
        assert_eq!(op["thread"], 5);

        let other = json!({"id": "x", "text": "not a chan post"});
        assert_eq!(normalize_item(other.clone()), other);
    }
}
