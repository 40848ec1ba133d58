//! Archive image downloader
//!
//! Two orchestrated phases over the same transport:
//! 1. Resolve: one lookup per source record against the archive API, until
//!    `cap` distinct media URLs are known
//! 2. Download: stream the first `cap` URLs into the staging directory,
//!    stopping in-flight transfers once `cap` files landed
//!
//! Every resolved URL ends with exactly one manifest entry. Files of
//! unsuccessful targets are deleted once their outcome is in.

use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::manifest::Manifest;
use super::{RunReport, RunStatus};
use crate::config::{ArchiveConfig, Config};
use crate::engine::{
    AttemptContext, AttemptError, AttemptHandler, CanonicalKey, DownloadOutcome, DownloadSink,
    FailureKind, LedgerEvent, Orchestrator, OrchestratorOptions, Outcome, ProgressLedger,
    ProgressSnapshot, Recorded, RequestOptions, ResolvedUrls, SinkOutcome, StopReason, Target,
};
use crate::error::{Result, RunError};
use crate::transport::{Transport, TransportResponse};

const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "webm"];

/// One row of the source dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceRecord {
    #[serde(default)]
    pub board: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl SourceRecord {
    /// Records without an md5 or pointing at a video have no image to fetch
    pub fn has_image(&self) -> bool {
        let has_md5 = self.md5.as_deref().is_some_and(|m| !m.trim().is_empty());
        let is_video = self.ext.as_deref().is_some_and(|ext| {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        });
        has_md5 && !is_video
    }

    /// Parse newline-delimited JSON; blank lines are skipped
    pub fn parse_ndjson(input: &str) -> Result<Vec<Self>> {
        input
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|source| RunError::Record { line: i + 1, source })
            })
            .collect()
    }

    pub async fn read_ndjson(path: &Path) -> Result<Vec<Self>> {
        let input = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RunError::io(path, e))?;
        Self::parse_ndjson(&input)
    }
}

fn api_url(base: &str, endpoint: &str, params: &[(&str, &str)]) -> Option<String> {
    let raw = format!("{}/_/api/chan/{}/", base.trim_end_matches('/'), endpoint);
    Url::parse_with_params(&raw, params).ok().map(String::from)
}

/// Lookup target for a record: a direct post lookup when `archive` hosts
/// the board, otherwise an md5 image search on `fallback`. The target's
/// slot names the archive whose CDN pattern applies.
pub fn lookup_target(
    record: &SourceRecord,
    archive: (&str, &ArchiveConfig),
    fallback: (&str, &ArchiveConfig),
    options: &RequestOptions,
) -> Option<Target> {
    if !record.has_image() {
        return None;
    }

    let (name, url) = if archive.1.hosts_board(&record.board) && !record.id.is_empty() {
        let url = api_url(
            &archive.1.api_base,
            "post",
            &[("board", record.board.as_str()), ("num", record.id.as_str())],
        )?;
        (archive.0, url)
    } else {
        let md5 = record.md5.as_deref()?.trim();
        (fallback.0, api_url(&fallback.1.api_base, "search", &[("image", md5)])?)
    };

    Target::for_url(&url, options.clone())
        .ok()
        .map(|target| target.with_slot(name))
}

fn board_from_url(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(name, _)| name == "board")
        .map(|(_, value)| value.into_owned())
        .filter(|board| !board.is_empty())
}

/// Pull the media URL out of an archive API response
pub fn extract_media_url(
    body: &Value,
    lookup_url: &str,
    cdn_pattern: &str,
) -> std::result::Result<String, AttemptError> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        if error.to_ascii_lowercase().contains("limit exceeded") {
            return Err(AttemptError::rate_limited("API limit exceeded"));
        }
        return Err(AttemptError::new(FailureKind::FatalClient, error));
    }

    // md5 searches answer {"0": {"posts": [...]}}
    let post = match body.get("0").and_then(|hit| hit.get("posts")) {
        Some(posts) => posts.as_array().and_then(|p| p.first()),
        None => match body.as_array() {
            Some(hits) => hits.first(),
            None => Some(body),
        },
    }
    .ok_or_else(|| AttemptError::new(FailureKind::TransientServer, "empty result"))?;

    let media = post
        .get("media")
        .filter(|m| m.is_object())
        .ok_or_else(|| AttemptError::new(FailureKind::TransientServer, "Missing media data"))?;

    if let Some(link) = media
        .get("media_link")
        .and_then(Value::as_str)
        .filter(|l| !l.is_empty())
    {
        return Ok(link.to_string());
    }

    let filename = media
        .get("media")
        .and_then(Value::as_str)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AttemptError::new(FailureKind::TransientServer, "Missing media data"))?;

    let board = board_from_url(lookup_url)
        .or_else(|| {
            post.pointer("/board/shortname")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .ok_or_else(|| {
            AttemptError::new(FailureKind::FatalClient, "cannot determine board for media")
        })?;

    Ok(cdn_pattern
        .replace("{board}", &board)
        .replace("{filename}", filename))
}

/// Resolve phase handler: archive API response to media URL
struct LookupHandler {
    cdn_patterns: HashMap<String, String>,
}

#[async_trait]
impl AttemptHandler for LookupHandler {
    type Payload = String;

    async fn handle(
        &self,
        target: &Target,
        response: TransportResponse,
        _ctx: &AttemptContext,
    ) -> std::result::Result<String, AttemptError> {
        let body = response.ensure_success()?.bytes().await?;
        let json: Value =
            serde_json::from_slice(&body).map_err(|e| AttemptError::parse(e.to_string()))?;

        let cdn_pattern = target
            .slot()
            .and_then(|archive| self.cdn_patterns.get(archive))
            .ok_or_else(|| AttemptError::terminal(FailureKind::FatalClient, "unknown archive"))?;

        extract_media_url(&json, target.url(), cdn_pattern)
    }
}

/// Download phase handler: streams the body to `staging/<slot>`
struct DownloadHandler {
    sink: DownloadSink,
    staging: PathBuf,
}

#[async_trait]
impl AttemptHandler for DownloadHandler {
    type Payload = u64;

    async fn handle(
        &self,
        target: &Target,
        response: TransportResponse,
        ctx: &AttemptContext,
    ) -> std::result::Result<u64, AttemptError> {
        let filename = target.slot().ok_or_else(|| {
            AttemptError::terminal(FailureKind::FatalClient, "target has no staging filename")
        })?;
        let dest = self.staging.join(filename);

        match self
            .sink
            .with_read_timeout(target.options().timeout)
            .consume(&dest, response, &ctx.interrupt, &ctx.completion)
            .await?
        {
            SinkOutcome::Complete { bytes } => Ok(bytes),
            SinkOutcome::Stopped {
                reason: StopReason::Status(status),
                ..
            } => Err(AttemptError::new(
                FailureKind::from_status(status),
                format!("HTTP {}", status),
            )),
            SinkOutcome::Stopped { bytes, reason } => Err(AttemptError::terminal(
                FailureKind::Interrupted,
                format!("stopped after {} bytes ({:?})", bytes, reason),
            )),
        }
    }
}

/// Final state label of every target, keyed by canonical key
type OutcomeLabels = BTreeMap<String, String>;

/// Parameters of one download run
#[derive(Debug, Clone, Builder)]
pub struct ArchiveJob {
    /// Archive to resolve images against
    #[builder(into)]
    pub archive: String,
    /// Images wanted; 0 means the configured maximum
    #[builder(default)]
    pub amount: u64,
    /// Identifier of the source dataset, copied into the manifest
    #[builder(into)]
    pub source_id: String,
    /// Staging directory; defaults to `<staging_root>/<run id>`
    pub staging: Option<PathBuf>,
}

pub struct ArchiveDownloader {
    config: Config,
    transport: Arc<dyn Transport>,
    interrupt: CancellationToken,
    progress: watch::Sender<ProgressSnapshot>,
}

impl ArchiveDownloader {
    pub fn new(config: Config, transport: Arc<dyn Transport>, interrupt: CancellationToken) -> Self {
        let (progress, _) = watch::channel(ProgressSnapshot::default());
        Self {
            config,
            transport,
            interrupt,
            progress,
        }
    }

    /// Progress snapshots of the current run
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    /// Requested amount bounded by `downloads.max_images` (0 = unlimited)
    pub fn effective_cap(&self, amount: u64) -> u64 {
        match (amount, self.config.downloads.max_images) {
            (0, max) => max,
            (amount, 0) => amount,
            (amount, max) => amount.min(max),
        }
    }

    pub async fn run(&self, job: &ArchiveJob, records: &[SourceRecord]) -> Result<RunReport> {
        let run_id = Uuid::now_v7();
        let archive = self.config.archive(&job.archive)?;
        let fallback_name = self.config.downloads.fallback_archive.as_str();
        let fallback = self.config.archive(fallback_name)?;
        let cap = self.effective_cap(job.amount);

        info!(%run_id, archive = %job.archive, cap, records = records.len(), "Archive run started");

        if records.is_empty() {
            return Ok(RunReport::empty(run_id, "No images to download."));
        }

        let options = self.config.request_options(archive.verify_tls);
        let mut seen = HashSet::new();
        let lookups: Vec<Target> = records
            .iter()
            .filter_map(|record| {
                lookup_target(
                    record,
                    (job.archive.as_str(), archive),
                    (fallback_name, fallback),
                    &options,
                )
            })
            .filter(|target| seen.insert(target.key().clone()))
            .collect();

        if lookups.is_empty() {
            return Ok(RunReport::empty(
                run_id,
                "No archive API urls found in the source records.",
            ));
        }
        info!(lookups = lookups.len(), "Collected lookup urls");

        let staging = job
            .staging
            .clone()
            .unwrap_or_else(|| self.config.downloads.staging_root.join(run_id.to_string()));
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| RunError::io(&staging, e))?;

        let mut ledger = ProgressLedger::with_publisher(cap, self.progress.clone());
        ledger.record(LedgerEvent::Discovered(lookups.len() as u64));
        let mut labels = OutcomeLabels::new();

        let resolved = self
            .resolve(archive, lookups, cap, &mut ledger, &mut labels)
            .await;
        if self.interrupt.is_cancelled() {
            for entry in resolved.iter() {
                labels.insert(entry.key.to_string(), "not_attempted".to_string());
            }
            remove_staging(&staging).await;
            return Ok(RunReport::cancelled(run_id, ledger.snapshot()).with_outcomes(labels));
        }
        ledger.record(LedgerEvent::ResolveFinished);

        if resolved.is_empty() {
            remove_staging(&staging).await;
            return Ok(RunReport::empty(run_id, "No image URLs found after API search.")
                .with_counters(ledger.snapshot())
                .with_outcomes(labels));
        }

        self.download(job, archive, &staging, &resolved, &mut ledger, &mut labels)
            .await;
        if self.interrupt.is_cancelled() {
            remove_staging(&staging).await;
            return Ok(RunReport::cancelled(run_id, ledger.snapshot()).with_outcomes(labels));
        }

        // files of targets that did not succeed, including over-cap leftovers
        for entry in resolved.iter() {
            let success = ledger.outcome(&entry.key).is_some_and(|o| o.success);
            if !success {
                remove_file(&staging.join(&entry.filename)).await;
            }
        }

        let manifest = Manifest::from_ledger(&ledger);
        let path = manifest.write(&staging).await?;
        let successes = manifest.successes();

        info!(%run_id, successes, manifest = %path.display(), "Archive run finished");

        Ok(RunReport::new(
            run_id,
            RunStatus::Completed,
            format!("Downloaded {} of {} image(s)", successes, resolved.len()),
        )
        .with_successes(successes)
        .with_counters(ledger.snapshot())
        .with_output(path)
        .with_outcomes(labels))
    }

    async fn resolve(
        &self,
        archive: &ArchiveConfig,
        lookups: Vec<Target>,
        cap: u64,
        ledger: &mut ProgressLedger,
        labels: &mut OutcomeLabels,
    ) -> ResolvedUrls {
        let handler = LookupHandler {
            cdn_patterns: self
                .config
                .archives
                .iter()
                .map(|(name, a)| (name.clone(), a.cdn_pattern.clone()))
                .collect(),
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.transport),
            handler,
            self.config.retry_policy(),
            self.interrupt.clone(),
        )
        .with_options(OrchestratorOptions {
            concurrency: archive.concurrency,
            dispatch_interval: archive.request_interval.as_duration(),
        });

        let mut submission = orchestrator.submit(lookups);
        let mut resolved = ResolvedUrls::new();

        while let Some((target, outcome)) = submission.next().await {
            match outcome {
                Outcome::Success { payload: url, .. } => {
                    match resolved.insert(target.key().clone(), &url) {
                        Some(entry) => {
                            debug!(lookup = %target.key(), url = %entry.url, "Image url resolved");
                            ledger.record(LedgerEvent::Retrieved);
                        }
                        None => {
                            ledger.record(LedgerEvent::ResolveSkipped);
                            labels.insert(target.key().to_string(), "duplicate".to_string());
                        }
                    }
                    info!(
                        retrieved = resolved.len(),
                        cap,
                        "Retrieved image URLs"
                    );
                }
                Outcome::Failed(failure) => {
                    warn!(
                        lookup = %target.key(),
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "Lookup failed"
                    );
                    ledger.record(LedgerEvent::ResolveFailed);
                    labels.insert(target.key().to_string(), failure.kind.to_string());
                }
                abandoned @ Outcome::Abandoned { .. } => {
                    labels.insert(target.key().to_string(), abandoned.label());
                }
            }

            if cap > 0 && resolved.len() as u64 >= cap && !submission.is_stopped() {
                info!(cap, "Enough image URLs, stopping lookups");
                submission.stop();
            }
        }

        resolved
    }

    async fn download(
        &self,
        job: &ArchiveJob,
        archive: &ArchiveConfig,
        staging: &Path,
        resolved: &ResolvedUrls,
        ledger: &mut ProgressLedger,
        labels: &mut OutcomeLabels,
    ) {
        let cap = ledger.snapshot().cap;
        let take = if cap > 0 {
            usize::try_from(cap).unwrap_or(usize::MAX)
        } else {
            resolved.len()
        };
        let wanted = take.min(resolved.len());

        let options = RequestOptions {
            stream: true,
            ..self.config.request_options(archive.verify_tls)
        };
        let targets: Vec<Target> = resolved
            .iter()
            .take(take)
            .map(|entry| {
                Target::new(entry.key.clone(), entry.url.clone(), options.clone())
                    .with_slot(entry.filename.clone())
            })
            .collect();

        let record = |ledger: &mut ProgressLedger, key: &CanonicalKey, success: bool| {
            resolved.get(key).map(|entry| {
                ledger.record(LedgerEvent::Download {
                    key: key.clone(),
                    outcome: DownloadOutcome {
                        filename: entry.filename.clone(),
                        url: entry.url.clone(),
                        success,
                        from_dataset: job.source_id.clone(),
                    },
                })
            })
        };

        // resolved past the cap: never attempted
        for entry in resolved.iter().skip(take) {
            record(ledger, &entry.key, false);
            labels.insert(entry.key.to_string(), "over_cap".to_string());
        }

        info!(count = wanted, "Starting image downloads");

        let handler = DownloadHandler {
            sink: DownloadSink::new(self.config.engine.chunk_size.as_usize()),
            staging: staging.to_path_buf(),
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.transport),
            handler,
            self.config.retry_policy(),
            self.interrupt.clone(),
        )
        .with_options(self.config.orchestrator_options());

        let mut submission = orchestrator.submit(targets);

        while let Some((target, outcome)) = submission.next().await {
            let success = outcome.is_success();
            let recorded = record(ledger, target.key(), success);
            let label = match recorded {
                Some(Recorded::OverCap) => "over_cap".to_string(),
                _ => outcome.label(),
            };
            labels.insert(target.key().to_string(), label);

            if !success || recorded == Some(Recorded::OverCap) {
                if !success {
                    warn!(url = target.url(), outcome = %outcome.label(), "Download failed");
                }
                if let Some(filename) = target.slot() {
                    remove_file(&staging.join(filename)).await;
                }
            } else {
                info!(
                    downloaded = ledger.snapshot().downloaded,
                    wanted,
                    "Downloaded file"
                );
            }

            if cap > 0 && ledger.snapshot().downloaded >= cap && !submission.is_stopped() {
                info!(cap, "Download cap reached, stopping transfers");
                submission.stop();
            }
        }
    }
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete partial file");
        }
    }
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging area");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn archives() -> Config {
        Config::default()
    }

    fn record(board: &str, id: u64, md5: Option<&str>, ext: &str) -> SourceRecord {
        SourceRecord {
            board: board.to_string(),
            id: id.to_string(),
            md5: md5.map(str::to_string),
            ext: Some(ext.to_string()),
        }
    }

    #[test]
    fn test_records_parse_numeric_ids() {
        let input = r#"{"board": "g", "id": 123, "md5": "abc==", "ext": ".png"}

{"board": "pol", "id": "456", "md5": null}
"#;
        let records = SourceRecord::parse_ndjson(input).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "123");
        assert!(records[0].has_image());
        assert!(!records[1].has_image());
    }

    #[test]
    fn test_invalid_record_reports_line() {
        let err = SourceRecord::parse_ndjson("{\"board\": \"g\"}\nnot json\n").unwrap_err();
        assert!(matches!(err, RunError::Record { line: 2, .. }));
    }

    #[test]
    fn test_videos_are_skipped() {
        assert!(!record("g", 1, Some("m"), ".webm").has_image());
        assert!(!record("g", 1, Some("m"), "mp4").has_image());
        assert!(record("g", 1, Some("m"), ".jpg").has_image());
    }

    #[test]
    fn test_lookup_targets() {
        let config = archives();
        let plebs = config.archive("fourplebs").unwrap();
        let desu = config.archive("desuarchive").unwrap();
        let options = RequestOptions::default();

        let direct = lookup_target(
            &record("pol", 42, Some("abc/def=="), ".jpg"),
            ("fourplebs", plebs),
            ("desuarchive", desu),
            &options,
        )
        .unwrap();
        assert_eq!(
            direct.url(),
            "https://archive.4plebs.org/_/api/chan/post/?board=pol&num=42"
        );
        assert_eq!(direct.slot(), Some("fourplebs"));

        let search = lookup_target(
            &record("g", 7, Some("abc/def=="), ".jpg"),
            ("fourplebs", plebs),
            ("desuarchive", desu),
            &options,
        )
        .unwrap();
        assert!(search
            .url()
            .starts_with("https://desuarchive.org/_/api/chan/search/?image="));
        assert_eq!(search.slot(), Some("desuarchive"));

        assert!(lookup_target(
            &record("g", 7, None, ".jpg"),
            ("fourplebs", plebs),
            ("desuarchive", desu),
            &options
        )
        .is_none());
    }

    #[test]
    fn test_media_link_is_used_directly() {
        let body = json!({"media": {"media_link": "https://i.4pcdn.org/pol/1.jpg", "media": "1.jpg"}});
        let url = extract_media_url(&body, "https://a.example/?board=pol", "{board}/{filename}").unwrap();
        assert_eq!(url, "https://i.4pcdn.org/pol/1.jpg");
    }

    #[test]
    fn test_search_hits_are_normalized() {
        let body = json!({"0": {"posts": [{"media": {"media": "99.png"}}]}});
        let url = extract_media_url(
            &body,
            "https://desuarchive.org/_/api/chan/post/?board=g&num=1",
            "https://cdn.example/{board}/image/{filename}",
        )
        .unwrap();
        assert_eq!(url, "https://cdn.example/g/image/99.png");
    }

    #[test]
    fn test_board_falls_back_to_post() {
        let body = json!({"0": {"posts": [{"board": {"shortname": "tg"}, "media": {"media": "5.gif"}}]}});
        let url = extract_media_url(
            &body,
            "https://desuarchive.org/_/api/chan/search/?image=abc",
            "https://cdn.example/{board}/{filename}",
        )
        .unwrap();
        assert_eq!(url, "https://cdn.example/tg/5.gif");
    }

    #[test]
    fn test_limit_exceeded_is_rate_limited() {
        let body = json!({"error": "API search limit exceeded. Please wait."});
        let err = extract_media_url(&body, "https://a.example/", "{filename}").unwrap_err();
        assert_eq!(err.kind, FailureKind::RateLimited);

        let body = json!({"error": "No results found."});
        let err = extract_media_url(&body, "https://a.example/", "{filename}").unwrap_err();
        assert_eq!(err.kind, FailureKind::FatalClient);
    }

    #[test]
    fn test_missing_media_is_transient() {
        let err = extract_media_url(&json!({"num": 1}), "https://a.example/", "{filename}")
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::TransientServer);
    }

    #[test]
    fn test_effective_cap() {
        let transport: Arc<dyn Transport> = Arc::new(crate::transport::ScriptedTransport::new());
        let mut config = archives();
        config.downloads.max_images = 100;
        let downloader = ArchiveDownloader::new(config.clone(), transport.clone(), CancellationToken::new());

        assert_eq!(downloader.effective_cap(0), 100);
        assert_eq!(downloader.effective_cap(20), 20);
        assert_eq!(downloader.effective_cap(500), 100);

        config.downloads.max_images = 0;
        let unlimited = ArchiveDownloader::new(config, transport, CancellationToken::new());
        assert_eq!(unlimited.effective_cap(0), 0);
        assert_eq!(unlimited.effective_cap(500), 500);
    }
}
