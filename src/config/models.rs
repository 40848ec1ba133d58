use crate::humanize::{ByteSize, HumanDuration};
use crate::transport::TransportProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default = "default_archives")]
    pub archives: BTreeMap<String, ArchiveConfig>,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            downloads: DownloadsConfig::default(),
            archives: default_archives(),
            search: SearchConfig::default(),
        }
    }
}

/// Orchestrator and transport settings shared by every connector
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_unit")]
    pub backoff_unit: HumanDuration,
    /// Cap for rate-limit backoff, in backoff units
    #[serde(default = "default_rate_limit_cap")]
    pub rate_limit_cap: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_unit: default_backoff_unit(),
            rate_limit_cap: default_rate_limit_cap(),
            request_timeout: default_request_timeout(),
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_unit() -> HumanDuration {
    HumanDuration::from_secs(1)
}

fn default_rate_limit_cap() -> u32 {
    60
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(20)
}

fn default_chunk_size() -> ByteSize {
    ByteSize(1024)
}

fn default_user_agent() -> String {
    format!("bulkfetch/{}", env!("CARGO_PKG_VERSION"))
}

/// Image download connector settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadsConfig {
    /// Hard ceiling on images per run; 0 = unlimited
    #[serde(default = "default_max_images")]
    pub max_images: u64,
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    #[serde(default = "default_archive")]
    pub default_archive: String,
    /// Archive used for md5 searches of boards the selected archive lacks
    #[serde(default = "default_fallback_archive")]
    pub fallback_archive: String,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_images: default_max_images(),
            staging_root: default_staging_root(),
            default_archive: default_archive(),
            fallback_archive: default_fallback_archive(),
        }
    }
}

fn default_max_images() -> u64 {
    1000
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("data/staging")
}

fn default_archive() -> String {
    "desuarchive".to_string()
}

fn default_fallback_archive() -> String {
    "desuarchive".to_string()
}

/// One image archive exposing a post lookup and an md5 search API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArchiveConfig {
    pub api_base: String,
    /// Media URL template with `{board}` and `{filename}` placeholders
    pub cdn_pattern: String,
    #[serde(default)]
    pub boards: Vec<String>,
    #[serde(default)]
    pub profile: TransportProfile,
    #[serde(default = "default_archive_concurrency")]
    pub concurrency: usize,
    /// Courtesy gap between two lookups
    #[serde(default)]
    pub request_interval: HumanDuration,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

impl ArchiveConfig {
    pub fn hosts_board(&self, board: &str) -> bool {
        self.boards.iter().any(|b| b == board)
    }
}

fn default_archive_concurrency() -> usize {
    4
}

fn default_verify_tls() -> bool {
    true
}

fn boards(names: &[&str]) -> Vec<String> {
    names.iter().map(|b| b.to_string()).collect()
}

fn default_archives() -> BTreeMap<String, ArchiveConfig> {
    let mut archives = BTreeMap::new();
    archives.insert(
        "fourplebs".to_string(),
        ArchiveConfig {
            api_base: "https://archive.4plebs.org".to_string(),
            cdn_pattern: "https://i.4pcdn.org/{board}/{filename}".to_string(),
            boards: boards(&[
                "adv", "f", "hr", "mlpol", "mo", "o", "pol", "s4s", "sp", "tg", "trv", "tv", "x",
            ]),
            profile: TransportProfile::Browser,
            concurrency: 1,
            request_interval: HumanDuration::from_secs(1),
            verify_tls: true,
        },
    );
    archives.insert(
        "desuarchive".to_string(),
        ArchiveConfig {
            api_base: "https://desuarchive.org".to_string(),
            cdn_pattern: "https://desu-usergeneratedcontent.xyz/{board}/image/{filename}"
                .to_string(),
            boards: boards(&[
                "a", "aco", "an", "c", "cgl", "co", "d", "fit", "g", "his", "int", "k", "m", "mlp",
                "mu", "q", "qa", "r9k", "tg", "trash", "vr", "wsg",
            ]),
            profile: TransportProfile::Standard,
            concurrency: 4,
            request_interval: HumanDuration::from_millis(500),
            verify_tls: false,
        },
    );
    archives
}

/// Paginated search service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    pub url: Option<String>,
    pub user: Option<String>,
    /// Loaded from `BULKFETCH_SEARCH_PASSWORD`, never from files
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(default = "default_courtesy_delay")]
    pub courtesy_delay: HumanDuration,
    #[serde(default = "default_max_page_failures")]
    pub max_page_failures: u32,
    /// Queries matching more hits than this need explicit confirmation
    #[serde(default = "default_confirm_above")]
    pub confirm_above: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            courtesy_delay: default_courtesy_delay(),
            max_page_failures: default_max_page_failures(),
            confirm_above: default_confirm_above(),
        }
    }
}

fn default_courtesy_delay() -> HumanDuration {
    HumanDuration::from_millis(500)
}

fn default_max_page_failures() -> u32 {
    3
}

fn default_confirm_above() -> u64 {
    50_000
}
