//! Connectors compose the engine into complete runs
//!
//! - `archive`: resolve image URLs through an archive API, then download
//!   them into a staging directory with a manifest
//! - `search`: collect every hit of a paginated search into NDJSON

pub mod archive;
pub mod manifest;
pub mod search;

pub use archive::{ArchiveDownloader, ArchiveJob, SourceRecord};
pub use manifest::{MANIFEST_FILE, Manifest};
pub use search::{QueryError, SearchJob, SearchRunner};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::engine::ProgressCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Finished; individual targets may still have failed
    Completed,
    /// Nothing to fetch; a clean zero-result run
    Empty,
    /// Interrupted; archive staging is discarded, search keeps the records
    /// collected so far
    Cancelled,
}

/// Terminal summary of a connector run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub message: String,
    /// Successfully fetched items (images or records)
    pub successes: u64,
    pub counters: ProgressCounters,
    /// Manifest or output file, when one was written
    pub output: Option<PathBuf>,
    /// Final state of every target of the run, by canonical key
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<String, String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(run_id: Uuid, status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            run_id,
            status,
            message: message.into(),
            successes: 0,
            counters: ProgressCounters::default(),
            output: None,
            outcomes: BTreeMap::new(),
            finished_at: Utc::now(),
        }
    }

    pub fn empty(run_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(run_id, RunStatus::Empty, message)
    }

    pub fn cancelled(run_id: Uuid, counters: ProgressCounters) -> Self {
        Self {
            counters,
            ..Self::new(run_id, RunStatus::Cancelled, "Interrupted")
        }
    }

    pub fn with_counters(mut self, counters: ProgressCounters) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_successes(mut self, successes: u64) -> Self {
        self.successes = successes;
        self
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_outcomes(mut self, outcomes: BTreeMap<String, String>) -> Self {
        self.outcomes = outcomes;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_status() {
        let report = RunReport::empty(Uuid::now_v7(), "No images to download.");
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "empty");
        assert_eq!(json["successes"], 0);
        assert!(json["finished_at"].is_i64());
        assert!(json.get("outcomes").is_none());
    }

    #[test]
    fn test_cancelled_report_keeps_counters() {
        let counters = ProgressCounters {
            discovered: 10,
            retrieved: 4,
            ..ProgressCounters::default()
        };
        let report = RunReport::cancelled(Uuid::now_v7(), counters);

        assert!(report.is_cancelled());
        assert_eq!(report.counters.retrieved, 4);

        let outcomes = BTreeMap::from([("https://cdn.example/1.png".to_string(), "not_attempted".to_string())]);
        let json = serde_json::to_value(report.with_outcomes(outcomes)).unwrap();
        assert_eq!(json["outcomes"]["https://cdn.example/1.png"], "not_attempted");
    }
}
