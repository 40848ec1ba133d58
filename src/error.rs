//! Run-level errors
//!
//! Per-target failures never surface here; they are recorded as outcomes.
//! A `RunError` means the run as a whole could not produce its artifact.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::connectors::search::QueryError;
use crate::engine::PaginationError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid query: {0}")]
    Query(#[from] QueryError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("{source} ({partial} records collected before the failure)")]
    Pagination {
        source: PaginationError,
        partial: usize,
        /// NDJSON file holding the partial records, if any were collected
        output: Option<PathBuf>,
    },

    #[error("Invalid source record on line {line}: {source}")]
    Record {
        line: usize,
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        source: serde_json::Error,
    },
}

impl RunError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;
