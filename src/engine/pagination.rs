//! Cursor-driven pagination over the orchestrator
//!
//! Every page is a one-target submission, so a page gets the full retry
//! policy. On top of that, a page whose submission fails is resubmitted
//! until `max_page_failures` consecutive failures, which aborts the run.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::orchestrator::{AttemptContext, AttemptHandler, Orchestrator, OrchestratorOptions};
use super::outcome::{AttemptError, Failure, Outcome};
use super::retry::{FailureKind, RetryPolicy};
use super::target::Target;
use crate::transport::{Transport, TransportResponse};

/// One decoded page
#[derive(Debug, Clone, PartialEq)]
pub struct Page<I> {
    pub items: Vec<I>,
    /// Total hit count, when the service reports one
    pub total: Option<u64>,
    /// Opaque token for the next page; `None` means last page
    pub cursor: Option<String>,
}

/// Remote paginated collection
pub trait PageSource: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Request for the page following `cursor` (`None` for the first page)
    fn request(&self, cursor: Option<&str>) -> Target;

    fn parse(&self, body: &[u8]) -> Result<Page<Self::Item>, AttemptError>;

    /// Error for a non-2xx page response; `body` is whatever the server sent
    fn reject(&self, status: u16, body: &[u8]) -> AttemptError {
        let _ = body;
        AttemptError::new(FailureKind::from_status(status), format!("HTTP {}", status))
    }
}

/// Attempt handler buffering a page body and handing it to the source
pub struct PageHandler<S> {
    source: S,
}

#[async_trait]
impl<S: PageSource> AttemptHandler for PageHandler<S> {
    type Payload = Page<S::Item>;

    async fn handle(
        &self,
        _target: &Target,
        response: TransportResponse,
        _ctx: &AttemptContext,
    ) -> Result<Self::Payload, AttemptError> {
        if !response.is_success() {
            let status = response.status;
            let body = response.bytes().await.unwrap_or_default();
            return Err(self.source.reject(status, &body));
        }

        let body: Bytes = response.bytes().await?;
        self.source.parse(&body)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("pagination interrupted after {pages} pages")]
    Interrupted { pages: u32 },

    #[error("page {page} failed {failures} times in a row ({kind}: {reason})")]
    Aborted {
        page: u32,
        failures: u32,
        kind: FailureKind,
        reason: String,
    },
}

/// Everything gathered by a pagination run
#[derive(Debug, Clone, PartialEq)]
pub struct Collected<I> {
    pub items: Vec<I>,
    pub pages: u32,
    pub total: Option<u64>,
}

/// A run that ended in error, with whatever was gathered before
#[derive(Debug)]
pub struct Partial<I> {
    pub error: PaginationError,
    pub collected: Collected<I>,
}

impl<I> fmt::Display for Partial<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} records collected)",
            self.error,
            self.collected.items.len()
        )
    }
}

impl<I: fmt::Debug> std::error::Error for Partial<I> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone)]
pub struct PaginationOptions {
    /// Stop once this many records were collected; 0 = unlimited
    pub max_records: u64,
    pub courtesy_delay: Duration,
    pub max_page_failures: u32,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            max_records: 0,
            courtesy_delay: Duration::from_millis(500),
            max_page_failures: 3,
        }
    }
}

/// Lazy, finite, non-restartable page sequence
pub struct Paginator<S: PageSource> {
    orchestrator: Orchestrator<PageHandler<S>>,
    options: PaginationOptions,
    cursor: Option<String>,
    pages: u32,
    retrieved: u64,
    total: Option<u64>,
    done: bool,
}

impl<S: PageSource> Paginator<S> {
    pub fn new(
        transport: Arc<dyn Transport>,
        source: S,
        policy: RetryPolicy,
        interrupt: CancellationToken,
        options: PaginationOptions,
    ) -> Self {
        let orchestrator = Orchestrator::new(transport, PageHandler { source }, policy, interrupt)
            .with_options(OrchestratorOptions {
                concurrency: 1,
                dispatch_interval: Duration::ZERO,
            });

        Self {
            orchestrator,
            options,
            cursor: None,
            pages: 0,
            retrieved: 0,
            total: None,
            done: false,
        }
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn retrieved(&self) -> u64 {
        self.retrieved
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// `retrieved / max(total, 1)` clamped to [0, 1]; `None` while the
    /// total is unknown
    pub fn progress(&self) -> Option<f64> {
        self.total
            .map(|total| (self.retrieved as f64 / total.max(1) as f64).clamp(0.0, 1.0))
    }

    /// Fetch the next page. `Ok(None)` once a stop condition was met.
    pub async fn next_page(&mut self) -> Result<Option<Vec<S::Item>>, PaginationError> {
        if self.done {
            return Ok(None);
        }

        let interrupt = self.orchestrator.interrupt().clone();

        if self.pages > 0 && !self.options.courtesy_delay.is_zero() {
            tokio::select! {
                _ = interrupt.cancelled() => {}
                _ = tokio::time::sleep(self.options.courtesy_delay) => {}
            }
        }

        let page = self.fetch(&interrupt).await.inspect_err(|_| {
            self.done = true;
        })?;

        self.pages += 1;
        if page.total.is_some() {
            self.total = page.total;
        }
        self.retrieved += page.items.len() as u64;

        info!(
            page = self.pages,
            items = page.items.len(),
            retrieved = self.retrieved,
            total = ?self.total,
            progress = ?self.progress(),
            "Page fetched"
        );

        if page.items.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let cap_reached = self.options.max_records > 0 && self.retrieved >= self.options.max_records;
        // a repeated cursor would map to an already accepted page key
        let stalled = page.cursor.is_some() && page.cursor == self.cursor;
        if page.cursor.is_none() || cap_reached || stalled {
            self.done = true;
        }
        self.cursor = page.cursor;

        Ok(Some(page.items))
    }

    async fn fetch(&mut self, interrupt: &CancellationToken) -> Result<Page<S::Item>, PaginationError> {
        let page_no = self.pages + 1;
        let mut failures = 0;

        loop {
            if interrupt.is_cancelled() {
                return Err(PaginationError::Interrupted { pages: self.pages });
            }

            let request = self
                .orchestrator
                .handler()
                .source
                .request(self.cursor.as_deref());
            let mut submission = self.orchestrator.submit([request]);

            let failure: Failure = match submission.next().await {
                Some((_, Outcome::Success { payload, .. })) => return Ok(payload),
                Some((_, Outcome::Failed(failure))) => failure,
                Some((_, Outcome::Abandoned { .. })) | None => {
                    return Err(PaginationError::Interrupted { pages: self.pages });
                }
            };

            failures += 1;
            let fatal = matches!(failure.kind, FailureKind::FatalClient | FailureKind::ParseError);

            if fatal || failures >= self.options.max_page_failures {
                warn!(page = page_no, failures, kind = %failure.kind, "Pagination aborted");
                return Err(PaginationError::Aborted {
                    page: page_no,
                    failures,
                    kind: failure.kind,
                    reason: failure.reason,
                });
            }

            warn!(
                page = page_no,
                failures,
                kind = %failure.kind,
                reason = %failure.reason,
                "Page failed, resubmitting"
            );
        }
    }

    /// Drive the sequence to its end
    pub async fn collect_all(mut self) -> Result<Collected<S::Item>, Partial<S::Item>> {
        let mut items = Vec::new();

        loop {
            match self.next_page().await {
                Ok(Some(page)) => items.extend(page),
                Ok(None) => break,
                Err(error) => {
                    return Err(Partial {
                        error,
                        collected: Collected {
                            items,
                            pages: self.pages,
                            total: self.total,
                        },
                    });
                }
            }
        }

        Ok(Collected {
            items,
            pages: self.pages,
            total: self.total,
        })
    }
}
