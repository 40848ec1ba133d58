//! Fetch engine: retry policy, dedup, orchestration, pagination, streaming
//! sink and progress bookkeeping. Connectors compose these pieces.

pub mod dedup;
pub mod orchestrator;
pub mod outcome;
pub mod pagination;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod target;

pub use dedup::{CanonicalKey, DedupIndex, ResolvedUrl, ResolvedUrls};
pub use orchestrator::{
    AttemptContext, AttemptHandler, DispatchStats, Orchestrator, OrchestratorOptions, Submission,
};
pub use outcome::{AttemptError, Failure, Outcome};
pub use pagination::{
    Collected, Page, PageSource, PaginationError, PaginationOptions, Paginator, Partial,
};
pub use progress::{
    DownloadOutcome, LedgerEvent, ProgressCounters, ProgressLedger, ProgressSnapshot, Recorded,
};
pub use retry::{Decision, FailureKind, RetryPolicy, RetryState};
pub use sink::{DownloadSink, SinkError, SinkOutcome, StopReason};
pub use target::{RequestOptions, Target};
