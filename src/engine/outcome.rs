use serde::Serialize;
use std::fmt;

use super::retry::FailureKind;

/// Error produced by a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub kind: FailureKind,
    pub reason: String,
    /// Skip the retry policy even for retryable kinds. Set for failures that
    /// happen after a streamed body has started to land on disk.
    pub terminal: bool,
}

impl AttemptError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            terminal: false,
        }
    }

    pub fn terminal(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            terminal: true,
        }
    }

    pub fn rate_limited(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, reason)
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::ParseError, reason)
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for AttemptError {}

/// Terminal failure of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
    /// Attempts made, including the last one
    pub attempts: u32,
}

/// Terminal state of a target, emitted exactly once per canonical key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<P> {
    Success { payload: P, attempts: u32 },
    Failed(Failure),
    /// The run stopped (cap reached or interrupted) before the target
    /// finished. `attempts == 0` means it was never dispatched.
    Abandoned { attempts: u32, interrupted: bool },
}

impl<P> Outcome<P> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&P> {
        match self {
            Outcome::Success { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<P> {
        match self {
            Outcome::Success { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Success { attempts, .. } => *attempts,
            Outcome::Failed(failure) => failure.attempts,
            Outcome::Abandoned { attempts, .. } => *attempts,
        }
    }

    /// Short label for logs and manifests
    pub fn label(&self) -> String {
        match self {
            Outcome::Success { .. } => "success".to_string(),
            Outcome::Failed(failure) => failure.kind.to_string(),
            Outcome::Abandoned { attempts: 0, .. } => "not_attempted".to_string(),
            Outcome::Abandoned { .. } => "not_completed".to_string(),
        }
    }
}
