//! Retry decisions for failed attempts
//!
//! [`RetryPolicy::decide`] is a pure function of the failure count and the
//! failure kind. Sleeping and re-queueing belong to the orchestrator, which
//! keeps the per-key counters in a [`RetryState`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::dedup::CanonicalKey;

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// HTTP 429, or a "limit exceeded" message inside a 200 body
    RateLimited,
    /// Timeout, connection reset, TLS failure
    TransientNetwork,
    /// 5xx, or a body in the wrong shape that may succeed later
    TransientServer,
    /// 4xx other than 429; never retried
    FatalClient,
    /// Response is not in the expected shape
    ParseError,
    /// Operator-requested cancellation
    Interrupted,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::TransientNetwork | FailureKind::TransientServer
        )
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FailureKind::RateLimited,
            408 => FailureKind::TransientNetwork,
            500..=599 => FailureKind::TransientServer,
            _ => FailureKind::FatalClient,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::TransientServer => "transient_server",
            FailureKind::FatalClient => "fatal_client",
            FailureKind::ParseError => "parse_error",
            FailureKind::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { wait: Duration },
    GiveUp,
}

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
    /// One backoff "time unit"
    pub unit: Duration,
    /// Cap, in units, applied to rate-limit waits only
    pub rate_limit_cap: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unit: Duration::from_secs(1),
            rate_limit_cap: 60,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, unit: Duration) -> Self {
        Self {
            max_attempts,
            unit,
            ..Self::default()
        }
    }

    /// Decide what happens after the `failures`-th consecutive failure of a
    /// target. The next attempt is attempt number `failures`, and it waits
    /// `2^failures` units.
    pub fn decide(&self, failures: u32, kind: FailureKind) -> Decision {
        if !kind.is_retryable() || failures == 0 || failures > self.max_attempts {
            return Decision::GiveUp;
        }

        let exp = 2u64.saturating_pow(failures);
        let units = match kind {
            FailureKind::RateLimited => exp.min(u64::from(self.rate_limit_cap)),
            _ => exp,
        };

        let wait = self
            .unit
            .checked_mul(u32::try_from(units).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);

        Decision::Retry { wait }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    failures: u32,
    next_eligible: Instant,
}

/// Per-key failure counters. A missing entry means "never failed".
#[derive(Debug, Default)]
pub struct RetryState {
    entries: HashMap<CanonicalKey, RetryEntry>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure for `key` and return the new total
    pub fn record_failure(&mut self, key: &CanonicalKey) -> u32 {
        let entry = self.entries.entry(key.clone()).or_insert(RetryEntry {
            failures: 0,
            next_eligible: Instant::now(),
        });
        entry.failures += 1;
        entry.failures
    }

    pub fn schedule(&mut self, key: &CanonicalKey, wait: Duration) -> Instant {
        let at = Instant::now() + wait;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.next_eligible = at;
        }
        at
    }

    pub fn failures(&self, key: &CanonicalKey) -> u32 {
        self.entries.get(key).map(|e| e.failures).unwrap_or(0)
    }

    pub fn next_eligible(&self, key: &CanonicalKey) -> Option<Instant> {
        self.entries.get(key).map(|e| e.next_eligible)
    }

    /// Drop the entry once the key reaches a terminal outcome
    pub fn clear(&mut self, key: &CanonicalKey) -> u32 {
        self.entries.remove(key).map(|e| e.failures).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();

        for k in 1..=3 {
            assert_eq!(
                policy.decide(k, FailureKind::TransientNetwork),
                Decision::Retry {
                    wait: Duration::from_secs(2u64.pow(k))
                }
            );
        }
    }

    #[test]
    fn test_gives_up_on_fourth_failure() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(3, FailureKind::TransientServer),
            Decision::Retry { .. }
        ));
        assert_eq!(policy.decide(4, FailureKind::TransientServer), Decision::GiveUp);
    }

    #[test]
    fn test_fatal_kinds_never_retry() {
        let policy = RetryPolicy::default();
        for kind in [
            FailureKind::FatalClient,
            FailureKind::ParseError,
            FailureKind::Interrupted,
        ] {
            assert_eq!(policy.decide(1, kind), Decision::GiveUp);
        }
    }

    #[test]
    fn test_rate_limit_wait_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            unit: Duration::from_secs(1),
            rate_limit_cap: 60,
        };

        assert_eq!(
            policy.decide(6, FailureKind::RateLimited),
            Decision::Retry {
                wait: Duration::from_secs(60)
            }
        );
        // generic transient errors are not capped
        assert_eq!(
            policy.decide(6, FailureKind::TransientNetwork),
            Decision::Retry {
                wait: Duration::from_secs(64)
            }
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(FailureKind::from_status(429), FailureKind::RateLimited);
        assert_eq!(FailureKind::from_status(503), FailureKind::TransientServer);
        assert_eq!(FailureKind::from_status(404), FailureKind::FatalClient);
        assert_eq!(FailureKind::from_status(408), FailureKind::TransientNetwork);
    }

    #[tokio::test]
    async fn test_retry_state_lifecycle() {
        let mut state = RetryState::new();
        let key = CanonicalKey::from_raw("https://example.com/a");

        assert_eq!(state.failures(&key), 0);
        assert_eq!(state.record_failure(&key), 1);
        assert_eq!(state.record_failure(&key), 2);
        assert!(state.next_eligible(&key).is_some());

        assert_eq!(state.clear(&key), 2);
        assert!(state.is_empty());
        assert_eq!(state.failures(&key), 0);
    }
}
