//! Run bookkeeping: counters, completion fraction and per-target outcomes
//!
//! The ledger is owned by the single consumer of the orchestrator's result
//! stream, so it needs no locking. Observers get snapshots through a
//! `watch` channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::debug;

use super::dedup::CanonicalKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    /// Lookups planned in the resolve phase
    pub discovered: u64,
    /// Lookups that produced a downloadable URL
    pub retrieved: u64,
    pub downloaded: u64,
    /// Failed lookups plus non-successful downloads
    pub failed: u64,
    /// Download cap; 0 = unlimited
    pub cap: u64,
}

/// Final state of one resolved URL, as written to the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub filename: String,
    pub url: String,
    pub success: bool,
    pub from_dataset: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Discovered(u64),
    Retrieved,
    /// Lookup finished without a new URL (duplicate media)
    ResolveSkipped,
    ResolveFailed,
    /// No further lookups will be made (done, or cap reached)
    ResolveFinished,
    Download {
        key: CanonicalKey,
        outcome: DownloadOutcome,
    },
}

/// What [`ProgressLedger::record`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Applied,
    /// Download outcome for a key that already has one
    Duplicate,
    /// Successful download past the cap, stored as unsuccessful
    OverCap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub counters: ProgressCounters,
    pub fraction: f64,
}

#[derive(Debug)]
pub struct ProgressLedger {
    counters: ProgressCounters,
    resolve_settled: u64,
    resolve_finished: bool,
    high_water: f64,
    outcomes: BTreeMap<CanonicalKey, DownloadOutcome>,
    publisher: watch::Sender<ProgressSnapshot>,
}

impl ProgressLedger {
    pub fn new(cap: u64) -> Self {
        let (publisher, _) = watch::channel(ProgressSnapshot::default());
        Self::with_publisher(cap, publisher)
    }

    /// Ledger publishing into an existing channel, so observers can
    /// subscribe before the run starts
    pub fn with_publisher(cap: u64, publisher: watch::Sender<ProgressSnapshot>) -> Self {
        let counters = ProgressCounters {
            cap,
            ..ProgressCounters::default()
        };
        publisher.send_replace(ProgressSnapshot {
            counters,
            fraction: 0.0,
        });

        Self {
            counters,
            resolve_settled: 0,
            resolve_finished: false,
            high_water: 0.0,
            outcomes: BTreeMap::new(),
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.publisher.subscribe()
    }

    pub fn record(&mut self, event: LedgerEvent) -> Recorded {
        let recorded = match event {
            LedgerEvent::Discovered(count) => {
                self.counters.discovered += count;
                Recorded::Applied
            }
            LedgerEvent::Retrieved => {
                self.counters.retrieved += 1;
                self.resolve_settled += 1;
                Recorded::Applied
            }
            LedgerEvent::ResolveSkipped => {
                self.resolve_settled += 1;
                Recorded::Applied
            }
            LedgerEvent::ResolveFailed => {
                self.resolve_settled += 1;
                self.counters.failed += 1;
                Recorded::Applied
            }
            LedgerEvent::ResolveFinished => {
                self.resolve_finished = true;
                Recorded::Applied
            }
            LedgerEvent::Download { key, mut outcome } => {
                if self.outcomes.contains_key(&key) {
                    debug!(key = %key, "Download outcome already recorded");
                    return Recorded::Duplicate;
                }

                let cap = self.counters.cap;
                let mut recorded = Recorded::Applied;
                if outcome.success && cap > 0 && self.counters.downloaded >= cap {
                    outcome.success = false;
                    recorded = Recorded::OverCap;
                }

                if outcome.success {
                    self.counters.downloaded += 1;
                } else {
                    self.counters.failed += 1;
                }
                self.outcomes.insert(key, outcome);
                recorded
            }
        };

        let fraction = self.fraction();
        self.publisher.send_replace(ProgressSnapshot {
            counters: self.counters,
            fraction,
        });
        recorded
    }

    /// `0.5 * resolve_fraction + 0.5 * download_fraction`, never decreasing
    pub fn fraction(&mut self) -> f64 {
        let c = &self.counters;

        let resolve = if self.resolve_finished {
            1.0
        } else if c.discovered == 0 {
            0.0
        } else {
            self.resolve_settled as f64 / c.discovered as f64
        };

        let download_total = if c.cap > 0 {
            c.retrieved.min(c.cap)
        } else {
            c.retrieved
        };
        let download = c.downloaded as f64 / download_total.max(1) as f64;

        let current = (0.5 * resolve.clamp(0.0, 1.0) + 0.5 * download.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        self.high_water = self.high_water.max(current);
        self.high_water
    }

    pub fn snapshot(&self) -> ProgressCounters {
        self.counters
    }

    pub fn outcome(&self, key: &CanonicalKey) -> Option<&DownloadOutcome> {
        self.outcomes.get(key)
    }

    /// Per-key outcomes, ordered by key
    pub fn outcomes(&self) -> &BTreeMap<CanonicalKey, DownloadOutcome> {
        &self.outcomes
    }

    pub fn successes(&self) -> usize {
        self.outcomes.values().filter(|o| o.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(ledger: &mut ProgressLedger, i: u64, success: bool) -> Recorded {
        ledger.record(LedgerEvent::Download {
            key: CanonicalKey::from_raw(format!("https://cdn.example/{}.png", i)),
            outcome: DownloadOutcome {
                filename: format!("{}.png", i),
                url: format!("https://cdn.example/{}.png", i),
                success,
                from_dataset: "ds-1".to_string(),
            },
        })
    }

    #[test]
    fn test_two_phase_fraction() {
        let mut ledger = ProgressLedger::new(100);
        ledger.record(LedgerEvent::Discovered(100));
        for _ in 0..50 {
            ledger.record(LedgerEvent::Retrieved);
        }
        assert_eq!(ledger.fraction(), 0.25);

        for _ in 0..50 {
            ledger.record(LedgerEvent::Retrieved);
        }
        for i in 0..25 {
            download(&mut ledger, i, true);
        }
        assert_eq!(ledger.fraction(), 0.625);
    }

    #[test]
    fn test_fraction_never_decreases() {
        let mut ledger = ProgressLedger::new(0);
        ledger.record(LedgerEvent::Discovered(2));
        ledger.record(LedgerEvent::Retrieved);
        ledger.record(LedgerEvent::Retrieved);
        download(&mut ledger, 0, true);
        let before = ledger.fraction();

        // more discovered work would lower the raw ratio
        ledger.record(LedgerEvent::Discovered(10));
        assert!(ledger.fraction() >= before);
    }

    #[test]
    fn test_outcome_recorded_once() {
        let mut ledger = ProgressLedger::new(0);
        assert_eq!(download(&mut ledger, 1, false), Recorded::Applied);
        assert_eq!(download(&mut ledger, 1, true), Recorded::Duplicate);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.downloaded, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(ledger.outcomes().len(), 1);
    }

    #[test]
    fn test_downloads_never_exceed_cap() {
        let mut ledger = ProgressLedger::new(2);
        download(&mut ledger, 1, true);
        download(&mut ledger, 2, true);
        assert_eq!(download(&mut ledger, 3, true), Recorded::OverCap);

        assert_eq!(ledger.snapshot().downloaded, 2);
        assert_eq!(ledger.successes(), 2);
        let key = CanonicalKey::from_raw("https://cdn.example/3.png");
        assert!(!ledger.outcome(&key).unwrap().success);
    }

    #[test]
    fn test_subscribers_see_snapshots() {
        let mut ledger = ProgressLedger::new(0);
        let rx = ledger.subscribe();
        ledger.record(LedgerEvent::Discovered(4));
        ledger.record(LedgerEvent::ResolveFinished);

        let snapshot = *rx.borrow();
        assert_eq!(snapshot.counters.discovered, 4);
        assert_eq!(snapshot.fraction, 0.5);
    }
}
