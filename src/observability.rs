//! Tracing setup and progress logging

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::engine::ProgressSnapshot;

const DEFAULT_FILTER: &str = "bulkfetch=info";

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Logs go to stderr so stdout stays free for the run report.
pub fn init_tracing(default_filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // a second init (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Log every change of the run's completion fraction until the sender goes
/// away
pub async fn log_progress(mut rx: watch::Receiver<ProgressSnapshot>) {
    let mut last_percent = None;
    while rx.changed().await.is_ok() {
        let snapshot = *rx.borrow_and_update();
        let percent = (snapshot.fraction * 100.0).floor() as u32;
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            info!(
                percent,
                retrieved = snapshot.counters.retrieved,
                downloaded = snapshot.counters.downloaded,
                failed = snapshot.counters.failed,
                "Progress"
            );
        }
    }
}
