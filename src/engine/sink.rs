//! Streaming download sink with a completion gate
//!
//! Bodies are re-chunked to a fixed size and appended to the destination
//! file. Between two chunks the sink checks the interrupt and completion
//! tokens, so a raised flag stops the transfer after at most one chunk.
//!
//! An optional read timeout bounds the wait for each body chunk, not the
//! whole transfer: a slow but steady body always completes.

use bytes::BytesMut;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::outcome::AttemptError;
use super::retry::FailureKind;
use crate::transport::{TransportError, TransportResponse};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("body stream failed after {written} bytes: {source}")]
    Stream {
        written: u64,
        #[source]
        source: TransportError,
    },
}

impl From<SinkError> for AttemptError {
    /// Sink failures are never retried: bytes may already be on disk
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Io { .. } => AttemptError::terminal(FailureKind::FatalClient, err.to_string()),
            SinkError::Stream { ref source, .. } => {
                AttemptError::terminal(source.kind, err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    /// The caller signalled that enough targets were retrieved
    Completed,
    /// Non-2xx response; nothing was written
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Complete { bytes: u64 },
    Stopped { bytes: u64, reason: StopReason },
}

impl SinkOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, SinkOutcome::Complete { .. })
    }

    pub fn bytes(&self) -> u64 {
        match self {
            SinkOutcome::Complete { bytes } | SinkOutcome::Stopped { bytes, .. } => *bytes,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadSink {
    chunk_size: usize,
    read_timeout: Option<Duration>,
}

impl Default for DownloadSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DownloadSink {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            read_timeout: None,
        }
    }

    /// Fail the transfer when no body data arrives for `limit`
    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = Some(limit);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream `response` into `dest`, truncating any previous content.
    ///
    /// Returns `Stopped` when a flag is raised or the status is not 2xx; the
    /// partial file is left for the caller to delete.
    pub async fn consume(
        &self,
        dest: &Path,
        response: TransportResponse,
        interrupt: &CancellationToken,
        completion: &CancellationToken,
    ) -> Result<SinkOutcome, SinkError> {
        if !response.is_success() {
            return Ok(SinkOutcome::Stopped {
                bytes: 0,
                reason: StopReason::Status(response.status),
            });
        }

        let io_err = |source| SinkError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let mut file = File::create(dest).await.map_err(io_err)?;
        let mut body = response.body;
        let mut pending = BytesMut::with_capacity(self.chunk_size);
        let mut written: u64 = 0;

        let stop_reason = || {
            if interrupt.is_cancelled() {
                Some(StopReason::Interrupted)
            } else if completion.is_cancelled() {
                Some(StopReason::Completed)
            } else {
                None
            }
        };

        loop {
            let next = match self.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let source = TransportError::new(
                            FailureKind::TransientNetwork,
                            format!("no body data for {:?}", limit),
                        );
                        return Err(SinkError::Stream { written, source });
                    }
                },
                None => body.next().await,
            };

            let finished = match next {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    false
                }
                Some(Err(source)) => return Err(SinkError::Stream { written, source }),
                None => true,
            };

            while pending.len() >= self.chunk_size || (finished && !pending.is_empty()) {
                if let Some(reason) = stop_reason() {
                    debug!(path = %dest.display(), written, ?reason, "Download stopped");
                    return Ok(SinkOutcome::Stopped {
                        bytes: written,
                        reason,
                    });
                }

                let take = pending.len().min(self.chunk_size);
                let chunk = pending.split_to(take);

                if let Err(source) = file.write_all(&chunk).await {
                    // staging already removed by a finished run
                    if source.kind() == ErrorKind::NotFound {
                        if let Some(reason) = stop_reason() {
                            return Ok(SinkOutcome::Stopped {
                                bytes: written,
                                reason,
                            });
                        }
                    }
                    return Err(io_err(source));
                }
                written += take as u64;
            }

            if finished {
                break;
            }
        }

        if let Err(source) = file.flush().await {
            if source.kind() != ErrorKind::NotFound || stop_reason().is_none() {
                return Err(io_err(source));
            }
        }

        Ok(SinkOutcome::Complete { bytes: written })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use tempfile::TempDir;

    fn chunks(count: usize, size: usize) -> Vec<Bytes> {
        (0..count).map(|_| Bytes::from(vec![7u8; size])).collect()
    }

    #[tokio::test]
    async fn test_complete_download() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let body = stream::iter(chunks(3, 100).into_iter().map(Ok)).boxed();

        let outcome = DownloadSink::new(256)
            .consume(
                &dest,
                TransportResponse::new(200, body),
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SinkOutcome::Complete { bytes: 300 });
        assert_eq!(std::fs::read(&dest).unwrap().len(), 300);
    }

    #[tokio::test]
    async fn test_completion_flag_stops_mid_stream() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("big.bin");
        let completion = CancellationToken::new();

        let flag = completion.clone();
        let body = stream::iter(chunks(8, 256).into_iter().enumerate())
            .map(move |(i, chunk)| {
                if i == 2 {
                    flag.cancel();
                }
                Ok(chunk)
            })
            .boxed();

        let outcome = DownloadSink::new(256)
            .consume(
                &dest,
                TransportResponse::new(200, body),
                &CancellationToken::new(),
                &completion,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SinkOutcome::Stopped {
                bytes: 512,
                reason: StopReason::Completed
            }
        );
        assert!(!outcome.is_complete());
        assert_eq!(std::fs::read(&dest).unwrap().len(), 512);
    }

    #[tokio::test]
    async fn test_interrupt_wins_over_completion() {
        let dir = TempDir::new().unwrap();
        let interrupt = CancellationToken::new();
        let completion = interrupt.child_token();
        interrupt.cancel();

        let body = stream::iter(chunks(2, 256).into_iter().map(Ok)).boxed();
        let outcome = DownloadSink::new(256)
            .consume(
                &dir.path().join("x.bin"),
                TransportResponse::new(200, body),
                &interrupt,
                &completion,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SinkOutcome::Stopped {
                bytes: 0,
                reason: StopReason::Interrupted
            }
        );
    }

    #[tokio::test]
    async fn test_non_ok_status_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("missing.png");

        let outcome = DownloadSink::default()
            .consume(
                &dest,
                TransportResponse::from_bytes(404, "not found"),
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SinkOutcome::Stopped {
                bytes: 0,
                reason: StopReason::Status(404)
            }
        );
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_broken_stream_is_terminal() {
        let dir = TempDir::new().unwrap();
        let body = stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 300])),
            Err(TransportError::new(FailureKind::TransientNetwork, "reset")),
        ])
        .boxed();

        let err = DownloadSink::new(256)
            .consume(
                &dir.path().join("broken.bin"),
                TransportResponse::new(200, body),
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::Stream { written: 256, .. }));
        let attempt: AttemptError = err.into();
        assert!(attempt.terminal);
        assert_eq!(attempt.kind, FailureKind::TransientNetwork);
    }

    fn spaced(count: usize, size: usize, gap: Duration) -> TransportResponse {
        let body = stream::iter(chunks(count, size))
            .then(move |chunk| async move {
                tokio::time::sleep(gap).await;
                Ok(chunk)
            })
            .boxed();
        TransportResponse::new(200, body)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_body_within_read_timeout_completes() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("slow.bin");

        // 30 s in total, far beyond the per-read limit
        let outcome = DownloadSink::new(256)
            .with_read_timeout(Duration::from_secs(20))
            .consume(
                &dest,
                spaced(30, 100, Duration::from_secs(1)),
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, SinkOutcome::Complete { bytes: 3000 });
        assert_eq!(std::fs::read(&dest).unwrap().len(), 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_is_terminal() {
        let dir = TempDir::new().unwrap();

        let err = DownloadSink::new(256)
            .with_read_timeout(Duration::from_secs(20))
            .consume(
                &dir.path().join("stalled.bin"),
                spaced(2, 100, Duration::from_secs(25)),
                &CancellationToken::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::Stream { written: 0, .. }));
        let attempt: AttemptError = err.into();
        assert!(attempt.terminal);
    }
}
