//! Network transports used by the orchestrator
//!
//! The orchestrator only sees the [`Transport`] trait: one call per attempt,
//! returning a status and a body stream. Provider quirks (browser-like
//! headers, relaxed TLS) live in transport configuration, never in the
//! retry path.

mod http;
mod scripted;

pub use http::{HttpTransport, TransportProfile};
pub use scripted::{ScriptedReply, ScriptedTransport};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::engine::outcome::AttemptError;
use crate::engine::retry::FailureKind;
use crate::engine::target::Target;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        AttemptError::new(err.kind, err.message)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Response head plus a lazily consumed body
pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    pub fn new(status: u16, body: BodyStream) -> Self {
        Self { status, body }
    }

    /// Response with an in-memory body
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status, stream::once(async move { Ok(body) }).boxed())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fail with the status classification unless the status is 2xx
    pub fn ensure_success(self) -> std::result::Result<Self, AttemptError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AttemptError::new(
                FailureKind::from_status(self.status),
                format!("HTTP {}", self.status),
            ))
        }
    }

    /// Buffer the whole body
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// One request per call. Implementations must be cheap to share across
/// concurrently running attempts.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: &Target) -> Result<TransportResponse>;
}
