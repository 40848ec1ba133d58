//! In-process transport driven by a script of canned replies
//!
//! Used by the test suites and for dry runs. Replies are queued per
//! canonical key; once a key's queue is empty its last reply repeats.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{Result, Transport, TransportError, TransportResponse};
use crate::engine::dedup::CanonicalKey;
use crate::engine::retry::FailureKind;
use crate::engine::target::Target;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Status with a buffered body
    Body { status: u16, body: Bytes },
    /// Status with a body delivered in chunks, `gap` apart
    Chunks {
        status: u16,
        chunks: Vec<Bytes>,
        gap: Duration,
    },
    /// Body that fails after the given chunks were delivered
    BrokenStream { chunks: Vec<Bytes>, message: String },
    /// Request-level failure
    Error { kind: FailureKind, message: String },
    /// Never answers; only cancellation ends the attempt
    Hang,
}

impl ScriptedReply {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        ScriptedReply::Body {
            status: 200,
            body: body.into(),
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::ok(value.to_string())
    }

    pub fn status(status: u16) -> Self {
        ScriptedReply::Body {
            status,
            body: Bytes::new(),
        }
    }

    pub fn error(kind: FailureKind) -> Self {
        ScriptedReply::Error {
            kind,
            message: format!("scripted {}", kind),
        }
    }
}

#[derive(Default)]
struct Script {
    replies: HashMap<CanonicalKey, VecDeque<ScriptedReply>>,
    last: HashMap<CanonicalKey, ScriptedReply>,
    calls: Vec<CanonicalKey>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    fallback: Option<ScriptedReply>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply used for keys that have no script at all
    pub fn with_fallback(mut self, reply: ScriptedReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Delay applied before every reply
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue replies for `key`, in order
    pub fn script(
        self,
        key: &CanonicalKey,
        replies: impl IntoIterator<Item = ScriptedReply>,
    ) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script
                .replies
                .entry(key.clone())
                .or_default()
                .extend(replies);
        }
        self
    }

    /// Every key sent so far, in dispatch order
    pub fn calls(&self) -> Vec<CanonicalKey> {
        self.script
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn calls_for(&self, key: &CanonicalKey) -> usize {
        self.calls().iter().filter(|k| *k == key).count()
    }

    /// Highest number of concurrently running sends observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, key: &CanonicalKey) -> Option<ScriptedReply> {
        let mut script = self.script.lock().ok()?;
        script.calls.push(key.clone());

        let next = script.replies.get_mut(key).and_then(VecDeque::pop_front);
        match next {
            Some(reply) => {
                script.last.insert(key.clone(), reply.clone());
                Some(reply)
            }
            None => script
                .last
                .get(key)
                .cloned()
                .or_else(|| self.fallback.clone()),
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, target: &Target) -> Result<TransportResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let reply = self.next_reply(target.key()).ok_or_else(|| {
            TransportError::new(
                FailureKind::FatalClient,
                format!("no scripted reply for {}", target.key()),
            )
        })?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            ScriptedReply::Body { status, body } => Ok(TransportResponse::from_bytes(status, body)),
            ScriptedReply::Chunks { status, chunks, gap } => {
                let body = stream::iter(chunks)
                    .then(move |chunk| async move {
                        if !gap.is_zero() {
                            tokio::time::sleep(gap).await;
                        }
                        Ok(chunk)
                    })
                    .boxed();
                Ok(TransportResponse::new(status, body))
            }
            ScriptedReply::BrokenStream { chunks, message } => {
                let failure = TransportError::new(FailureKind::TransientNetwork, message);
                let body = stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::once(async move { Err(failure) }))
                    .boxed();
                Ok(TransportResponse::new(200, body))
            }
            ScriptedReply::Error { kind, message } => Err(TransportError::new(kind, message)),
            ScriptedReply::Hang => std::future::pending().await,
        }
    }
}
