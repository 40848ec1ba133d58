//! Bounded, retrying, cancellable fan-out of targets
//!
//! Architecture:
//! 1. `Orchestrator::submit` claims every target in the orchestrator's
//!    [`DedupIndex`], shared by all of its submissions, and spawns one
//!    dispatcher task for the submission
//! 2. The dispatcher keeps at most `concurrency` attempts running; each
//!    attempt is a spawned task doing `transport.send` + `handler.handle`.
//!    Buffered attempts are bounded by the target timeout as a whole; for
//!    streamed targets only the response head is, the handler bounds reads
//! 3. Results come back to the dispatcher only. It owns [`RetryState`],
//!    decides retries, and parks retried targets in a delay queue that
//!    feeds the *tail* of the pending queue
//! 4. Terminal outcomes go to the caller over an unbounded channel, so the
//!    dispatcher never blocks on a slow consumer
//!
//! Interrupt and stop are both [`CancellationToken`]s. Whichever fires
//! first, in-flight attempts are aborted and every non-terminal target is
//! emitted as [`Outcome::Abandoned`] before the channel closes.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use super::dedup::{CanonicalKey, DedupIndex};
use super::outcome::{AttemptError, Failure, Outcome};
use super::retry::{Decision, FailureKind, RetryPolicy, RetryState};
use super::target::Target;
use crate::transport::{Transport, TransportResponse};

/// Signals visible to a running attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Attempt number, starting at 0
    pub attempt: u32,
    /// Process-wide interrupt
    pub interrupt: CancellationToken,
    /// Raised when the caller has enough results
    pub completion: CancellationToken,
}

impl AttemptContext {
    pub fn should_stop(&self) -> bool {
        self.interrupt.is_cancelled() || self.completion.is_cancelled()
    }
}

/// Turns a transport response into a payload. Runs inside the attempt, so
/// it may stream to disk; it must not touch shared bookkeeping.
#[async_trait]
pub trait AttemptHandler: Send + Sync + 'static {
    type Payload: Send + 'static;

    async fn handle(
        &self,
        target: &Target,
        response: TransportResponse,
        ctx: &AttemptContext,
    ) -> Result<Self::Payload, AttemptError>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub concurrency: usize,
    /// Minimum gap between two dispatches (courtesy rate limit)
    pub dispatch_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dispatch_interval: Duration::ZERO,
        }
    }
}

/// Counters returned when a submission's dispatcher exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub duplicates: u64,
}

pub struct Orchestrator<H: AttemptHandler> {
    transport: Arc<dyn Transport>,
    handler: Arc<H>,
    policy: RetryPolicy,
    options: OrchestratorOptions,
    interrupt: CancellationToken,
    /// Keys claimed or accepted by any submission
    claimed: Arc<Mutex<DedupIndex>>,
}

impl<H: AttemptHandler> Orchestrator<H> {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: H,
        policy: RetryPolicy,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            transport,
            handler: Arc::new(handler),
            policy,
            options: OrchestratorOptions::default(),
            interrupt,
            claimed: Arc::new(Mutex::new(DedupIndex::new())),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn interrupt(&self) -> &CancellationToken {
        &self.interrupt
    }

    /// Start working on `targets`. A key already claimed by this or any
    /// other live submission, or already accepted, is dropped and counted
    /// in [`DispatchStats::duplicates`]; results arrive in completion order.
    pub fn submit(&self, targets: impl IntoIterator<Item = Target>) -> Submission<H::Payload> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let completion = self.interrupt.child_token();

        let mut dispatcher = Dispatcher {
            transport: Arc::clone(&self.transport),
            handler: Arc::clone(&self.handler),
            policy: self.policy,
            concurrency: self.options.concurrency.max(1),
            dispatch_interval: self.options.dispatch_interval,
            interrupt: self.interrupt.clone(),
            completion: completion.clone(),
            results: results_tx,
            pending: VecDeque::new(),
            delayed: DelayQueue::new(),
            waiting: HashMap::new(),
            active: HashMap::new(),
            in_flight: FuturesUnordered::new(),
            retry_state: RetryState::new(),
            claimed: Arc::clone(&self.claimed),
            next_dispatch_at: None,
            stats: DispatchStats::default(),
        };

        for target in targets {
            dispatcher.enqueue(target);
        }

        info!(
            targets = dispatcher.pending.len(),
            concurrency = dispatcher.concurrency,
            "Submission started"
        );

        let task = tokio::spawn(dispatcher.run(control_rx));

        Submission {
            results: results_rx,
            control: control_tx,
            completion,
            task: Some(task),
        }
    }
}

enum Control {
    Requeue(Target),
}

/// Caller's side of a submission: the result stream plus controls
pub struct Submission<P> {
    results: mpsc::UnboundedReceiver<(Target, Outcome<P>)>,
    control: mpsc::UnboundedSender<Control>,
    completion: CancellationToken,
    task: Option<JoinHandle<DispatchStats>>,
}

impl<P: Send + 'static> Submission<P> {
    /// Next terminal outcome; `None` once every target is terminal
    pub async fn next(&mut self) -> Option<(Target, Outcome<P>)> {
        self.results.recv().await
    }

    /// Enough results: stop dispatching and abandon in-flight work. The
    /// remaining targets still arrive as `Abandoned`.
    pub fn stop(&self) {
        self.completion.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Token raised by [`Submission::stop`] (and by the interrupt)
    pub fn completion(&self) -> CancellationToken {
        self.completion.clone()
    }

    /// Put a target back at the tail of the pending queue. Ignored when
    /// its key is already pending, running or accepted.
    pub fn requeue(&self, target: Target) -> bool {
        self.control.send(Control::Requeue(target)).is_ok()
    }

    /// Stop, then collect every outcome not yet received
    pub async fn drain(mut self) -> Vec<(Target, Outcome<P>)> {
        self.stop();
        let mut rest = Vec::new();
        while let Some(item) = self.results.recv().await {
            rest.push(item);
        }
        rest
    }

    /// Wait for the dispatcher to exit and return its counters
    pub async fn finish(mut self) -> DispatchStats {
        while self.results.recv().await.is_some() {}
        match self.task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => DispatchStats::default(),
        }
    }
}

type Joined<P> = (CanonicalKey, Result<Result<P, AttemptError>, JoinError>);

struct Running {
    target: Target,
    attempt: u32,
    abort: AbortHandle,
}

struct Dispatcher<H: AttemptHandler> {
    transport: Arc<dyn Transport>,
    handler: Arc<H>,
    policy: RetryPolicy,
    concurrency: usize,
    dispatch_interval: Duration,
    interrupt: CancellationToken,
    completion: CancellationToken,
    results: mpsc::UnboundedSender<(Target, Outcome<H::Payload>)>,
    pending: VecDeque<Target>,
    delayed: DelayQueue<CanonicalKey>,
    /// Targets parked in `delayed`, by key
    waiting: HashMap<CanonicalKey, Target>,
    active: HashMap<CanonicalKey, Running>,
    in_flight: FuturesUnordered<BoxFuture<'static, Joined<H::Payload>>>,
    retry_state: RetryState,
    claimed: Arc<Mutex<DedupIndex>>,
    next_dispatch_at: Option<Instant>,
    stats: DispatchStats,
}

impl<H: AttemptHandler> Dispatcher<H> {
    fn dedup(&self) -> MutexGuard<'_, DedupIndex> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&mut self, target: Target) -> bool {
        if !self.dedup().claim(target.key()) {
            debug!(key = %target.key(), "Duplicate target ignored");
            self.stats.duplicates += 1;
            return false;
        }
        self.pending.push_back(target);
        true
    }

    fn halted(&self) -> bool {
        self.interrupt.is_cancelled() || self.completion.is_cancelled()
    }

    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) -> DispatchStats {
        loop {
            let waiting_for_gap = self.fill();

            if self.pending.is_empty() && self.delayed.is_empty() && self.active.is_empty() {
                break;
            }

            let gap_deadline = self.next_dispatch_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                _ = self.interrupt.cancelled() => {
                    self.shutdown(true).await;
                    break;
                }
                _ = self.completion.cancelled() => {
                    self.shutdown(false).await;
                    break;
                }
                _ = self.results.closed() => {
                    debug!("Result receiver dropped, abandoning submission");
                    self.shutdown(false).await;
                    break;
                }
                Some((key, joined)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.accept(key, joined);
                }
                Some(expired) = self.delayed.next(), if !self.delayed.is_empty() => {
                    let key = expired.into_inner();
                    if let Some(target) = self.waiting.remove(&key) {
                        debug!(key = %key, "Retry eligible, re-queued at tail");
                        self.pending.push_back(target);
                    }
                }
                Some(Control::Requeue(target)) = control.recv() => {
                    if self.enqueue(target) {
                        debug!("Target requeued by caller");
                    }
                }
                _ = tokio::time::sleep_until(gap_deadline), if waiting_for_gap => {}
            }
        }

        debug!(stats = ?self.stats, "Dispatcher finished");
        self.stats
    }

    /// Dispatch pending targets up to the concurrency limit. Returns `true`
    /// when work is waiting only on the dispatch interval.
    fn fill(&mut self) -> bool {
        while self.active.len() < self.concurrency && !self.pending.is_empty() {
            if self.halted() {
                return false;
            }

            if let Some(at) = self.next_dispatch_at {
                if Instant::now() < at {
                    return true;
                }
            }

            if let Some(target) = self.pending.pop_front() {
                self.dispatch(target);
            }
        }
        false
    }

    fn dispatch(&mut self, target: Target) {
        let attempt = self.retry_state.failures(target.key());
        let key = target.key().clone();

        let ctx = AttemptContext {
            attempt,
            interrupt: self.interrupt.clone(),
            completion: self.completion.clone(),
        };
        let transport = Arc::clone(&self.transport);
        let handler = Arc::clone(&self.handler);
        let attempt_target = target.clone();

        let handle = tokio::spawn(async move {
            let limit = attempt_target.options().timeout;
            let timed_out = || {
                AttemptError::new(
                    FailureKind::TransientNetwork,
                    format!("attempt timed out after {:?}", limit),
                )
            };

            if attempt_target.options().stream {
                let response = match tokio::time::timeout(limit, transport.send(&attempt_target)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => return Err(AttemptError::from(err)),
                    Err(_) => return Err(timed_out()),
                };
                return handler.handle(&attempt_target, response, &ctx).await;
            }

            let work = async {
                let response = transport.send(&attempt_target).await?;
                handler.handle(&attempt_target, response, &ctx).await
            };
            tokio::time::timeout(limit, work)
                .await
                .unwrap_or_else(|_| Err(timed_out()))
        });

        debug!(key = %key, attempt, "Dispatched");
        self.stats.dispatched += 1;

        self.active.insert(
            key.clone(),
            Running {
                target,
                attempt,
                abort: handle.abort_handle(),
            },
        );
        self.in_flight
            .push(Box::pin(async move { (key, handle.await) }));

        if !self.dispatch_interval.is_zero() {
            self.next_dispatch_at = Some(Instant::now() + self.dispatch_interval);
        }
    }

    fn accept(&mut self, key: CanonicalKey, joined: Result<Result<H::Payload, AttemptError>, JoinError>) {
        let Some(running) = self.active.remove(&key) else {
            return;
        };

        let result = match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                self.abandon(running.target, running.attempt + 1, self.interrupt.is_cancelled());
                return;
            }
            Err(err) => Err(AttemptError::terminal(
                FailureKind::FatalClient,
                format!("attempt panicked: {}", err),
            )),
        };

        let target = running.target;
        let attempts = running.attempt + 1;

        match result {
            Ok(payload) => {
                self.retry_state.clear(&key);
                self.dedup().accept(&key);
                self.stats.succeeded += 1;
                info!(key = %key, attempts, "Target retrieved");
                self.emit(target, Outcome::Success { payload, attempts });
            }
            Err(err) => {
                let failures = self.retry_state.record_failure(&key);
                let decision = if err.terminal {
                    Decision::GiveUp
                } else {
                    self.policy.decide(failures, err.kind)
                };

                match decision {
                    Decision::Retry { wait } => {
                        self.retry_state.schedule(&key, wait);
                        self.stats.retries += 1;
                        warn!(
                            key = %key,
                            attempt = failures,
                            max_attempts = self.policy.max_attempts,
                            kind = %err.kind,
                            wait_ms = wait.as_millis() as u64,
                            reason = %err.reason,
                            "Retry scheduled"
                        );
                        self.delayed.insert(key.clone(), wait);
                        self.waiting.insert(key, target);
                    }
                    Decision::GiveUp => {
                        self.retry_state.clear(&key);
                        self.dedup().release(&key);
                        self.stats.failed += 1;
                        warn!(
                            key = %key,
                            attempts = failures,
                            kind = %err.kind,
                            reason = %err.reason,
                            "Target failed"
                        );
                        self.emit(
                            target,
                            Outcome::Failed(Failure {
                                kind: err.kind,
                                reason: err.reason,
                                attempts: failures,
                            }),
                        );
                    }
                }
            }
        }
    }

    fn abandon(&mut self, target: Target, attempts: u32, interrupted: bool) {
        self.retry_state.clear(target.key());
        self.dedup().release(target.key());
        self.stats.abandoned += 1;
        self.emit(
            target,
            Outcome::Abandoned {
                attempts,
                interrupted,
            },
        );
    }

    /// Abort in-flight attempts, wait for them to unwind, then mark every
    /// non-terminal target abandoned. Files written by aborted attempts are
    /// safe to delete once their outcome is received.
    async fn shutdown(&mut self, interrupted: bool) {
        info!(
            interrupted,
            in_flight = self.active.len(),
            pending = self.pending.len() + self.delayed.len(),
            "Stopping submission"
        );

        for running in self.active.values() {
            running.abort.abort();
        }
        while let Some((key, joined)) = self.in_flight.next().await {
            match joined {
                // finished before the abort landed; still a valid result
                Ok(result) if !interrupted => self.accept(key, Ok(result)),
                _ => {
                    if let Some(running) = self.active.remove(&key) {
                        self.abandon(running.target, running.attempt + 1, interrupted);
                    }
                }
            }
        }

        self.delayed.clear();
        let mut leftover: Vec<Target> = self.pending.drain(..).collect();
        leftover.extend(self.waiting.drain().map(|(_, target)| target));
        for target in leftover {
            let attempts = self.retry_state.failures(target.key());
            self.abandon(target, attempts, interrupted);
        }
    }

    fn emit(&self, target: Target, outcome: Outcome<H::Payload>) {
        if self.results.send((target, outcome)).is_err() {
            debug!("Result receiver dropped");
        }
    }
}
