//! Queue controller: admission, dispatch, retry and status for work items.
//!
//! All queue mutation happens under one mutex, from `submit`, the dispatch
//! loop, completion handling and retry timers. The lock is never held
//! across an await. Executions run as separate tasks, at most
//! `concurrency_limit` at a time.

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::retry::{RequeuePosition, RetryDecision, RetryOnStop, RetryPolicy};
use super::stats::{QueueStats, QueueStatus, RunState, Stats, throughput_per_minute};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::executor::{Completion, WorkExecutor};
use crate::model::{ItemState, ItemSummary, WorkItem, display_name};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, record_state_transition, start_work_span};

/// Buffered events per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

/// Static configuration for a controller.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum pending items, including items waiting out a retry delay.
    pub capacity: usize,
    /// Maximum simultaneous executions.
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
    /// Longest the dispatch loop sleeps between sweeps when nothing wakes it.
    pub idle_poll: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            concurrency_limit: 3,
            retry: RetryPolicy::default(),
            idle_poll: Duration::from_millis(100),
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("queue is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("already pending, in flight or awaiting retry")]
    AlreadyQueued,
}

/// What happened when a file was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(Rejection),
}

impl SubmitResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitResult::Accepted)
    }
}

/// An item whose backoff timer is running.
struct RetryEntry {
    item: WorkItem,
    timer: AbortHandle,
}

struct QueueState {
    pending: VecDeque<WorkItem>,
    in_flight: HashMap<PathBuf, WorkItem>,
    retrying: HashMap<PathBuf, RetryEntry>,
    stats: Stats,
    loop_active: bool,
    stopped: bool,
}

impl QueueState {
    fn contains(&self, path: &Path) -> bool {
        self.in_flight.contains_key(path)
            || self.retrying.contains_key(path)
            || self.pending.iter().any(|item| item.path == path)
    }

    /// Pending slots in use. Items in backoff keep their slot so they can
    /// always re-enter.
    fn reserved(&self) -> usize {
        self.pending.len() + self.retrying.len()
    }

    /// Nothing live and the dispatch loop has exited.
    fn is_settled(&self) -> bool {
        self.pending.is_empty()
            && self.in_flight.is_empty()
            && self.retrying.is_empty()
            && !self.loop_active
    }
}

struct Shared {
    state: Mutex<QueueState>,
    config: QueueConfig,
    executor: Arc<dyn WorkExecutor>,
    events: broadcast::Sender<Event>,
    seq: AtomicU64,
    /// Wakes the dispatch loop before its idle poll elapses.
    wake: Notify,
    /// Fired on every completion, requeue and stop, for `wait_*` callers.
    changed: Notify,
}

/// The admission-controlled work queue.
///
/// Cheap to clone; clones share the same queue. `submit`, `stop` and
/// `resume` must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct QueueController {
    shared: Arc<Shared>,
}

impl QueueController {
    pub fn new(config: QueueConfig, executor: Arc<dyn WorkExecutor>) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }
        if config.concurrency_limit == 0 {
            return Err(Error::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    in_flight: HashMap::new(),
                    retrying: HashMap::new(),
                    stats: Stats::new(),
                    loop_active: false,
                    stopped: false,
                }),
                config,
                executor,
                events,
                seq: AtomicU64::new(0),
                wake: Notify::new(),
                changed: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Subscribe to terminal `Processed`/`Failed` events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Offer a file to the queue. Never blocks: a full queue is reported as
    /// [`Rejection::CapacityExceeded`] and leaves the queue untouched.
    pub fn submit(&self, path: impl Into<PathBuf>) -> SubmitResult {
        let path = path.into();
        let name = display_name(&path);
        let mut state = self.shared.state.lock();

        if state.contains(&path) {
            debug!(file = %name, "already queued, ignoring submission");
            metrics::files_submitted().add(1, &[KeyValue::new("result", "already_queued")]);
            return SubmitResult::Rejected(Rejection::AlreadyQueued);
        }

        let capacity = self.shared.config.capacity;
        if state.reserved() >= capacity {
            warn!(file = %name, capacity, "queue full, rejecting file");
            metrics::files_submitted().add(1, &[KeyValue::new("result", "capacity_exceeded")]);
            return SubmitResult::Rejected(Rejection::CapacityExceeded { capacity });
        }

        state.pending.push_back(WorkItem::new(path));
        state.stats.queued_total += 1;
        metrics::files_submitted().add(1, &[KeyValue::new("result", "accepted")]);
        info!(file = %name, queue_depth = state.pending.len(), "file queued");

        self.shared.ensure_dispatching(&mut state);
        SubmitResult::Accepted
    }

    /// Stop dispatching. In-flight executions finish and still emit their
    /// events. Idempotent.
    pub fn stop(&self) {
        let cancelled = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            info!(
                pending = state.pending.len(),
                in_flight = state.in_flight.len(),
                retrying = state.retrying.len(),
                "stopping queue dispatch"
            );

            match self.shared.config.retry.on_stop {
                RetryOnStop::Backlog => Vec::new(),
                RetryOnStop::Cancel => self.shared.cancel_retries(&mut state),
            }
        };

        for kind in cancelled {
            self.shared.emit(kind);
        }
        self.shared.wake.notify_one();
        self.shared.changed.notify_waiters();
    }

    /// Undo [`stop`](Self::stop): dispatch any backlog that accumulated.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if !state.stopped {
            return;
        }
        state.stopped = false;
        info!(backlog = state.pending.len(), "resuming queue dispatch");
        if !state.pending.is_empty() {
            self.shared.ensure_dispatching(&mut state);
        }
    }

    pub fn run_state(&self) -> RunState {
        self.shared.run_state(&self.shared.state.lock())
    }

    /// Counters and live sizes.
    pub fn stats(&self) -> QueueStats {
        self.shared.stats_of(&self.shared.state.lock())
    }

    /// Stats plus run state and one summary per live item: pending in
    /// dispatch order, then in-flight, then retrying, each oldest first.
    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();

        let mut items: Vec<ItemSummary> = state
            .pending
            .iter()
            .map(|item| ItemSummary::of(item, ItemState::Pending))
            .collect();

        let mut in_flight: Vec<ItemSummary> = state
            .in_flight
            .values()
            .map(|item| ItemSummary::of(item, ItemState::InFlight))
            .collect();
        in_flight.sort_by_key(|s| s.enqueued_at);
        items.extend(in_flight);

        let mut retrying: Vec<ItemSummary> = state
            .retrying
            .values()
            .map(|entry| ItemSummary::of(&entry.item, ItemState::PendingRetry))
            .collect();
        retrying.sort_by_key(|s| s.enqueued_at);
        items.extend(retrying);

        QueueStatus {
            state: self.shared.run_state(&state),
            stats: self.shared.stats_of(&state),
            items,
        }
    }

    /// Wait until no execution is running.
    pub async fn wait_for_in_flight(&self) {
        self.wait_until(|state| state.in_flight.is_empty()).await
    }

    /// Wait until nothing is pending, running or awaiting retry. Never
    /// returns while a stopped controller holds backlog.
    pub async fn wait_idle(&self) {
        self.wait_until(QueueState::is_settled).await
    }

    async fn wait_until(&self, done: impl Fn(&QueueState) -> bool) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if done(&*self.shared.state.lock()) {
                return;
            }
            notified.await;
        }
    }
}

impl Shared {
    fn run_state(&self, state: &QueueState) -> RunState {
        if state.stopped {
            RunState::Stopped
        } else if state.loop_active {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    fn stats_of(&self, state: &QueueState) -> QueueStats {
        let uptime = state.stats.uptime();
        QueueStats {
            queue_depth: state.pending.len(),
            in_flight: state.in_flight.len(),
            retrying: state.retrying.len(),
            capacity: self.config.capacity,
            concurrency_limit: self.config.concurrency_limit,
            queued_total: state.stats.queued_total,
            processed_total: state.stats.processed_total,
            failed_total: state.stats.failed_total,
            retried_total: state.stats.retried_total,
            started_at: state.stats.started_at,
            uptime_secs: uptime.as_secs(),
            throughput_per_minute: throughput_per_minute(state.stats.processed_total, uptime),
        }
    }

    /// Start the dispatch loop if it is not running, or nudge it if it is.
    fn ensure_dispatching(self: &Arc<Self>, state: &mut QueueState) {
        if state.stopped {
            return;
        }
        if state.loop_active {
            self.wake.notify_one();
            return;
        }
        state.loop_active = true;
        tokio::spawn(Arc::clone(self).dispatch_loop());
    }

    async fn dispatch_loop(self: Arc<Self>) {
        info!(
            max_concurrent = self.config.concurrency_limit,
            "dispatch loop started"
        );

        loop {
            {
                let mut state = self.state.lock();
                if state.stopped {
                    state.loop_active = false;
                    info!(backlog = state.pending.len(), "dispatch loop stopped");
                    break;
                }

                self.sweep(&mut state);

                if state.pending.is_empty() && state.in_flight.is_empty() {
                    state.loop_active = false;
                    info!(
                        processed = state.stats.processed_total,
                        failed = state.stats.failed_total,
                        "queue drained, dispatch loop finished"
                    );
                    break;
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.idle_poll) => {}
            }
        }

        self.changed.notify_waiters();
    }

    /// Move items from the head of pending into flight until the
    /// concurrency limit is reached.
    fn sweep(self: &Arc<Self>, state: &mut QueueState) {
        while state.in_flight.len() < self.config.concurrency_limit {
            let Some(item) = state.pending.pop_front() else {
                break;
            };
            state.in_flight.insert(item.path.clone(), item.clone());
            debug!(
                file = %item.display_name(),
                attempt = item.attempt + 1,
                in_flight = state.in_flight.len(),
                "dispatching"
            );
            tokio::spawn(Arc::clone(self).execute(item));
        }
    }

    async fn execute(self: Arc<Self>, item: WorkItem) {
        let span = start_work_span(&item.path, item.attempt);
        record_state_transition(&span, ItemState::Pending, ItemState::InFlight);
        span.in_scope(|| {
            info!(file = %item.display_name(), attempt = item.attempt + 1, "processing file");
        });

        let start = Instant::now();
        let executor = Arc::clone(&self.executor);
        let path = item.path.clone();

        // A separate task contains executor panics.
        let task = tokio::spawn(async move { executor.run(&path).await }.instrument(span.clone()));
        let outcome = match task.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) if e.is_panic() => Err(format!("executor panicked: {e}")),
            Err(e) => Err(format!("execution aborted: {e}")),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        metrics::execution_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new(
                "outcome",
                if outcome.is_ok() { "ok" } else { "error" },
            )],
        );

        self.complete(item, outcome, duration_ms, &span);
    }

    /// Classify an execution outcome. The in-flight slot is released here,
    /// before the dispatch loop is woken for its next sweep.
    fn complete(
        self: &Arc<Self>,
        item: WorkItem,
        outcome: std::result::Result<Completion, String>,
        duration_ms: u64,
        span: &Span,
    ) {
        let name = item.display_name();
        let event = {
            let mut state = self.state.lock();
            state.in_flight.remove(&item.path);

            match outcome {
                Ok(completion) => {
                    state.stats.processed_total += 1;
                    record_state_transition(span, ItemState::InFlight, ItemState::Processed);
                    record_outcome(span, "processed");
                    metrics::files_processed().add(1, &[]);
                    info!(file = %name, duration_ms, "file processed");
                    Some(EventKind::Processed {
                        path: item.path,
                        attempts: item.attempt + 1,
                        duration_ms,
                        output: completion.output,
                    })
                }
                Err(error) => match self.config.retry.decide(item.attempt) {
                    RetryDecision::Retry { delay }
                        if !(state.stopped && self.config.retry.on_stop == RetryOnStop::Cancel) =>
                    {
                        state.stats.retried_total += 1;
                        record_state_transition(span, ItemState::InFlight, ItemState::PendingRetry);
                        record_outcome(span, "retry");
                        metrics::files_retried().add(1, &[]);
                        warn!(
                            file = %name,
                            attempt = item.attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            %error,
                            "attempt failed, retry scheduled"
                        );
                        self.schedule_retry(&mut state, item.failed_attempt(), delay);
                        None
                    }
                    RetryDecision::Retry { .. } => {
                        state.stats.failed_total += 1;
                        record_state_transition(span, ItemState::InFlight, ItemState::Failed);
                        record_outcome(span, "failed");
                        metrics::files_failed().add(1, &[]);
                        error!(file = %name, %error, "attempt failed after stop, retry cancelled");
                        Some(EventKind::Failed {
                            path: item.path,
                            error: format!("{error} (retry cancelled: queue stopped)"),
                            attempts: item.attempt + 1,
                        })
                    }
                    RetryDecision::GiveUp => {
                        state.stats.failed_total += 1;
                        record_state_transition(span, ItemState::InFlight, ItemState::Failed);
                        record_outcome(span, "failed");
                        metrics::files_failed().add(1, &[]);
                        error!(
                            file = %name,
                            attempts = item.attempt + 1,
                            %error,
                            "file failed permanently"
                        );
                        Some(EventKind::Failed {
                            path: item.path,
                            error,
                            attempts: item.attempt + 1,
                        })
                    }
                },
            }
        };

        if let Some(kind) = event {
            self.emit(kind);
        }
        self.wake.notify_one();
        self.changed.notify_waiters();
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut QueueState, item: WorkItem, delay: Duration) {
        let shared = Arc::clone(self);
        let path = item.path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.requeue(&path);
        });
        state.retrying.insert(
            item.path.clone(),
            RetryEntry {
                item,
                timer: timer.abort_handle(),
            },
        );
    }

    /// Backoff elapsed: put the item back into pending.
    fn requeue(self: &Arc<Self>, path: &Path) {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.retrying.remove(path) else {
                return;
            };
            let item = entry.item.readmitted();
            info!(
                file = %item.display_name(),
                attempt = item.attempt + 1,
                "requeueing file"
            );
            match self.config.retry.requeue_position {
                RequeuePosition::Head => state.pending.push_front(item),
                RequeuePosition::Tail => state.pending.push_back(item),
            }
            state.stats.queued_total += 1;
            self.ensure_dispatching(&mut state);
        }
        self.changed.notify_waiters();
    }

    /// Abort every backoff timer; each affected item fails terminally.
    fn cancel_retries(&self, state: &mut QueueState) -> Vec<EventKind> {
        let entries: Vec<RetryEntry> = state.retrying.drain().map(|(_, e)| e).collect();
        entries
            .into_iter()
            .map(|entry| {
                entry.timer.abort();
                state.stats.failed_total += 1;
                metrics::files_failed().add(1, &[]);
                warn!(file = %entry.item.display_name(), "pending retry cancelled by stop");
                EventKind::Failed {
                    path: entry.item.path,
                    error: "retry cancelled: queue stopped".to_string(),
                    attempts: entry.item.attempt,
                }
            })
            .collect()
    }

    /// Publish an event. Having no subscribers is not an error.
    fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("no event subscribers");
        }
    }
}
