//! Durable task dispatcher.
//!
//! Deferred work enters through [`Dispatcher::enqueue`], keyed by a
//! caller-supplied idempotency key. A poll pass reclaims attempts whose
//! heartbeat went quiet, claims ready tasks under a lease, runs them with a
//! heartbeat ticking beside the handler, and records the outcome: success,
//! a backoff-delayed retry, or `dead_letter` once the retry budget is spent.
//!
//! Task payloads are a closed enum implementing [`TaskKind`]; the handler
//! matches on it, so retry and backoff stay uniform across kinds.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::core::outbox::{OutboxEvent, OutboxSubscriber, PublishedEvent};
use crate::core::GatewayError;
use crate::util::clock::{duration_ms, SharedClock};
use crate::util::serde::{EventId, TaskId};

/// Outbox topic carrying [`TaskRequest`]s for the dispatcher.
pub const TASK_TOPIC: &str = "dispatch.enqueue";

/// A closed set of task kinds.
pub trait TaskKind: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Short label for logs and records.
    fn kind(&self) -> &'static str;
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its first attempt.
    Queued,
    /// Claimed by a worker under a lease.
    Running,
    /// Finished successfully. Terminal.
    Succeeded,
    /// Last attempt failed transiently; eligible again at `next_retry_at_ms`.
    Failed,
    /// Retry budget spent or permanent failure. Terminal until reset.
    DeadLetter,
}

impl TaskState {
    /// Whether the dispatcher will never touch the task again on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLetter)
    }

    /// Whether a poll pass may claim the task once it is due.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::Failed)
    }
}

/// Persistent task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord<P> {
    /// Task identifier.
    pub task_id: TaskId,
    /// Caller-supplied deduplication key.
    pub idempotency_key: String,
    /// Kind label of the payload.
    pub kind: String,
    /// Task body.
    pub payload: P,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Current state.
    pub state: TaskState,
    /// Earliest time the next attempt may start.
    pub next_retry_at_ms: u128,
    /// Enqueue time.
    pub created_at_ms: u128,
    /// Last state change.
    pub updated_at_ms: u128,
    /// Last heartbeat of the running attempt.
    pub heartbeat_at_ms: Option<u128>,
    /// Lease token of the current or latest attempt.
    pub lease: u64,
    /// Failure reason of the latest failed attempt.
    pub last_error: Option<String>,
    /// Outbox event that requested the task, if any.
    #[serde(default)]
    pub source_event: Option<EventId>,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// The task owning the idempotency key.
    pub task_id: TaskId,
    /// `false` when an existing task was returned.
    pub created: bool,
}

/// How an attempt ended, as recorded by [`TaskStore::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Task is done.
    Succeeded,
    /// Try again later.
    Retry {
        /// Earliest time of the next attempt.
        at_ms: u128,
        /// Failure reason.
        error: String,
    },
    /// Give up; wait for an operator.
    DeadLetter {
        /// Failure reason.
        error: String,
    },
}

/// Durable task table.
///
/// Implementations make `enqueue` an atomic check-and-insert on the
/// idempotency key and ignore `heartbeat`/`finish` calls whose lease no
/// longer matches, so a reclaimed attempt cannot overwrite its successor.
pub trait TaskStore<P>: Send + 'static {
    /// Insert a task unless a live (non-dead-lettered) task owns `key`.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn enqueue(&mut self, key: &str, kind: &str, payload: P, now_ms: u128) -> Result<Enqueued, GatewayError>;

    /// [`enqueue`](Self::enqueue) on behalf of outbox event `event_id`. A
    /// redelivered event returns the task it created, whatever its state.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn enqueue_from_event(
        &mut self,
        event_id: EventId,
        key: &str,
        kind: &str,
        payload: P,
        now_ms: u128,
    ) -> Result<Enqueued, GatewayError>;

    /// Move up to `limit` due tasks to `running` with fresh leases.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn claim_ready(&mut self, now_ms: u128, limit: usize) -> Result<Vec<TaskRecord<P>>, GatewayError>;

    /// Refresh the heartbeat of a running attempt. `false` if the lease is gone.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn heartbeat(&mut self, task_id: TaskId, lease: u64, now_ms: u128) -> Result<bool, GatewayError>;

    /// Record the outcome of an attempt. `false` if the lease is gone.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn finish(
        &mut self,
        task_id: TaskId,
        lease: u64,
        completion: Completion,
        now_ms: u128,
    ) -> Result<bool, GatewayError>;

    /// Return running tasks without a heartbeat since `now_ms - deadline_ms`
    /// to the queue.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn reclaim_stale(&mut self, now_ms: u128, deadline_ms: u128) -> Result<Vec<TaskId>, GatewayError>;

    /// Look up a task.
    fn get(&self, task_id: TaskId) -> Option<TaskRecord<P>>;

    /// All tasks currently in `state`.
    fn by_state(&self, state: TaskState) -> Vec<TaskRecord<P>>;

    /// Operator reset of a dead-lettered task: attempts zeroed, queued now.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, or `Backend` if the task is not dead-lettered or its
    /// key was taken by a newer task.
    fn reset_dead_letter(&mut self, task_id: TaskId, now_ms: u128) -> Result<(), GatewayError>;
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Worth retrying.
    Transient(String),
    /// Retrying cannot help.
    Permanent(String),
}

impl From<GatewayError> for TaskFailure {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::TaskFailed {
                permanent: true,
                reason,
            } => Self::Permanent(reason),
            GatewayError::TaskFailed { reason, .. } => Self::Transient(reason),
            e @ (GatewayError::PoolExhausted(_)
            | GatewayError::RateLimited { .. }
            | GatewayError::CacheLoadFailed(_)
            | GatewayError::Backend(_)) => Self::Transient(e.to_string()),
            other => Self::Permanent(other.to_string()),
        }
    }
}

impl From<TaskFailure> for GatewayError {
    fn from(failure: TaskFailure) -> Self {
        match failure {
            TaskFailure::Transient(reason) => Self::TaskFailed {
                permanent: false,
                reason,
            },
            TaskFailure::Permanent(reason) => Self::TaskFailed {
                permanent: true,
                reason,
            },
        }
    }
}

/// Executes task bodies.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// enum Job { SendWelcome { user: String } }
///
/// impl TaskKind for Job {
///     fn kind(&self) -> &'static str { "send_welcome" }
/// }
///
/// struct Jobs;
///
/// #[async_trait]
/// impl TaskHandler<Job> for Jobs {
///     async fn handle(&self, task: &TaskRecord<Job>) -> Result<(), TaskFailure> {
///         match &task.payload {
///             Job::SendWelcome { user } => mailer::send(user).await.map_err(TaskFailure::from),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler<P>: Send + Sync + 'static {
    /// Run one attempt of `task`.
    async fn handle(&self, task: &TaskRecord<P>) -> Result<(), TaskFailure>;
}

/// Retry, liveness and throughput settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Attempts before a transiently failing task is dead-lettered.
    pub max_attempts: u32,
    /// Backoff after the first failure.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
    /// Running tasks without a heartbeat for this long are reclaimed.
    pub liveness_deadline: Duration,
    /// Sleep between idle poll passes.
    pub poll_interval: Duration,
    /// Attempts run concurrently per pass.
    pub concurrency: usize,
    /// Upper bound on tasks claimed per pass.
    pub batch_size: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
            liveness_deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            concurrency: num_cpus::get(),
            batch_size: 32,
        }
    }
}

impl DispatcherSettings {
    /// Heartbeat period: a third of the liveness deadline.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.liveness_deadline / 3).max(Duration::from_millis(1))
    }

    fn claim_limit(&self) -> usize {
        self.batch_size.min(self.concurrency).max(1)
    }
}

/// Backoff before attempt `attempt + 1`: `min(max, base * 2^(attempt-1))`
/// scaled by `jitter`, which is clamped to `[0.5, 1.0]`.
#[must_use]
pub fn backoff_delay(settings: &DispatcherSettings, attempt: u32, jitter: f64) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let raw = settings
        .backoff_base
        .checked_mul(1u32 << exp)
        .unwrap_or(settings.max_backoff);
    raw.min(settings.max_backoff).mul_f64(jitter.clamp(0.5, 1.0))
}

/// Tally of one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Stale running tasks returned to the queue.
    pub reclaimed: usize,
    /// Tasks claimed this pass.
    pub claimed: usize,
    /// Attempts that succeeded.
    pub succeeded: usize,
    /// Attempts scheduled for retry.
    pub retried: usize,
    /// Tasks moved to `dead_letter`.
    pub dead_lettered: usize,
    /// Outcomes dropped because the lease was lost.
    pub lost_leases: usize,
}

/// Serialized form of a follow-up task carried through the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Deduplication key.
    pub idempotency_key: String,
    /// Serialized [`TaskKind`] payload.
    pub payload: Value,
}

impl TaskRequest {
    /// Outbox event that enqueues `payload` under `idempotency_key` once
    /// published.
    ///
    /// # Errors
    ///
    /// `Backend` if the payload does not serialize.
    pub fn event<P: TaskKind>(idempotency_key: impl Into<String>, payload: &P) -> Result<OutboxEvent, GatewayError> {
        let request = Self {
            idempotency_key: idempotency_key.into(),
            payload: serde_json::to_value(payload).map_err(GatewayError::backend)?,
        };
        let body = serde_json::to_value(&request).map_err(GatewayError::backend)?;
        Ok(OutboxEvent::new(TASK_TOPIC, body))
    }
}

/// Polls a [`TaskStore`] and runs due tasks through a [`TaskHandler`].
pub struct Dispatcher<P, S, H> {
    inner: Arc<DispatcherInner<P, S, H>>,
}

struct DispatcherInner<P, S, H> {
    store: Mutex<S>,
    handler: H,
    settings: DispatcherSettings,
    clock: SharedClock,
    _payload: PhantomData<fn() -> P>,
}

impl<P, S, H> Clone for Dispatcher<P, S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Outcome {
    Succeeded,
    Retried,
    DeadLettered,
    LostLease,
    StoreError,
}

impl<P, S, H> Dispatcher<P, S, H>
where
    P: TaskKind,
    S: TaskStore<P>,
    H: TaskHandler<P>,
{
    /// Create a dispatcher over `store`.
    pub fn new(store: S, handler: H, settings: DispatcherSettings, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                store: Mutex::new(store),
                handler,
                settings,
                clock,
                _payload: PhantomData,
            }),
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    /// Submit work. Returns the existing task when `idempotency_key` is
    /// already owned by a task that is not dead-lettered.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    pub fn enqueue(&self, idempotency_key: &str, payload: P) -> Result<TaskId, GatewayError> {
        self.submit(idempotency_key, payload, None)
    }

    fn submit(&self, idempotency_key: &str, payload: P, source: Option<EventId>) -> Result<TaskId, GatewayError> {
        let now = self.inner.clock.now_ms();
        let kind = payload.kind();
        let enqueued = {
            let mut store = self.inner.store.lock();
            match source {
                Some(event_id) => store.enqueue_from_event(event_id, idempotency_key, kind, payload, now)?,
                None => store.enqueue(idempotency_key, kind, payload, now)?,
            }
        };
        if enqueued.created {
            tracing::debug!(task_id = %enqueued.task_id, kind, key = idempotency_key, "task enqueued");
        } else {
            tracing::trace!(task_id = %enqueued.task_id, key = idempotency_key, "duplicate enqueue ignored");
        }
        Ok(enqueued.task_id)
    }

    /// Current record of a task.
    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord<P>> {
        self.inner.store.lock().get(task_id)
    }

    /// Tasks currently in `state`.
    pub fn tasks_in(&self, state: TaskState) -> Vec<TaskRecord<P>> {
        self.inner.store.lock().by_state(state)
    }

    /// Requeue a dead-lettered task with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// See [`TaskStore::reset_dead_letter`].
    pub fn reset_dead_letter(&self, task_id: TaskId) -> Result<(), GatewayError> {
        let now = self.inner.clock.now_ms();
        self.inner.store.lock().reset_dead_letter(task_id, now)?;
        tracing::info!(%task_id, "dead-lettered task reset by operator");
        Ok(())
    }

    /// One poll pass: reclaim stale attempts, claim due tasks, run them
    /// concurrently and record the outcomes.
    ///
    /// # Errors
    ///
    /// Store failures while reclaiming or claiming. Failures recording an
    /// individual outcome are logged; the attempt is reclaimed later.
    pub async fn run_once(&self) -> Result<RunReport, GatewayError> {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let reclaimed = inner
            .store
            .lock()
            .reclaim_stale(now, duration_ms(inner.settings.liveness_deadline))?;
        for task_id in &reclaimed {
            tracing::warn!(%task_id, "reclaimed task with expired heartbeat");
        }
        let claimed = inner
            .store
            .lock()
            .claim_ready(now, inner.settings.claim_limit())?;
        let mut report = RunReport {
            reclaimed: reclaimed.len(),
            claimed: claimed.len(),
            ..RunReport::default()
        };

        let attempts = claimed.into_iter().map(|task| {
            let inner = Arc::clone(inner);
            tokio::spawn(async move { inner.attempt(task).await })
        });
        for outcome in futures::future::join_all(attempts).await {
            match outcome {
                Ok(Outcome::Succeeded) => report.succeeded += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::DeadLettered) => report.dead_lettered += 1,
                Ok(Outcome::LostLease) => report.lost_leases += 1,
                Ok(Outcome::StoreError) => {}
                Err(e) => tracing::error!(error = %e, "task attempt aborted"),
            }
        }
        Ok(report)
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.inner.settings.concurrency,
            "task dispatcher started"
        );
        while !*shutdown.borrow() {
            match self.run_once().await {
                // A full pass likely left more work due.
                Ok(report) if report.claimed >= self.inner.settings.claim_limit() => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "dispatcher pass failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(self.inner.settings.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("task dispatcher stopped");
    }
}

impl<P, S, H> DispatcherInner<P, S, H>
where
    P: TaskKind,
    S: TaskStore<P>,
    H: TaskHandler<P>,
{
    async fn attempt(&self, task: TaskRecord<P>) -> Outcome {
        let (task_id, lease) = (task.task_id, task.lease);
        tracing::debug!(%task_id, kind = %task.kind, attempt = task.attempt_count, "task claimed");

        let work = AssertUnwindSafe(self.handler.handle(&task)).catch_unwind();
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let result = loop {
            tokio::select! {
                res = &mut work => break res,
                _ = ticker.tick() => {
                    let beat = self.store.lock().heartbeat(task_id, lease, self.clock.now_ms());
                    match beat {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(%task_id, "heartbeat rejected, lease lost"),
                        Err(e) => tracing::warn!(%task_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        };
        let result = result
            .unwrap_or_else(|_| Err(TaskFailure::Transient("task handler panicked".into())));

        let now = self.clock.now_ms();
        let completion = match result {
            Ok(()) => Completion::Succeeded,
            Err(TaskFailure::Permanent(error)) => Completion::DeadLetter { error },
            Err(TaskFailure::Transient(error)) if task.attempt_count >= self.settings.max_attempts => {
                Completion::DeadLetter { error }
            }
            Err(TaskFailure::Transient(error)) => {
                let jitter = rand::rng().random_range(0.5..=1.0);
                let delay = backoff_delay(&self.settings, task.attempt_count, jitter);
                Completion::Retry {
                    at_ms: now + duration_ms(delay),
                    error,
                }
            }
        };

        let outcome = match &completion {
            Completion::Succeeded => Outcome::Succeeded,
            Completion::Retry { at_ms, error } => {
                tracing::info!(%task_id, attempt = task.attempt_count, retry_at_ms = at_ms, %error, "task failed, retry scheduled");
                Outcome::Retried
            }
            Completion::DeadLetter { error } => {
                tracing::warn!(%task_id, attempt = task.attempt_count, %error, "task dead-lettered");
                Outcome::DeadLettered
            }
        };
        let recorded = self.store.lock().finish(task_id, lease, completion, now);
        match recorded {
            Ok(true) => outcome,
            Ok(false) => {
                tracing::warn!(%task_id, "outcome dropped, task was reclaimed");
                Outcome::LostLease
            }
            Err(e) => {
                tracing::error!(%task_id, error = %e, "failed to record task outcome");
                Outcome::StoreError
            }
        }
    }
}

#[async_trait]
impl<P, S, H> OutboxSubscriber for Dispatcher<P, S, H>
where
    P: TaskKind,
    S: TaskStore<P>,
    H: TaskHandler<P>,
{
    fn name(&self) -> &str {
        "task-dispatcher"
    }

    async fn deliver(&self, event: &PublishedEvent) -> Result<(), GatewayError> {
        if event.topic != TASK_TOPIC {
            return Ok(());
        }
        let parsed = serde_json::from_value::<TaskRequest>(event.payload.clone()).and_then(|req| {
            serde_json::from_value::<P>(req.payload).map(|payload| (req.idempotency_key, payload))
        });
        match parsed {
            Ok((key, payload)) => self.submit(&key, payload, Some(event.event_id)).map(|_| ()),
            Err(e) => {
                // Redelivery cannot fix a malformed body.
                tracing::error!(event_id = %event.event_id, error = %e, "dropping malformed task request");
                Ok(())
            }
        }
    }
}
