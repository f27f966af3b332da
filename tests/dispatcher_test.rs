//! Durable task dispatcher tests.
//!
//! This test suite validates:
//! - Enqueue is idempotent on the caller's key
//! - Transient failures retry with backoff, then dead-letter
//! - Permanent failures and panics
//! - Operator reset of dead-lettered tasks
//! - Reclaim of attempts whose heartbeat went quiet
//! - The file-backed store survives a restart and rejects half-applied writes
//! - Follow-up requests arriving through the outbox, including redelivery
//!   after the task was dead-lettered

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_gateway::core::{
    Dispatcher, DispatcherSettings, GatewayError, OutboxEvent, OutboxSubscriber, PublishedEvent, TaskFailure,
    TaskHandler, TaskKind, TaskRecord, TaskRequest, TaskState, TaskStore, TASK_TOPIC,
};
use prometheus_gateway::infra::{InMemoryTaskStore, JsonlTaskStore};
use prometheus_gateway::util::ManualClock;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Job {
    Notify { user: String },
    Flaky { failures: u32 },
    AlwaysFail,
    Reject,
    Panic,
}

impl TaskKind for Job {
    fn kind(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notify",
            Self::Flaky { .. } => "flaky",
            Self::AlwaysFail => "always_fail",
            Self::Reject => "reject",
            Self::Panic => "panic",
        }
    }
}

#[derive(Clone, Default)]
struct Handler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler<Job> for Handler {
    async fn handle(&self, task: &TaskRecord<Job>) -> Result<(), TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &task.payload {
            Job::Notify { .. } => Ok(()),
            Job::Flaky { failures } if task.attempt_count <= *failures => {
                Err(TaskFailure::Transient(format!("attempt {} timed out", task.attempt_count)))
            }
            Job::Flaky { .. } => Ok(()),
            Job::AlwaysFail => Err(TaskFailure::Transient("upstream 503".into())),
            Job::Reject => Err(TaskFailure::Permanent("malformed address".into())),
            Job::Panic if task.attempt_count == 1 => panic!("handler bug"),
            Job::Panic => Ok(()),
        }
    }
}

type TestDispatcher<S> = Dispatcher<Job, S, Handler>;

fn settings() -> DispatcherSettings {
    DispatcherSettings {
        max_attempts: 3,
        backoff_base: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        liveness_deadline: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
        concurrency: 4,
        batch_size: 8,
    }
}

fn dispatcher(clock: &Arc<ManualClock>) -> (TestDispatcher<InMemoryTaskStore<Job>>, Handler) {
    let handler = Handler::default();
    let d = Dispatcher::new(InMemoryTaskStore::new(), handler.clone(), settings(), clock.clone());
    (d, handler)
}

fn notify(user: &str) -> Job {
    Job::Notify { user: user.into() }
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, handler) = dispatcher(&clock);

    let first = d.enqueue("welcome:alice", notify("alice")).unwrap();
    let second = d.enqueue("welcome:alice", notify("alice")).unwrap();
    assert_eq!(first, second);
    assert_eq!(d.tasks_in(TaskState::Queued).len(), 1);

    let report = d.run_once().await.unwrap();
    assert_eq!((report.claimed, report.succeeded), (1, 1));

    // A finished task still owns its key.
    assert_eq!(d.enqueue("welcome:alice", notify("alice")).unwrap(), first);
    d.run_once().await.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(d.get(first).unwrap().state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_transient_failure_retries_with_backoff() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);
    let id = d.enqueue("flaky", Job::Flaky { failures: 2 }).unwrap();

    let report = d.run_once().await.unwrap();
    assert_eq!(report.retried, 1);
    let task = d.get(id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("attempt 1 timed out"));
    // First backoff is base * jitter, jitter in [0.5, 1.0].
    assert!(task.next_retry_at_ms >= 1_050 && task.next_retry_at_ms <= 1_100);

    // Not due yet.
    assert_eq!(d.run_once().await.unwrap().claimed, 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(d.run_once().await.unwrap().retried, 1);
    clock.advance(Duration::from_secs(1));
    assert_eq!(d.run_once().await.unwrap().succeeded, 1);

    let task = d.get(id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.last_error, None);
}

#[tokio::test]
async fn test_dead_letter_after_max_attempts() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, handler) = dispatcher(&clock);
    let id = d.enqueue("doomed", Job::AlwaysFail).unwrap();

    for _ in 0..2 {
        assert_eq!(d.run_once().await.unwrap().retried, 1);
        clock.advance(Duration::from_secs(2));
    }
    assert_eq!(d.run_once().await.unwrap().dead_lettered, 1);

    let task = d.get(id).unwrap();
    assert_eq!(task.state, TaskState::DeadLetter);
    assert_eq!(task.attempt_count, 3);
    assert_eq!(task.last_error.as_deref(), Some("upstream 503"));

    // Dead-lettered tasks are never picked up on their own.
    clock.advance(Duration::from_secs(60));
    assert_eq!(d.run_once().await.unwrap().claimed, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_immediately() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);
    let id = d.enqueue("bad", Job::Reject).unwrap();

    assert_eq!(d.run_once().await.unwrap().dead_lettered, 1);
    let task = d.get(id).unwrap();
    assert_eq!(task.state, TaskState::DeadLetter);
    assert_eq!(task.attempt_count, 1);
}

#[tokio::test]
async fn test_panic_is_a_transient_failure() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);
    let id = d.enqueue("buggy", Job::Panic).unwrap();

    assert_eq!(d.run_once().await.unwrap().retried, 1);
    assert_eq!(d.get(id).unwrap().last_error.as_deref(), Some("task handler panicked"));

    clock.advance(Duration::from_secs(1));
    assert_eq!(d.run_once().await.unwrap().succeeded, 1);
}

#[tokio::test]
async fn test_reset_dead_letter() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);
    let id = d.enqueue("bad", Job::Reject).unwrap();
    d.run_once().await.unwrap();

    d.reset_dead_letter(id).unwrap();
    let task = d.get(id).unwrap();
    assert_eq!(task.state, TaskState::Queued);
    assert_eq!(task.attempt_count, 0);

    // Only dead-lettered tasks can be reset.
    assert!(matches!(d.reset_dead_letter(id), Err(GatewayError::Backend(_))));
    let unknown = uuid::Uuid::new_v4();
    assert_eq!(d.reset_dead_letter(unknown), Err(GatewayError::TaskNotFound(unknown)));
}

#[tokio::test]
async fn test_dead_letter_releases_idempotency_key() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);
    let old = d.enqueue("bad", Job::Reject).unwrap();
    d.run_once().await.unwrap();

    let new = d.enqueue("bad", notify("bob")).unwrap();
    assert_ne!(old, new);
    assert!(d.reset_dead_letter(old).is_err(), "key now owned by the newer task");
}

#[tokio::test]
async fn test_reclaims_silent_attempt() {
    let clock = Arc::new(ManualClock::new(1_000));

    // An attempt claimed by a worker that then disappeared.
    let mut store = InMemoryTaskStore::new();
    let enqueued = store.enqueue("orphan", "notify", notify("carol"), 1_000).unwrap();
    let lost = store.claim_ready(1_000, 1).unwrap();
    assert_eq!(lost[0].state, TaskState::Running);

    let handler = Handler::default();
    let d = Dispatcher::new(store, handler.clone(), settings(), clock.clone());

    clock.advance(Duration::from_secs(10));
    let report = d.run_once().await.unwrap();
    assert_eq!((report.reclaimed, report.claimed), (0, 0));

    clock.advance(Duration::from_secs(25));
    let report = d.run_once().await.unwrap();
    assert_eq!((report.reclaimed, report.succeeded), (1, 1));

    let task = d.get(enqueued.task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempt_count, 2);
    assert_ne!(task.lease, lost[0].lease);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = std::env::temp_dir().join(format!("gateway-tasks-{}", uuid::Uuid::new_v4()));
    let clock = Arc::new(ManualClock::new(1_000));

    let task_id = {
        let mut store = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();
        let enqueued = store.enqueue("welcome:dave", "notify", notify("dave"), 1_000).unwrap();
        store.enqueue("welcome:erin", "notify", notify("erin"), 1_001).unwrap();
        // Crash mid-attempt.
        store.claim_ready(1_000, 1).unwrap();
        assert!(store.file_path().exists());
        enqueued.task_id
    };

    let store = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();
    assert_eq!(store.get(task_id).unwrap().state, TaskState::Running);
    assert_eq!(store.by_state(TaskState::Queued).len(), 1);

    let d = Dispatcher::new(store, Handler::default(), settings(), clock.clone());
    assert_eq!(d.enqueue("welcome:dave", notify("dave")).unwrap(), task_id);

    clock.advance(Duration::from_secs(31));
    let report = d.run_once().await.unwrap();
    assert_eq!((report.reclaimed, report.succeeded), (1, 2));
    drop(d);

    let reopened = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();
    assert_eq!(reopened.by_state(TaskState::Succeeded).len(), 2);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_file_store_write_failure_leaves_no_phantom_task() {
    let dir = std::env::temp_dir().join(format!("gateway-tasks-{}", uuid::Uuid::new_v4()));
    let mut store = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();

    std::fs::remove_dir_all(&dir).unwrap();
    assert!(matches!(
        store.enqueue("welcome:gina", "notify", notify("gina"), 1_000),
        Err(GatewayError::Backend(_))
    ));
    assert!(store.by_state(TaskState::Queued).is_empty());

    std::fs::create_dir_all(&dir).unwrap();
    let retried = store.enqueue("welcome:gina", "notify", notify("gina"), 1_001).unwrap();
    assert!(retried.created);

    let reopened = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();
    assert_eq!(reopened.get(retried.task_id).unwrap().idempotency_key, "welcome:gina");
    let _ = std::fs::remove_dir_all(dir);
}

fn published(event: OutboxEvent) -> PublishedEvent {
    PublishedEvent {
        event_id: event.event_id,
        topic: event.topic,
        payload: event.payload,
        invalidates: event.invalidates,
        published_at_ms: 1_000,
    }
}

#[tokio::test]
async fn test_outbox_task_requests_enqueue_once() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);

    let event = published(TaskRequest::event("welcome:frank", &notify("frank")).unwrap());
    assert_eq!(event.topic, TASK_TOPIC);
    d.deliver(&event).await.unwrap();
    d.deliver(&event).await.unwrap();

    let queued = d.tasks_in(TaskState::Queued);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload, notify("frank"));
    assert_eq!(queued[0].kind, "notify");
}

#[tokio::test]
async fn test_redelivered_request_does_not_revive_dead_letter() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, handler) = dispatcher(&clock);

    let event = published(TaskRequest::event("invite:hank", &Job::Reject).unwrap());
    d.deliver(&event).await.unwrap();
    let report = d.run_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    // Another subscriber failed, so the publisher hands the event out again.
    d.deliver(&event).await.unwrap();
    assert!(d.tasks_in(TaskState::Queued).is_empty());
    assert_eq!(d.tasks_in(TaskState::DeadLetter).len(), 1);

    clock.advance(Duration::from_secs(60));
    assert_eq!(d.run_once().await.unwrap().claimed, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // A fresh request under the same key is new work.
    let retry = published(TaskRequest::event("invite:hank", &notify("hank")).unwrap());
    d.deliver(&retry).await.unwrap();
    assert_eq!(d.tasks_in(TaskState::Queued).len(), 1);
}

#[tokio::test]
async fn test_redelivery_dedup_survives_restart() {
    let dir = std::env::temp_dir().join(format!("gateway-tasks-{}", uuid::Uuid::new_v4()));
    let clock = Arc::new(ManualClock::new(1_000));
    let event = published(TaskRequest::event("invite:ivy", &Job::Reject).unwrap());

    {
        let store = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();
        let d = Dispatcher::new(store, Handler::default(), settings(), clock.clone());
        d.deliver(&event).await.unwrap();
        assert_eq!(d.run_once().await.unwrap().dead_lettered, 1);
    }

    let store = JsonlTaskStore::<Job>::open(&dir, "tasks").unwrap();
    let d = Dispatcher::new(store, Handler::default(), settings(), clock.clone());
    d.deliver(&event).await.unwrap();
    assert!(d.tasks_in(TaskState::Queued).is_empty());
    assert_eq!(d.tasks_in(TaskState::DeadLetter).len(), 1);
    drop(d);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_outbox_ignores_other_topics_and_malformed_requests() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, _) = dispatcher(&clock);

    d.deliver(&published(OutboxEvent::new("user.renamed", json!({}))))
        .await
        .unwrap();
    d.deliver(&published(OutboxEvent::new(
        TASK_TOPIC,
        json!({ "idempotency_key": "k", "payload": { "type": "unknown" } }),
    )))
    .await
    .unwrap();

    assert!(d.tasks_in(TaskState::Queued).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_loop_processes_and_stops() {
    let clock = Arc::new(ManualClock::new(1_000));
    let (d, handler) = dispatcher(&clock);
    let (stop, shutdown) = tokio::sync::watch::channel(false);

    let worker = {
        let d = d.clone();
        tokio::spawn(async move { d.run_loop(shutdown).await })
    };
    for user in ["a", "b", "c"] {
        d.enqueue(&format!("welcome:{user}"), notify(user)).unwrap();
    }

    for _ in 0..200 {
        if d.tasks_in(TaskState::Succeeded).len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(d.tasks_in(TaskState::Succeeded).len(), 3);

    stop.send_replace(true);
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("dispatcher loop stops on shutdown")
        .unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
}
