//! In-memory task table.

use std::collections::HashMap;

use uuid::Uuid;

use crate::core::dispatcher::{Completion, Enqueued, TaskRecord, TaskState, TaskStore};
use crate::core::GatewayError;
use crate::util::serde::{EventId, TaskId};

/// Task table held in process memory; state is lost on restart.
///
/// The idempotency index maps each key to the newest task created for it.
/// Insertion checks and updates it in the same `&mut self` call, which the
/// dispatcher serializes behind its mutex. A second index remembers which
/// outbox event created each task.
#[derive(Clone)]
pub struct InMemoryTaskStore<P> {
    tasks: HashMap<TaskId, TaskRecord<P>>,
    by_key: HashMap<String, TaskId>,
    by_event: HashMap<EventId, TaskId>,
    next_lease: u64,
}

impl<P> Default for InMemoryTaskStore<P> {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            by_key: HashMap::new(),
            by_event: HashMap::new(),
            next_lease: 1,
        }
    }
}

impl<P> InMemoryTaskStore<P> {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from persisted rows.
    pub fn from_records(records: impl IntoIterator<Item = TaskRecord<P>>) -> Self {
        let mut rows: Vec<_> = records.into_iter().collect();
        rows.sort_by_key(|r| r.created_at_ms);
        let mut store = Self::default();
        for row in rows {
            store.next_lease = store.next_lease.max(row.lease + 1);
            store.by_key.insert(row.idempotency_key.clone(), row.task_id);
            if let Some(event_id) = row.source_event {
                store.by_event.insert(event_id, row.task_id);
            }
            store.tasks.insert(row.task_id, row);
        }
        store
    }

    /// Every row, oldest first.
    pub fn records(&self) -> Vec<&TaskRecord<P>> {
        let mut rows: Vec<_> = self.tasks.values().collect();
        rows.sort_by_key(|r| (r.created_at_ms, r.task_id));
        rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn insert(
        &mut self,
        key: &str,
        kind: &str,
        payload: P,
        now_ms: u128,
        source_event: Option<EventId>,
    ) -> Enqueued {
        if let Some(existing) = self.by_key.get(key).and_then(|id| self.tasks.get(id)) {
            if existing.state != TaskState::DeadLetter {
                let task_id = existing.task_id;
                if let Some(event_id) = source_event {
                    self.by_event.insert(event_id, task_id);
                }
                return Enqueued {
                    task_id,
                    created: false,
                };
            }
        }
        let task_id = Uuid::new_v4();
        self.tasks.insert(
            task_id,
            TaskRecord {
                task_id,
                idempotency_key: key.to_string(),
                kind: kind.to_string(),
                payload,
                attempt_count: 0,
                state: TaskState::Queued,
                next_retry_at_ms: now_ms,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
                heartbeat_at_ms: None,
                lease: 0,
                last_error: None,
                source_event,
            },
        );
        self.by_key.insert(key.to_string(), task_id);
        if let Some(event_id) = source_event {
            self.by_event.insert(event_id, task_id);
        }
        Enqueued {
            task_id,
            created: true,
        }
    }

    fn running_mut(&mut self, task_id: TaskId, lease: u64) -> Option<&mut TaskRecord<P>> {
        self.tasks
            .get_mut(&task_id)
            .filter(|t| t.state == TaskState::Running && t.lease == lease)
    }
}

impl<P> TaskStore<P> for InMemoryTaskStore<P>
where
    P: Clone + Send + 'static,
{
    fn enqueue(&mut self, key: &str, kind: &str, payload: P, now_ms: u128) -> Result<Enqueued, GatewayError> {
        Ok(self.insert(key, kind, payload, now_ms, None))
    }

    fn enqueue_from_event(
        &mut self,
        event_id: EventId,
        key: &str,
        kind: &str,
        payload: P,
        now_ms: u128,
    ) -> Result<Enqueued, GatewayError> {
        if let Some(&task_id) = self.by_event.get(&event_id) {
            return Ok(Enqueued {
                task_id,
                created: false,
            });
        }
        Ok(self.insert(key, kind, payload, now_ms, Some(event_id)))
    }

    fn claim_ready(&mut self, now_ms: u128, limit: usize) -> Result<Vec<TaskRecord<P>>, GatewayError> {
        let mut due: Vec<_> = self
            .tasks
            .values()
            .filter(|t| t.state.is_claimable() && t.next_retry_at_ms <= now_ms)
            .map(|t| (t.next_retry_at_ms, t.created_at_ms, t.task_id))
            .collect();
        due.sort_unstable();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, task_id) in due {
            let lease = self.next_lease;
            self.next_lease += 1;
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.state = TaskState::Running;
                task.attempt_count += 1;
                task.lease = lease;
                task.heartbeat_at_ms = Some(now_ms);
                task.updated_at_ms = now_ms;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    fn heartbeat(&mut self, task_id: TaskId, lease: u64, now_ms: u128) -> Result<bool, GatewayError> {
        Ok(self.running_mut(task_id, lease).is_some_and(|task| {
            task.heartbeat_at_ms = Some(now_ms);
            true
        }))
    }

    fn finish(
        &mut self,
        task_id: TaskId,
        lease: u64,
        completion: Completion,
        now_ms: u128,
    ) -> Result<bool, GatewayError> {
        let Some(task) = self.running_mut(task_id, lease) else {
            return Ok(false);
        };
        task.updated_at_ms = now_ms;
        task.heartbeat_at_ms = None;
        match completion {
            Completion::Succeeded => {
                task.state = TaskState::Succeeded;
                task.last_error = None;
            }
            Completion::Retry { at_ms, error } => {
                task.state = TaskState::Failed;
                task.next_retry_at_ms = at_ms;
                task.last_error = Some(error);
            }
            Completion::DeadLetter { error } => {
                task.state = TaskState::DeadLetter;
                task.last_error = Some(error);
            }
        }
        Ok(true)
    }

    fn reclaim_stale(&mut self, now_ms: u128, deadline_ms: u128) -> Result<Vec<TaskId>, GatewayError> {
        let mut reclaimed = Vec::new();
        for task in self.tasks.values_mut() {
            let silent_since = task.heartbeat_at_ms.unwrap_or(task.updated_at_ms);
            if task.state == TaskState::Running && now_ms.saturating_sub(silent_since) > deadline_ms {
                task.state = TaskState::Queued;
                task.next_retry_at_ms = now_ms;
                task.heartbeat_at_ms = None;
                task.updated_at_ms = now_ms;
                // Invalidate the lost attempt's lease.
                task.lease = self.next_lease;
                self.next_lease += 1;
                reclaimed.push(task.task_id);
            }
        }
        Ok(reclaimed)
    }

    fn get(&self, task_id: TaskId) -> Option<TaskRecord<P>> {
        self.tasks.get(&task_id).cloned()
    }

    fn by_state(&self, state: TaskState) -> Vec<TaskRecord<P>> {
        self.records()
            .into_iter()
            .filter(|t| t.state == state)
            .cloned()
            .collect()
    }

    fn reset_dead_letter(&mut self, task_id: TaskId, now_ms: u128) -> Result<(), GatewayError> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(GatewayError::TaskNotFound(task_id))?;
        if task.state != TaskState::DeadLetter {
            return Err(GatewayError::Backend(format!(
                "task {task_id} is {:?}, not dead-lettered",
                task.state
            )));
        }
        if self.by_key.get(&task.idempotency_key) != Some(&task_id) {
            return Err(GatewayError::Backend(format!(
                "idempotency key {} was reused by a newer task",
                task.idempotency_key
            )));
        }
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.state = TaskState::Queued;
            task.attempt_count = 0;
            task.next_retry_at_ms = now_ms;
            task.updated_at_ms = now_ms;
        }
        Ok(())
    }
}
