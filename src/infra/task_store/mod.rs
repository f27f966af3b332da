//! Task store backends for the dispatcher.

pub mod jsonl;
pub mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::dispatcher::{Completion, Enqueued, TaskRecord, TaskState, TaskStore};
use crate::core::GatewayError;
use crate::util::serde::{EventId, TaskId};

pub use jsonl::JsonlTaskStore;
pub use memory::InMemoryTaskStore;

/// Either backend, chosen at runtime from configuration.
pub enum AnyTaskStore<P> {
    /// Process-local table.
    Memory(InMemoryTaskStore<P>),
    /// JSON lines file.
    File(JsonlTaskStore<P>),
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            AnyTaskStore::Memory($store) => $call,
            AnyTaskStore::File($store) => $call,
        }
    };
}

impl<P> TaskStore<P> for AnyTaskStore<P>
where
    P: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn enqueue(&mut self, key: &str, kind: &str, payload: P, now_ms: u128) -> Result<Enqueued, GatewayError> {
        delegate!(self, s => s.enqueue(key, kind, payload, now_ms))
    }

    fn enqueue_from_event(
        &mut self,
        event_id: EventId,
        key: &str,
        kind: &str,
        payload: P,
        now_ms: u128,
    ) -> Result<Enqueued, GatewayError> {
        delegate!(self, s => s.enqueue_from_event(event_id, key, kind, payload, now_ms))
    }

    fn claim_ready(&mut self, now_ms: u128, limit: usize) -> Result<Vec<TaskRecord<P>>, GatewayError> {
        delegate!(self, s => s.claim_ready(now_ms, limit))
    }

    fn heartbeat(&mut self, task_id: TaskId, lease: u64, now_ms: u128) -> Result<bool, GatewayError> {
        delegate!(self, s => s.heartbeat(task_id, lease, now_ms))
    }

    fn finish(
        &mut self,
        task_id: TaskId,
        lease: u64,
        completion: Completion,
        now_ms: u128,
    ) -> Result<bool, GatewayError> {
        delegate!(self, s => s.finish(task_id, lease, completion, now_ms))
    }

    fn reclaim_stale(&mut self, now_ms: u128, deadline_ms: u128) -> Result<Vec<TaskId>, GatewayError> {
        delegate!(self, s => s.reclaim_stale(now_ms, deadline_ms))
    }

    fn get(&self, task_id: TaskId) -> Option<TaskRecord<P>> {
        delegate!(self, s => s.get(task_id))
    }

    fn by_state(&self, state: TaskState) -> Vec<TaskRecord<P>> {
        delegate!(self, s => s.by_state(state))
    }

    fn reset_dead_letter(&mut self, task_id: TaskId, now_ms: u128) -> Result<(), GatewayError> {
        delegate!(self, s => s.reset_dead_letter(task_id, now_ms))
    }
}
