//! File-backed task table using JSON lines.
//!
//! One row per task. Every mutation is applied to a copy of the table, the
//! copy is written out, and only then does it replace the live table. A
//! failed write leaves both the file and the in-memory table untouched, so
//! the table on disk always matches the last acknowledged call and survives
//! a process restart. Fine for modest task volumes; a database-backed store
//! should take over beyond that.

use std::fs::{create_dir_all, rename, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::dispatcher::{Completion, Enqueued, TaskRecord, TaskState, TaskStore};
use crate::core::GatewayError;
use crate::infra::task_store::InMemoryTaskStore;
use crate::util::serde::{EventId, TaskId};

/// Durable task table persisted as `<dir>/<stream>.jsonl`.
pub struct JsonlTaskStore<P> {
    path: PathBuf,
    stream: String,
    table: InMemoryTaskStore<P>,
}

impl<P> JsonlTaskStore<P>
where
    P: Serialize + DeserializeOwned,
{
    /// Open (or create) the store, loading any rows already on disk.
    ///
    /// # Errors
    ///
    /// `Backend` on I/O or parse failures.
    pub fn open(path: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, GatewayError> {
        let path = path.as_ref().to_path_buf();
        let stream = stream.into();
        create_dir_all(&path).map_err(GatewayError::backend)?;
        let mut store = Self {
            path,
            stream,
            table: InMemoryTaskStore::new(),
        };
        store.load_from_disk()?;
        tracing::debug!(path = %store.file_path().display(), tasks = store.table.len(), "task store opened");
        Ok(store)
    }

    /// Location of the backing file.
    pub fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}.jsonl", self.stream))
    }

    fn load_from_disk(&mut self) -> Result<(), GatewayError> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(&file_path)
            .map_err(GatewayError::backend)?;
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(GatewayError::backend)?;
            if line.trim().is_empty() {
                continue;
            }
            let row: TaskRecord<P> = serde_json::from_str(&line).map_err(GatewayError::backend)?;
            rows.push(row);
        }
        self.table = InMemoryTaskStore::from_records(rows);
        Ok(())
    }

    fn write_table(&self, table: &InMemoryTaskStore<P>) -> Result<(), GatewayError> {
        let file_path = self.file_path();
        let tmp_path = file_path.with_extension("jsonl.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(GatewayError::backend)?;
        let mut writer = BufWriter::new(file);
        for row in table.records() {
            let line = serde_json::to_string(row).map_err(GatewayError::backend)?;
            writeln!(writer, "{line}").map_err(GatewayError::backend)?;
        }
        writer.flush().map_err(GatewayError::backend)?;
        rename(&tmp_path, &file_path).map_err(GatewayError::backend)
    }
}

impl<P> JsonlTaskStore<P>
where
    P: Serialize + DeserializeOwned + Clone,
{
    /// Run `op` on a copy of the table; persist and adopt the copy when
    /// `changed` says the outcome touched it.
    fn mutate<T>(
        &mut self,
        op: impl FnOnce(&mut InMemoryTaskStore<P>) -> Result<T, GatewayError>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, GatewayError> {
        let mut next = self.table.clone();
        let out = op(&mut next)?;
        if changed(&out) {
            self.write_table(&next)?;
            self.table = next;
        }
        Ok(out)
    }
}

impl<P> TaskStore<P> for JsonlTaskStore<P>
where
    P: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn enqueue(&mut self, key: &str, kind: &str, payload: P, now_ms: u128) -> Result<Enqueued, GatewayError> {
        self.mutate(|t| t.enqueue(key, kind, payload, now_ms), |e| e.created)
    }

    fn enqueue_from_event(
        &mut self,
        event_id: EventId,
        key: &str,
        kind: &str,
        payload: P,
        now_ms: u128,
    ) -> Result<Enqueued, GatewayError> {
        self.mutate(
            |t| t.enqueue_from_event(event_id, key, kind, payload, now_ms),
            |e| e.created,
        )
    }

    fn claim_ready(&mut self, now_ms: u128, limit: usize) -> Result<Vec<TaskRecord<P>>, GatewayError> {
        self.mutate(|t| t.claim_ready(now_ms, limit), |claimed| !claimed.is_empty())
    }

    fn heartbeat(&mut self, task_id: TaskId, lease: u64, now_ms: u128) -> Result<bool, GatewayError> {
        self.mutate(|t| t.heartbeat(task_id, lease, now_ms), |alive| *alive)
    }

    fn finish(
        &mut self,
        task_id: TaskId,
        lease: u64,
        completion: Completion,
        now_ms: u128,
    ) -> Result<bool, GatewayError> {
        self.mutate(|t| t.finish(task_id, lease, completion, now_ms), |applied| *applied)
    }

    fn reclaim_stale(&mut self, now_ms: u128, deadline_ms: u128) -> Result<Vec<TaskId>, GatewayError> {
        self.mutate(
            |t| t.reclaim_stale(now_ms, deadline_ms),
            |reclaimed| !reclaimed.is_empty(),
        )
    }

    fn get(&self, task_id: TaskId) -> Option<TaskRecord<P>> {
        self.table.get(task_id)
    }

    fn by_state(&self, state: TaskState) -> Vec<TaskRecord<P>> {
        self.table.by_state(state)
    }

    fn reset_dead_letter(&mut self, task_id: TaskId, now_ms: u128) -> Result<(), GatewayError> {
        self.mutate(|t| t.reset_dead_letter(task_id, now_ms), |_| true)
    }
}
