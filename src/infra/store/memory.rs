//! In-memory transactional store.
//!
//! Named tables map string keys to JSON documents in key order, next to an
//! append-only outbox table. A [`Transaction`] stages writes and outbox
//! records and applies them all under one lock on commit, so a mutation and
//! its outbox record are never observed apart.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::core::cursor::{KeysetSource, SortKey, SortKind, SortValue};
use crate::core::gateway::TransactionalConnection;
use crate::core::outbox::{OutboxConnection, OutboxRecord, UnitOfWork};
use crate::core::resource_pool::ResourceManager;
use crate::core::GatewayError;
use crate::util::serde::EventId;

type Table = BTreeMap<String, Value>;

#[derive(Default)]
struct StoreData {
    tables: HashMap<String, Table>,
    outbox: Vec<OutboxRecord>,
    event_ids: HashSet<EventId>,
}

/// Shared in-memory database.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
    offline: AtomicBool,
    commits: AtomicU64,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Committed document at `table`/`key`.
    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.data
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    /// Up to `limit` committed rows of `table` with keys strictly after
    /// `after`, in key order.
    pub fn scan(&self, table: &str, after: Option<&str>, limit: usize) -> Vec<(String, Value)> {
        let data = self.data.lock();
        let Some(rows) = data.tables.get(table) else {
            return Vec::new();
        };
        let lower = after.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_string()));
        rows.range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of committed rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.data.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Snapshot of the outbox table in insertion order.
    pub fn outbox(&self) -> Vec<OutboxRecord> {
        self.data.lock().outbox.clone()
    }

    /// Number of outbox records still pending.
    pub fn pending_count(&self) -> usize {
        self.data
            .lock()
            .outbox
            .iter()
            .filter(|r| r.is_pending())
            .count()
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Simulate losing the backing store; every operation fails until the
    /// store comes back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn ensure_online(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(GatewayError::Backend("store offline".into()));
        }
        Ok(())
    }
}

/// A pooled connection to a [`MemoryStore`].
pub struct StoreConnection {
    id: u64,
    store: Arc<MemoryStore>,
}

impl StoreConnection {
    /// Connection number assigned by the manager.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Committed document at `table`/`key`.
    ///
    /// # Errors
    ///
    /// `Backend` when the store is offline.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Value>, GatewayError> {
        self.store.ensure_online()?;
        Ok(self.store.get(table, key))
    }

    /// Open a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction {
            store: Arc::clone(&self.store),
            writes: BTreeMap::new(),
            events: Vec::new(),
            finished: false,
        }
    }

    /// Round-trip to the store.
    ///
    /// # Errors
    ///
    /// `Backend` when the store is offline.
    pub fn ping(&self) -> Result<(), GatewayError> {
        self.store.ensure_online()
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Row puts and deletes applied.
    pub writes: usize,
    /// Outbox records appended.
    pub events: usize,
}

/// Staged writes and outbox records. Dropping without commit discards them.
pub struct Transaction {
    store: Arc<MemoryStore>,
    writes: BTreeMap<(String, String), Option<Value>>,
    events: Vec<OutboxRecord>,
    finished: bool,
}

impl Transaction {
    /// Document at `table`/`key` as this transaction sees it.
    ///
    /// # Errors
    ///
    /// `Backend` when the store is offline.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<Value>, GatewayError> {
        if let Some(staged) = self.writes.get(&(table.to_string(), key.to_string())) {
            return Ok(staged.clone());
        }
        self.store.ensure_online()?;
        Ok(self.store.get(table, key))
    }

    /// Stage an insert or overwrite.
    pub fn put(&mut self, table: impl Into<String>, key: impl Into<String>, value: Value) {
        self.writes.insert((table.into(), key.into()), Some(value));
    }

    /// Stage a delete.
    pub fn delete(&mut self, table: impl Into<String>, key: impl Into<String>) {
        self.writes.insert((table.into(), key.into()), None);
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.events.is_empty()
    }

    /// Apply every staged write and outbox record atomically.
    ///
    /// # Errors
    ///
    /// `DuplicateEvent` if a staged event id already exists in the outbox;
    /// `Backend` when the store is offline. Nothing is applied on error.
    pub fn commit(mut self) -> Result<CommitReceipt, GatewayError> {
        self.finished = true;
        if self.is_empty() {
            return Ok(CommitReceipt::default());
        }
        self.store.ensure_online()?;
        let mut data = self.store.data.lock();
        if let Some(dup) = self.events.iter().find(|e| data.event_ids.contains(&e.event_id)) {
            return Err(GatewayError::DuplicateEvent(dup.event_id));
        }
        let receipt = CommitReceipt {
            writes: self.writes.len(),
            events: self.events.len(),
        };
        for ((table, key), value) in std::mem::take(&mut self.writes) {
            let rows = data.tables.entry(table).or_default();
            match value {
                Some(value) => {
                    rows.insert(key, value);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        for record in std::mem::take(&mut self.events) {
            data.event_ids.insert(record.event_id);
            data.outbox.push(record);
        }
        drop(data);
        self.store.commits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(writes = receipt.writes, events = receipt.events, "transaction committed");
        Ok(receipt)
    }
}

impl UnitOfWork for Transaction {
    fn stage_event(&mut self, record: OutboxRecord) -> Result<(), GatewayError> {
        if self.events.iter().any(|e| e.event_id == record.event_id) {
            return Err(GatewayError::DuplicateEvent(record.event_id));
        }
        self.events.push(record);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.is_empty() {
            tracing::debug!(
                writes = self.writes.len(),
                events = self.events.len(),
                "transaction rolled back"
            );
        }
    }
}

impl TransactionalConnection for StoreConnection {
    type Tx = Transaction;

    fn begin(&mut self) -> Transaction {
        Self::begin(self)
    }

    fn commit(&mut self, tx: Transaction) -> Result<(), GatewayError> {
        tx.commit().map(|_| ())
    }
}

#[async_trait]
impl OutboxConnection for StoreConnection {
    async fn pending_events(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, GatewayError> {
        self.store.ensure_online()?;
        Ok(self
            .store
            .data
            .lock()
            .outbox
            .iter()
            .filter(|r| r.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&mut self, ids: &[EventId], at_ms: u128) -> Result<usize, GatewayError> {
        self.store.ensure_online()?;
        let wanted: HashSet<&EventId> = ids.iter().collect();
        let mut marked = 0;
        for record in &mut self.store.data.lock().outbox {
            if record.is_pending() && wanted.contains(&record.event_id) {
                record.published_at_ms = Some(at_ms);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn purge_published(&mut self, before_ms: u128) -> Result<usize, GatewayError> {
        self.store.ensure_online()?;
        let mut data = self.store.data.lock();
        let before = data.outbox.len();
        data.outbox
            .retain(|r| r.published_at_ms.map_or(true, |at| at >= before_ms));
        Ok(before - data.outbox.len())
    }
}

impl KeysetSource for StoreConnection {
    fn key_shape(&self, _table: &str) -> Vec<SortKind> {
        vec![SortKind::Str]
    }

    fn scan_after(
        &mut self,
        table: &str,
        after: Option<&[SortValue]>,
        limit: usize,
    ) -> Result<Vec<(SortKey, Value)>, GatewayError> {
        self.store.ensure_online()?;
        let after = match after {
            None => None,
            Some([SortValue::Str(key)]) => Some(key.as_str()),
            Some(other) => {
                return Err(GatewayError::InvalidCursor(format!(
                    "table keys are single strings, got {other:?}"
                )))
            }
        };
        Ok(self
            .store
            .scan(table, after, limit)
            .into_iter()
            .map(|(k, v)| (vec![SortValue::Str(k)], v))
            .collect())
    }
}

/// Opens [`StoreConnection`]s for a pool, with fault injection for tests.
pub struct MemoryStoreManager {
    store: Arc<MemoryStore>,
    next_id: AtomicU64,
    failing_creates: AtomicU32,
    failing_checks: AtomicU32,
}

impl MemoryStoreManager {
    /// Manager for `store`.
    pub const fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            next_id: AtomicU64::new(1),
            failing_creates: AtomicU32::new(0),
            failing_checks: AtomicU32::new(0),
        }
    }

    /// The store connections point at.
    pub const fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::Release);
    }

    /// Make the next `n` health checks fail.
    pub fn fail_next_checks(&self, n: u32) {
        self.failing_checks.store(n, Ordering::Release);
    }

    /// Take the store offline or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.store.set_offline(offline);
    }

    /// Connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ResourceManager for MemoryStoreManager {
    type Resource = StoreConnection;

    async fn create(&self) -> Result<StoreConnection, GatewayError> {
        if take_fault(&self.failing_creates) {
            return Err(GatewayError::Backend("connection refused".into()));
        }
        self.store.ensure_online()?;
        Ok(StoreConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            store: Arc::clone(&self.store),
        })
    }

    async fn check(&self, conn: &mut StoreConnection) -> Result<(), GatewayError> {
        if take_fault(&self.failing_checks) {
            return Err(GatewayError::Backend(format!("connection {} reset", conn.id)));
        }
        conn.ping()
    }
}
