//! Request composition.
//!
//! [`Gateway::handle`] admits the request, resolves its operation, consults
//! the cache and, on a miss or for uncached operations, runs the operation in
//! a transaction on a pooled slot. Outbox events the operation emits, follow-up
//! tasks included, commit in that same transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::core::admission::{Admission, AdmissionController};
use crate::core::background::{BackgroundLoop, Spawn};
use crate::core::cache::{Cache, CacheStats, LoadOptions};
use crate::core::cursor::{paginate, CursorCodec, KeysetSource, Page};
use crate::core::dispatcher::{TaskKind, TaskRequest};
use crate::core::outbox::{OutboxConnection, OutboxEvent, OutboxRecorder, UnitOfWork};
use crate::core::resource_pool::{PoolStats, ResourceManager, ResourcePool};
use crate::core::{Fingerprint, GatewayError};
use crate::util::clock::SharedClock;
use crate::util::serde::AdmissionKey;

/// Largest page a listing returns regardless of the requested size.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// A pooled resource able to run units of work.
pub trait TransactionalConnection: Send + 'static {
    /// Unit of work type.
    type Tx: UnitOfWork + Send + 'static;

    /// Open a unit of work.
    fn begin(&mut self) -> Self::Tx;

    /// Apply a unit of work atomically.
    ///
    /// # Errors
    ///
    /// Backend failures and outbox uniqueness violations; nothing is applied.
    fn commit(&mut self, tx: Self::Tx) -> Result<(), GatewayError>;
}

/// Unit of work type of a manager's resources.
pub type TxOf<M> = <<M as ResourceManager>::Resource as TransactionalConnection>::Tx;

/// Whether and how an operation's results are cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always execute.
    #[default]
    Bypass,
    /// Cache by request fingerprint.
    Cache {
        /// Overrides the cache's default TTL.
        ttl: Option<Duration>,
        /// Tags for group invalidation.
        tags: Vec<String>,
    },
}

/// Side effects an operation asks to commit with its unit of work.
#[derive(Debug, Default)]
pub struct Effects {
    events: Vec<OutboxEvent>,
}

impl Effects {
    /// Record an outbox event.
    pub fn emit(&mut self, event: OutboxEvent) {
        self.events.push(event);
    }

    /// Enqueue a follow-up task once the unit of work commits.
    ///
    /// # Errors
    ///
    /// `Backend` if the payload does not serialize.
    pub fn follow_up<P: TaskKind>(&mut self, idempotency_key: impl Into<String>, payload: &P) -> Result<(), GatewayError> {
        self.events.push(TaskRequest::event(idempotency_key, payload)?);
        Ok(())
    }

    /// Events staged so far.
    pub fn events(&self) -> &[OutboxEvent] {
        &self.events
    }
}

/// A named request handler.
#[async_trait]
pub trait Operation<T: Send>: Send + Sync + 'static {
    /// Cache policy for a request with `params`.
    fn cache_policy(&self, _params: &Value) -> CachePolicy {
        CachePolicy::Bypass
    }

    /// Run the operation inside `tx`. Returning an error rolls `tx` back.
    async fn execute(&self, tx: &mut T, params: &Value, effects: &mut Effects) -> Result<Value, GatewayError>;
}

/// Point-in-time view of the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Pool statistics.
    pub pool: PoolStats,
    /// Cache statistics.
    pub cache: CacheStats,
    /// Live rate buckets.
    pub rate_buckets: usize,
    /// Registered operations.
    pub operations: usize,
}

/// The serving core: admission, pool, cache and outbox composed behind
/// [`handle`](Self::handle). Cheap to clone.
pub struct Gateway<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    inner: Arc<GatewayInner<M>>,
}

struct GatewayInner<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    admission: AdmissionController,
    pool: ResourcePool<M>,
    cache: Cache<Value>,
    recorder: OutboxRecorder<M>,
    operations: RwLock<HashMap<String, Arc<dyn Operation<TxOf<M>>>>>,
    loops: RwLock<Vec<Arc<dyn BackgroundLoop>>>,
    maintenance_interval: Duration,
    shutdown: watch::Sender<bool>,
    clock: SharedClock,
}

impl<M> Clone for Gateway<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> Gateway<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    /// Compose a gateway from its parts.
    pub fn new(
        admission: AdmissionController,
        pool: ResourcePool<M>,
        cache: Cache<Value>,
        recorder: OutboxRecorder<M>,
        maintenance_interval: Duration,
        clock: SharedClock,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(GatewayInner {
                admission,
                pool,
                cache,
                recorder,
                operations: RwLock::new(HashMap::new()),
                loops: RwLock::new(Vec::new()),
                maintenance_interval,
                shutdown,
                clock,
            }),
        }
    }

    /// Register `operation` under `key`, replacing any previous one.
    pub fn register<O>(&self, key: impl Into<String>, operation: O)
    where
        O: Operation<TxOf<M>>,
    {
        let key = key.into();
        tracing::debug!(operation = %key, "operation registered");
        self.inner
            .operations
            .write()
            .insert(key, Arc::new(operation));
    }

    /// Add a loop for [`start_background`](Self::start_background) to run,
    /// e.g. an outbox publisher or a task dispatcher.
    pub fn add_background_loop(&self, background: Arc<dyn BackgroundLoop>) {
        self.inner.loops.write().push(background);
    }

    /// Admission controller.
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Resource pool.
    pub fn pool(&self) -> &ResourcePool<M> {
        &self.inner.pool
    }

    /// Response cache.
    pub fn cache(&self) -> &Cache<Value> {
        &self.inner.cache
    }

    /// Outbox recorder.
    pub fn recorder(&self) -> &OutboxRecorder<M> {
        &self.inner.recorder
    }

    /// Serve one request.
    ///
    /// # Errors
    ///
    /// `RateLimited` when admission denies or delays the request (never
    /// retried here), `UnknownOperation`, `PoolExhausted`, `CacheLoadFailed`
    /// for failed cached loads, or the operation's own error.
    pub async fn handle(
        &self,
        operation_key: &str,
        admission_key: &AdmissionKey,
        params: Value,
    ) -> Result<Value, GatewayError> {
        match self.inner.admission.admit(admission_key) {
            Admission::Accepted { .. } => {}
            Admission::Rejected { retry_after } => {
                return Err(GatewayError::RateLimited { retry_after });
            }
            Admission::Delayed { until_ms } => {
                let wait = until_ms.saturating_sub(self.inner.clock.now_ms());
                return Err(GatewayError::RateLimited {
                    retry_after: Duration::from_millis(u64::try_from(wait).unwrap_or(u64::MAX)),
                });
            }
        }

        let operation = self
            .inner
            .operations
            .read()
            .get(operation_key)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownOperation(operation_key.to_string()))?;

        match operation.cache_policy(&params) {
            CachePolicy::Bypass => Arc::clone(&self.inner).execute(operation, params).await,
            CachePolicy::Cache { ttl, tags } => {
                let fingerprint = Fingerprint::compute(operation_key, &params);
                let inner = Arc::clone(&self.inner);
                self.inner
                    .cache
                    .get_or_load_with(&fingerprint, LoadOptions { ttl, tags }, move || {
                        inner.execute(operation, params)
                    })
                    .await
            }
        }
    }

    /// Spawn every registered background loop plus the maintenance loop
    /// (idle slot and bucket eviction, outbox purge).
    pub fn start_background<S: Spawn>(&self, spawner: &S) {
        let loops = self.inner.loops.read().clone();
        for background in loops {
            let shutdown = self.inner.shutdown.subscribe();
            tracing::info!(name = background.name(), "starting background loop");
            spawner.spawn(async move { background.run(shutdown).await });
        }
        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        spawner.spawn(async move { inner.maintain(shutdown).await });
    }

    /// Signal every background loop to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// One maintenance pass, as run periodically in the background.
    pub async fn maintain_once(&self) {
        self.inner.maintenance_pass().await;
    }

    /// Current statistics.
    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            pool: self.inner.pool.stats(),
            cache: self.inner.cache.stats(),
            rate_buckets: self.inner.admission.bucket_count(),
            operations: self.inner.operations.read().len(),
        }
    }
}

impl<M> Gateway<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection + KeysetSource,
{
    /// One page of `table` in key order, after `cursor` when given.
    ///
    /// # Errors
    ///
    /// `InvalidCursor` for a cursor not minted for this table, `PoolExhausted`
    /// or backend failures.
    pub async fn list(&self, table: &str, cursor: Option<&str>, page_size: usize) -> Result<Page<Value>, GatewayError> {
        let mut slot = self.inner.pool.acquire_default().await?;
        let codec = CursorCodec::new(table, slot.key_shape(table));
        paginate(&mut *slot, &codec, table, cursor, page_size.min(MAX_PAGE_SIZE))
    }
}

impl<M> GatewayInner<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    async fn execute(
        self: Arc<Self>,
        operation: Arc<dyn Operation<TxOf<M>>>,
        params: Value,
    ) -> Result<Value, GatewayError> {
        let mut slot = self.pool.acquire_default().await?;
        let mut tx = slot.begin();
        let mut effects = Effects::default();
        let value = match operation.execute(&mut tx, &params, &mut effects).await {
            Ok(value) => value,
            Err(e) => {
                if matches!(e, GatewayError::Backend(_)) {
                    slot.mark_broken();
                }
                return Err(e);
            }
        };
        for event in effects.events {
            self.recorder.record(&mut tx, event)?;
        }
        if let Err(e) = slot.commit(tx) {
            if matches!(e, GatewayError::Backend(_)) {
                slot.mark_broken();
            }
            return Err(e);
        }
        Ok(value)
    }

    async fn maintenance_pass(&self) {
        let slots = self.pool.evict_idle();
        let buckets = self.admission.evict_idle();
        let purged = self.recorder.purge_expired().await;
        tracing::trace!(slots, buckets, purged, "maintenance pass");
    }

    async fn maintain(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.pool.warm_up().await {
            tracing::warn!(error = %e, "pool warm-up failed");
        }
        let mut ticker = tokio::time::interval(self.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => self.maintenance_pass().await,
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("maintenance loop stopped");
    }
}
