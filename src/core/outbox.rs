//! Transactional outbox.
//!
//! [`OutboxRecorder::record`] stages an event inside the caller's unit of
//! work, so the event commits or rolls back together with the mutation it
//! describes. [`OutboxPublisher`] polls pending records, hands them to every
//! subscriber and marks them published. Delivery is at-least-once:
//! subscribers deduplicate by `event_id` (see [`DedupSubscriber`]).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::core::cache::{Cache, InvalidationTarget};
use crate::core::resource_pool::{ResourceManager, ResourcePool};
use crate::core::GatewayError;
use crate::util::clock::{duration_ms, SharedClock};
use crate::util::serde::EventId;

/// An event to record alongside a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique id; generated when not supplied.
    pub event_id: EventId,
    /// Routing topic, e.g. `user.updated`.
    pub topic: String,
    /// Event body.
    pub payload: Value,
    /// Cache entries made stale by the mutation.
    #[serde(default)]
    pub invalidates: Vec<InvalidationTarget>,
}

impl OutboxEvent {
    /// New event with a fresh id.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            invalidates: Vec::new(),
        }
    }

    /// Attach a cache invalidation target.
    #[must_use]
    pub fn invalidating(mut self, target: InvalidationTarget) -> Self {
        self.invalidates.push(target);
        self
    }
}

/// A stored outbox row. Pending while `published_at_ms` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique event id.
    pub event_id: EventId,
    /// Routing topic.
    pub topic: String,
    /// Event body.
    pub payload: Value,
    /// Cache invalidation targets.
    pub invalidates: Vec<InvalidationTarget>,
    /// Time the owning unit of work staged the record.
    pub created_at_ms: u128,
    /// Time the publisher delivered it.
    pub published_at_ms: Option<u128>,
}

impl OutboxRecord {
    /// Whether the record still awaits publication.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.published_at_ms.is_none()
    }
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    /// Deduplication key.
    pub event_id: EventId,
    /// Routing topic.
    pub topic: String,
    /// Event body.
    pub payload: Value,
    /// Cache invalidation targets.
    pub invalidates: Vec<InvalidationTarget>,
    /// Publication time.
    pub published_at_ms: u128,
}

/// A unit of work able to carry outbox records to commit.
pub trait UnitOfWork {
    /// Stage a record; it becomes visible only if the unit commits.
    ///
    /// # Errors
    ///
    /// `DuplicateEvent` if the unit already stages this event id.
    fn stage_event(&mut self, record: OutboxRecord) -> Result<(), GatewayError>;
}

/// Outbox table access on a pooled connection.
#[async_trait]
pub trait OutboxConnection: Send {
    /// Oldest pending records, at most `limit`.
    async fn pending_events(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, GatewayError>;

    /// Mark records published; unknown or already published ids are ignored.
    async fn mark_published(&mut self, ids: &[EventId], at_ms: u128) -> Result<usize, GatewayError>;

    /// Delete published records published before `before_ms`.
    async fn purge_published(&mut self, before_ms: u128) -> Result<usize, GatewayError>;
}

/// Receives published events. Must be idempotent on `event_id`.
#[async_trait]
pub trait OutboxSubscriber: Send + Sync + 'static {
    /// Subscriber name for logs.
    fn name(&self) -> &str;

    /// Handle one event. An error leaves the record pending for redelivery.
    async fn deliver(&self, event: &PublishedEvent) -> Result<(), GatewayError>;
}

/// Records events in units of work and reads the outbox table back.
pub struct OutboxRecorder<M: ResourceManager> {
    pool: ResourcePool<M>,
    retention: Duration,
    clock: SharedClock,
}

impl<M: ResourceManager> Clone for OutboxRecorder<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            retention: self.retention,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<M> OutboxRecorder<M>
where
    M: ResourceManager,
    M::Resource: OutboxConnection,
{
    /// Create a recorder reading through `pool`.
    pub fn new(pool: ResourcePool<M>, retention: Duration, clock: SharedClock) -> Self {
        Self {
            pool,
            retention,
            clock,
        }
    }

    /// Stage `event` in `uow`. Must be called inside the unit of work that
    /// performs the mutation the event documents.
    ///
    /// # Errors
    ///
    /// Whatever the unit of work reports, e.g. `DuplicateEvent`.
    pub fn record<U: UnitOfWork + ?Sized>(
        &self,
        uow: &mut U,
        event: OutboxEvent,
    ) -> Result<EventId, GatewayError> {
        let event_id = event.event_id;
        uow.stage_event(OutboxRecord {
            event_id,
            topic: event.topic,
            payload: event.payload,
            invalidates: event.invalidates,
            created_at_ms: self.clock.now_ms(),
            published_at_ms: None,
        })?;
        Ok(event_id)
    }

    /// Oldest pending records, at most `batch_size`.
    ///
    /// # Errors
    ///
    /// Pool or backend failures.
    pub async fn drain(&self, batch_size: usize) -> Result<Vec<OutboxRecord>, GatewayError> {
        let mut slot = self.pool.acquire_default().await?;
        slot.pending_events(batch_size).await
    }

    /// Mark delivered records published.
    ///
    /// # Errors
    ///
    /// Pool or backend failures.
    pub async fn mark_published(&self, ids: &[EventId], at_ms: u128) -> Result<usize, GatewayError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut slot = self.pool.acquire_default().await?;
        slot.mark_published(ids, at_ms).await
    }

    /// Remove records published longer ago than the retention window.
    /// Failures are logged and reported as zero purged.
    pub async fn purge_expired(&self) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(duration_ms(self.retention));
        let result = match self.pool.acquire_default().await {
            Ok(mut slot) => slot.purge_published(cutoff).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(purged) => {
                if purged > 0 {
                    tracing::debug!(purged, "purged published outbox records");
                }
                purged
            }
            Err(e) => {
                tracing::warn!(error = %e, "outbox purge failed");
                0
            }
        }
    }
}

/// Outcome of one publisher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records drained.
    pub drained: usize,
    /// Records delivered to every subscriber and marked published.
    pub published: usize,
    /// Records left pending after a subscriber failure.
    pub failed: usize,
}

/// Polls the outbox and fans records out to subscribers.
pub struct OutboxPublisher<M: ResourceManager> {
    recorder: OutboxRecorder<M>,
    subscribers: Vec<Arc<dyn OutboxSubscriber>>,
    batch_size: usize,
    poll_interval: Duration,
    clock: SharedClock,
}

impl<M> OutboxPublisher<M>
where
    M: ResourceManager,
    M::Resource: OutboxConnection,
{
    /// Create a publisher with no subscribers.
    pub fn new(
        recorder: OutboxRecorder<M>,
        batch_size: usize,
        poll_interval: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            recorder,
            subscribers: Vec::new(),
            batch_size,
            poll_interval,
            clock,
        }
    }

    /// Add a subscriber.
    #[must_use]
    pub fn subscribe(mut self, subscriber: Arc<dyn OutboxSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Deliver one batch of pending records.
    ///
    /// # Errors
    ///
    /// Failures reading or updating the outbox. Subscriber failures are
    /// counted in the report instead.
    pub async fn publish_once(&self) -> Result<PublishReport, GatewayError> {
        let batch = self.recorder.drain(self.batch_size).await?;
        let mut report = PublishReport {
            drained: batch.len(),
            ..PublishReport::default()
        };
        let mut delivered = Vec::with_capacity(batch.len());
        for record in batch {
            let event = PublishedEvent {
                event_id: record.event_id,
                topic: record.topic,
                payload: record.payload,
                invalidates: record.invalidates,
                published_at_ms: self.clock.now_ms(),
            };
            let mut ok = true;
            for subscriber in &self.subscribers {
                if let Err(e) = subscriber.deliver(&event).await {
                    tracing::warn!(
                        event_id = %event.event_id,
                        subscriber = subscriber.name(),
                        error = %e,
                        "outbox delivery failed, will retry"
                    );
                    ok = false;
                }
            }
            if ok {
                delivered.push(event.event_id);
            } else {
                report.failed += 1;
            }
        }
        report.published = self
            .recorder
            .mark_published(&delivered, self.clock.now_ms())
            .await?;
        if report.drained > 0 {
            tracing::debug!(?report, "outbox pass complete");
        }
        Ok(report)
    }

    /// Publish until `shutdown` flips to `true`, sleeping between passes.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(subscribers = self.subscribers.len(), "outbox publisher started");
        while !*shutdown.borrow() {
            match self.publish_once().await {
                // A full batch likely means more is waiting.
                Ok(report) if report.drained >= self.batch_size => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "outbox pass failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("outbox publisher stopped");
    }
}

/// Wraps a subscriber and drops events it has already handled.
pub struct DedupSubscriber<S> {
    inner: S,
    seen: Mutex<SeenEvents>,
}

struct SeenEvents {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl<S: OutboxSubscriber> DedupSubscriber<S> {
    /// Remember up to `capacity` recent event ids.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            seen: Mutex::new(SeenEvents {
                ids: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            }),
        }
    }

    /// The wrapped subscriber.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: OutboxSubscriber> OutboxSubscriber for DedupSubscriber<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn deliver(&self, event: &PublishedEvent) -> Result<(), GatewayError> {
        if self.seen.lock().ids.contains(&event.event_id) {
            tracing::trace!(event_id = %event.event_id, "duplicate delivery suppressed");
            return Ok(());
        }
        self.inner.deliver(event).await?;
        let mut seen = self.seen.lock();
        if seen.ids.insert(event.event_id) {
            seen.order.push_back(event.event_id);
            if seen.order.len() > seen.capacity {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.ids.remove(&oldest);
                }
            }
        }
        Ok(())
    }
}

/// Applies the `invalidates` targets of each event to a cache.
pub struct CacheInvalidator<V> {
    cache: Cache<V>,
}

impl<V> CacheInvalidator<V> {
    /// Invalidate entries of `cache`.
    pub const fn new(cache: Cache<V>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<V> OutboxSubscriber for CacheInvalidator<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "cache-invalidator"
    }

    async fn deliver(&self, event: &PublishedEvent) -> Result<(), GatewayError> {
        for target in &event.invalidates {
            self.cache.invalidate(target.clone());
        }
        Ok(())
    }
}
