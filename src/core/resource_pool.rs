//! Bounded pool of expensive backing resources.
//!
//! Slots are created lazily up to `max_size`, health-checked when taken from
//! the idle set, and evicted after `max_idle`. Waiters are served FIFO by a
//! fair `tokio::sync::Semaphore`; one permit is held per checked-out slot, so
//! the number of concurrently held slots can never exceed `max_size`.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::GatewayError;
use crate::util::clock::{duration_ms, SharedClock};
use crate::util::serde::SlotId;

/// Creates and validates the resources held by a [`ResourcePool`].
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    /// The pooled resource, e.g. a transactional connection.
    type Resource: Send + 'static;

    /// Open a new resource.
    async fn create(&self) -> Result<Self::Resource, GatewayError>;

    /// Verify an idle resource is still usable before handing it out.
    async fn check(&self, resource: &mut Self::Resource) -> Result<(), GatewayError>;

    /// Whether a returned resource must be discarded instead of reused.
    fn is_broken(&self, _resource: &Self::Resource) -> bool {
        false
    }
}

/// Configuration values for pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Resources kept open even when idle.
    pub min_size: usize,
    /// Upper bound on concurrently live resources.
    pub max_size: usize,
    /// Idle resources older than this are evicted.
    pub max_idle: Duration,
    /// Default wait used by [`ResourcePool::acquire_default`].
    pub acquire_timeout: Duration,
    /// Consecutive failed replacements tolerated before `PoolExhausted`.
    pub max_retries: u32,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            max_idle: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
    /// Configured maximum.
    pub max_size: usize,
    /// Resources currently open (idle + in use).
    pub live: usize,
    /// Resources sitting in the idle set.
    pub idle: usize,
    /// Slots currently checked out.
    pub in_use: usize,
    /// Total resources ever created.
    pub created: u64,
    /// Resources dropped after a failed check or a broken release.
    pub discarded: u64,
    /// Resources dropped for exceeding `max_idle`.
    pub evicted: u64,
}

/// Result of [`ResourcePool::healthcheck`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolHealth {
    /// Idle resources that passed their check.
    pub healthy: usize,
    /// Idle resources discarded by this pass.
    pub discarded: usize,
    /// Idle resources skipped because every permit was in use.
    pub skipped: usize,
    /// Statistics after the pass.
    pub stats: PoolStats,
}

struct IdleSlot<R> {
    id: SlotId,
    resource: R,
    idle_since_ms: u128,
}

#[derive(Default)]
struct PoolCounters {
    live: AtomicUsize,
    in_use: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
    evicted: AtomicU64,
}

struct PoolInner<M: ResourceManager> {
    manager: M,
    limits: PoolLimits,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleSlot<M::Resource>>>,
    counters: PoolCounters,
    next_id: AtomicU64,
    clock: SharedClock,
}

/// Pool of resources produced by a [`ResourceManager`]. Cheap to clone.
pub struct ResourcePool<M: ResourceManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    /// Create an empty pool. Resources are opened on demand; call
    /// [`warm_up`](Self::warm_up) to pre-open `min_size` of them.
    pub fn new(manager: M, limits: PoolLimits, clock: SharedClock) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_size));
        Self {
            inner: Arc::new(PoolInner {
                manager,
                limits,
                permits,
                idle: Mutex::new(VecDeque::new()),
                counters: PoolCounters::default(),
                next_id: AtomicU64::new(1),
                clock,
            }),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> &PoolLimits {
        &self.inner.limits
    }

    /// The manager backing this pool.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Acquire a slot using the configured `acquire_timeout`.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub async fn acquire_default(&self) -> Result<Slot<M>, GatewayError> {
        self.acquire(self.inner.limits.acquire_timeout).await
    }

    /// Acquire a slot, waiting at most `timeout` for one to free up.
    ///
    /// A zero timeout never waits. Unhealthy idle resources are discarded and
    /// replaced without the caller noticing.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` if no slot frees up in time, if the pool was closed,
    /// or if `max_retries` replacements in a row fail to open.
    pub async fn acquire(&self, timeout: Duration) -> Result<Slot<M>, GatewayError> {
        let permit = self.wait_for_permit(timeout).await?;
        let (id, resource) = self.checkout(&permit).await?;
        self.inner.counters.in_use.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(slot = id, "slot acquired");
        Ok(Slot {
            id,
            resource: Some(resource),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
            broken: false,
        })
    }

    /// Return a slot to the pool. Equivalent to dropping it.
    pub fn release(&self, slot: Slot<M>) {
        drop(slot);
    }

    async fn wait_for_permit(&self, timeout: Duration) -> Result<OwnedSemaphorePermit, GatewayError> {
        let permits = Arc::clone(&self.inner.permits);
        if timeout.is_zero() {
            return permits
                .try_acquire_owned()
                .map_err(|_| GatewayError::PoolExhausted("no free slot".into()));
        }
        match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(GatewayError::PoolExhausted("pool closed".into())),
            Err(_) => {
                tracing::debug!(timeout_ms = duration_ms(timeout), "acquire timed out");
                Err(GatewayError::PoolExhausted(format!(
                    "no slot within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Find a usable resource for a caller that already holds a permit.
    async fn checkout(
        &self,
        _permit: &OwnedSemaphorePermit,
    ) -> Result<(SlotId, M::Resource), GatewayError> {
        let inner = &self.inner;
        loop {
            let Some(mut idle) = self.pop_idle() else { break };
            match inner.manager.check(&mut idle.resource).await {
                Ok(()) => return Ok((idle.id, idle.resource)),
                Err(e) => {
                    tracing::warn!(slot = idle.id, error = %e, "discarding unhealthy slot");
                    self.forget(idle.resource);
                    inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut failures = 0;
        loop {
            match inner.manager.create().await {
                Ok(resource) => {
                    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                    inner.counters.live.fetch_add(1, Ordering::AcqRel);
                    inner.counters.created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(slot = id, "slot created");
                    return Ok((id, resource));
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(attempt = failures, error = %e, "slot creation failed");
                    if failures >= inner.limits.max_retries.max(1) {
                        return Err(GatewayError::PoolExhausted(format!(
                            "replacement failed {failures} times: {e}"
                        )));
                    }
                }
            }
        }
    }

    /// Pop the most recently returned idle resource, evicting stale ones
    /// while more than `min_size` are live.
    fn pop_idle(&self) -> Option<IdleSlot<M::Resource>> {
        let now = self.inner.clock.now_ms();
        let max_idle = duration_ms(self.inner.limits.max_idle);
        let mut idle = self.inner.idle.lock();
        while let Some(slot) = idle.pop_back() {
            if now.saturating_sub(slot.idle_since_ms) > max_idle
                && self.inner.counters.live.load(Ordering::Acquire) > self.inner.limits.min_size
            {
                tracing::debug!(slot = slot.id, "evicting idle slot on acquire");
                self.inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                self.inner.counters.live.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            return Some(slot);
        }
        None
    }

    fn forget(&self, resource: M::Resource) {
        drop(resource);
        self.inner.counters.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Open resources until `min_size` are live.
    ///
    /// # Errors
    ///
    /// Returns the first creation failure.
    pub async fn warm_up(&self) -> Result<usize, GatewayError> {
        let inner = &self.inner;
        let mut opened = 0;
        while inner.counters.live.load(Ordering::Acquire) < inner.limits.min_size {
            let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
                break;
            };
            let resource = inner.manager.create().await?;
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            inner.counters.live.fetch_add(1, Ordering::AcqRel);
            inner.counters.created.fetch_add(1, Ordering::Relaxed);
            inner.idle.lock().push_back(IdleSlot {
                id,
                resource,
                idle_since_ms: inner.clock.now_ms(),
            });
            drop(permit);
            opened += 1;
        }
        Ok(opened)
    }

    /// Drop idle resources older than `max_idle`, never going below
    /// `min_size` live resources. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let max_idle = duration_ms(inner.limits.max_idle);
        let mut evicted = 0;
        let mut idle = inner.idle.lock();
        // Oldest resources sit at the front.
        while let Some(front) = idle.front() {
            if now.saturating_sub(front.idle_since_ms) <= max_idle
                || inner.counters.live.load(Ordering::Acquire) <= inner.limits.min_size
            {
                break;
            }
            if let Some(slot) = idle.pop_front() {
                tracing::debug!(slot = slot.id, "evicting idle slot");
                inner.counters.live.fetch_sub(1, Ordering::AcqRel);
                inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
        evicted
    }

    /// Check every idle resource that can be borrowed right now, discarding
    /// the unhealthy ones. Checked-out slots are left alone.
    pub async fn healthcheck(&self) -> PoolHealth {
        let inner = &self.inner;
        let pending = inner.idle.lock().len();
        let (mut healthy, mut discarded, mut skipped) = (0, 0, 0);
        for _ in 0..pending {
            let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
                skipped = inner.idle.lock().len();
                break;
            };
            let Some(mut slot) = inner.idle.lock().pop_front() else {
                break;
            };
            match inner.manager.check(&mut slot.resource).await {
                Ok(()) => {
                    healthy += 1;
                    inner.idle.lock().push_back(slot);
                }
                Err(e) => {
                    tracing::warn!(slot = slot.id, error = %e, "healthcheck discarded slot");
                    self.forget(slot.resource);
                    inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    discarded += 1;
                }
            }
            drop(permit);
        }
        PoolHealth {
            healthy,
            discarded,
            skipped,
            stats: self.stats(),
        }
    }

    /// Stop handing out slots. Pending and future acquires fail.
    pub fn close(&self) {
        self.inner.permits.close();
        let drained = self.inner.idle.lock().drain(..).count();
        self.inner.counters.live.fetch_sub(drained, Ordering::AcqRel);
        tracing::info!(drained, "pool closed");
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Snapshot of current statistics.
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            max_size: self.inner.limits.max_size,
            live: c.live.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            in_use: c.in_use.load(Ordering::Acquire),
            created: c.created.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Exclusively owned handle to one pooled resource.
///
/// The resource goes back to the pool exactly once, when the slot is dropped,
/// on every exit path including errors and panics in the holder.
pub struct Slot<M: ResourceManager> {
    id: SlotId,
    resource: Option<M::Resource>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<M>>,
    broken: bool,
}

impl<M: ResourceManager> Slot<M> {
    /// Identifier of the underlying resource.
    pub const fn id(&self) -> SlotId {
        self.id
    }

    /// Discard the resource on release instead of returning it to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ResourceManager> fmt::Debug for Slot<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: ResourceManager> Deref for Slot<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the resource.
        self.resource.as_ref().unwrap_or_else(|| unreachable!("slot already released"))
    }
}

impl<M: ResourceManager> DerefMut for Slot<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().unwrap_or_else(|| unreachable!("slot already released"))
    }
}

impl<M: ResourceManager> Drop for Slot<M> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let pool = &self.pool;
        pool.counters.in_use.fetch_sub(1, Ordering::AcqRel);
        if self.broken || pool.manager.is_broken(&resource) || pool.permits.is_closed() {
            tracing::debug!(slot = self.id, "dropping slot on release");
            drop(resource);
            pool.counters.live.fetch_sub(1, Ordering::AcqRel);
            if !pool.permits.is_closed() {
                pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            pool.idle.lock().push_back(IdleSlot {
                id: self.id,
                resource,
                idle_since_ms: pool.clock.now_ms(),
            });
        }
        // Release the permit only after the resource is back in the idle set.
        drop(self.permit.take());
        tracing::trace!(slot = self.id, "slot released");
    }
}
