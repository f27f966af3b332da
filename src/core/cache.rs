//! Read-through cache with single-flight loads.
//!
//! At most one load per fingerprint is in flight; concurrent callers await
//! the same shared result. The load runs on its own task, so callers that
//! time out or go away do not cancel it for the others.
//!
//! Every state change is expressed as a [`CacheEvent`] and applied by one
//! routine, [`Cache::reconcile`], so invalidation never calls back into
//! loading. Entries are kept in LRU order in an `IndexMap` (front = coldest).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{Fingerprint, GatewayError};
use crate::util::clock::{duration_ms, SharedClock};

/// Cache sizing and expiry.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// TTL applied when a load does not specify one.
    pub default_ttl: Duration,
    /// How long past expiry an entry may still be served while it refreshes.
    pub stale_while_revalidate: Duration,
    /// Entry count above which the least recently used entries are evicted.
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            stale_while_revalidate: Duration::ZERO,
            max_entries: 10_000,
        }
    }
}

/// A cached value. `expires_at_ms >= created_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    /// Key of the entry.
    pub fingerprint: Fingerprint,
    /// Cached value.
    pub value: V,
    /// Insertion time.
    pub created_at_ms: u128,
    /// Expiry time.
    pub expires_at_ms: u128,
    /// Monotonic version assigned at insertion.
    pub version: u64,
    /// Tags the entry can be invalidated by.
    pub tags: Vec<String>,
}

/// What an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "key")]
pub enum InvalidationTarget {
    /// A single entry.
    Fingerprint(Fingerprint),
    /// Every entry carrying the tag.
    Tag(String),
}

/// Per-load options.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Overrides the default TTL.
    pub ttl: Option<Duration>,
    /// Tags attached to the loaded entry.
    pub tags: Vec<String>,
}

/// State transitions of the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent<V> {
    /// The entry passed its stale window and is dropped.
    Expired {
        /// Affected entry.
        fingerprint: Fingerprint,
    },
    /// Entries matching the target are dropped and in-flight loads for them
    /// will not be stored.
    Invalidated {
        /// What to invalidate.
        target: InvalidationTarget,
    },
    /// A load finished and its value is stored.
    Refreshed {
        /// Loaded entry key.
        fingerprint: Fingerprint,
        /// Loaded value.
        value: V,
        /// Entry lifetime.
        ttl: Duration,
        /// Entry tags.
        tags: Vec<String>,
    },
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Fresh hits.
    pub hits: u64,
    /// Expired entries served while refreshing.
    pub stale_hits: u64,
    /// Lookups that had to wait on a load.
    pub misses: u64,
    /// Loader executions started.
    pub loads: u64,
    /// Entries removed for capacity.
    pub evictions: u64,
    /// Entries removed by invalidation.
    pub invalidations: u64,
    /// Entries currently stored.
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V, GatewayError>>>;

struct Inflight<V> {
    id: u64,
    load: SharedLoad<V>,
    tags: Vec<String>,
    invalidated: bool,
}

struct CacheState<V> {
    entries: IndexMap<Fingerprint, CacheEntry<V>>,
    tags: HashMap<String, HashSet<Fingerprint>>,
    inflight: HashMap<Fingerprint, Inflight<V>>,
    next_version: u64,
    next_load: u64,
}

enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Miss,
}

struct CacheInner<V> {
    settings: CacheSettings,
    state: Mutex<CacheState<V>>,
    counters: Counters,
    clock: SharedClock,
}

/// Single-flight read-through cache. Cheap to clone.
pub struct Cache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    pub fn new(settings: CacheSettings, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                settings,
                state: Mutex::new(CacheState {
                    entries: IndexMap::new(),
                    tags: HashMap::new(),
                    inflight: HashMap::new(),
                    next_version: 1,
                    next_load: 1,
                }),
                counters: Counters::default(),
                clock,
            }),
        }
    }

    /// Return the cached value for `fingerprint`, running `loader` on a miss.
    ///
    /// # Errors
    ///
    /// The loader's error, shared with every concurrent waiter. Backend
    /// errors are reported as `CacheLoadFailed`; nothing is cached.
    pub async fn get_or_load<F, Fut>(&self, fingerprint: &Fingerprint, loader: F) -> Result<V, GatewayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        self.get_or_load_with(fingerprint, LoadOptions::default(), loader)
            .await
    }

    /// [`get_or_load`](Self::get_or_load) with an explicit TTL and tags.
    ///
    /// # Errors
    ///
    /// See [`get_or_load`](Self::get_or_load).
    pub async fn get_or_load_with<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        options: LoadOptions,
        loader: F,
    ) -> Result<V, GatewayError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        let now = self.inner.clock.now_ms();
        let load = {
            let mut state = self.inner.state.lock();
            match self.lookup(&mut state, fingerprint, now) {
                Lookup::Fresh(value) => {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Lookup::Stale(value) => {
                    self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                    if !state.inflight.contains_key(fingerprint) {
                        tracing::debug!(%fingerprint, "serving stale entry, refreshing");
                        // Refresh runs on its own; the stale value goes back now.
                        drop(self.start_load(&mut state, fingerprint, options, loader));
                    }
                    return Ok(value);
                }
                Lookup::Miss => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.start_load(&mut state, fingerprint, options, loader)
                }
            }
        };
        load.await
    }

    /// Cached value if present and fresh. Never loads.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<V> {
        let now = self.inner.clock.now_ms();
        let state = self.inner.state.lock();
        state
            .entries
            .get(fingerprint)
            .filter(|e| now < e.expires_at_ms)
            .map(|e| e.value.clone())
    }

    /// Full entry for `fingerprint`, fresh or not.
    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
        self.inner.state.lock().entries.get(fingerprint).cloned()
    }

    /// Drop entries matching `target`; returns how many were removed.
    pub fn invalidate(&self, target: InvalidationTarget) -> usize {
        self.reconcile(CacheEvent::Invalidated { target })
    }

    /// Apply one state transition. Returns the number of entries affected.
    pub fn reconcile(&self, event: CacheEvent<V>) -> usize {
        let mut state = self.inner.state.lock();
        self.apply(&mut state, event)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn lookup(&self, state: &mut CacheState<V>, fingerprint: &Fingerprint, now: u128) -> Lookup<V> {
        let Some(idx) = state.entries.get_index_of(fingerprint) else {
            return Lookup::Miss;
        };
        let (expires_at, value) = {
            let entry = &state.entries[idx];
            (entry.expires_at_ms, entry.value.clone())
        };
        if now < expires_at {
            let last = state.entries.len() - 1;
            state.entries.move_index(idx, last);
            return Lookup::Fresh(value);
        }
        let stale_window = duration_ms(self.inner.settings.stale_while_revalidate);
        if now < expires_at.saturating_add(stale_window) {
            let last = state.entries.len() - 1;
            state.entries.move_index(idx, last);
            return Lookup::Stale(value);
        }
        self.apply(
            state,
            CacheEvent::Expired {
                fingerprint: fingerprint.clone(),
            },
        );
        Lookup::Miss
    }

    /// Join the in-flight load for `fingerprint` or start a new one.
    fn start_load<F, Fut>(
        &self,
        state: &mut CacheState<V>,
        fingerprint: &Fingerprint,
        options: LoadOptions,
        loader: F,
    ) -> SharedLoad<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, GatewayError>> + Send + 'static,
    {
        if let Some(inflight) = state.inflight.get(fingerprint) {
            return inflight.load.clone();
        }

        self.inner.counters.loads.fetch_add(1, Ordering::Relaxed);
        let ttl = options.ttl.unwrap_or(self.inner.settings.default_ttl);
        let id = state.next_load;
        state.next_load += 1;
        let cache = self.clone();
        let key = fingerprint.clone();
        let handle = tokio::spawn(async move {
            // Clears the in-flight marker if the loader panics or the task is cancelled.
            let mut guard = LoadGuard {
                inner: Arc::clone(&cache.inner),
                fingerprint: key.clone(),
                id,
                armed: true,
            };
            let result = loader().await.map_err(|e| match e {
                GatewayError::Backend(msg) => GatewayError::CacheLoadFailed(msg),
                other => other,
            });
            guard.armed = false;
            cache.finish_load(&key, id, &result, ttl);
            result
        });
        let load = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(GatewayError::CacheLoadFailed(format!("loader aborted: {e}"))))
        }
        .boxed()
        .shared();

        state.inflight.insert(
            fingerprint.clone(),
            Inflight {
                id,
                load: load.clone(),
                tags: options.tags,
                invalidated: false,
            },
        );
        load
    }

    fn finish_load(&self, fingerprint: &Fingerprint, id: u64, result: &Result<V, GatewayError>, ttl: Duration) {
        let mut state = self.inner.state.lock();
        if state.inflight.get(fingerprint).map(|i| i.id) != Some(id) {
            return;
        }
        let Some(inflight) = state.inflight.remove(fingerprint) else {
            return;
        };
        match result {
            Ok(value) if !inflight.invalidated => {
                self.apply(
                    &mut state,
                    CacheEvent::Refreshed {
                        fingerprint: fingerprint.clone(),
                        value: value.clone(),
                        ttl,
                        tags: inflight.tags,
                    },
                );
            }
            Ok(_) => tracing::debug!(%fingerprint, "load invalidated in flight, not stored"),
            Err(e) => tracing::debug!(%fingerprint, error = %e, "load failed, not stored"),
        }
    }

    fn apply(&self, state: &mut CacheState<V>, event: CacheEvent<V>) -> usize {
        match event {
            CacheEvent::Expired { fingerprint } => {
                usize::from(Self::remove_entry(state, &fingerprint))
            }
            CacheEvent::Invalidated { target } => {
                let keys: Vec<Fingerprint> = match &target {
                    InvalidationTarget::Fingerprint(fp) => vec![fp.clone()],
                    InvalidationTarget::Tag(tag) => state
                        .tags
                        .get(tag)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default(),
                };
                for (fp, inflight) in &mut state.inflight {
                    let hit = match &target {
                        InvalidationTarget::Fingerprint(t) => fp == t,
                        InvalidationTarget::Tag(tag) => inflight.tags.contains(tag),
                    };
                    inflight.invalidated |= hit;
                }
                let removed = keys
                    .iter()
                    .filter(|fp| Self::remove_entry(state, fp))
                    .count();
                self.inner
                    .counters
                    .invalidations
                    .fetch_add(removed as u64, Ordering::Relaxed);
                tracing::debug!(?target, removed, "cache invalidated");
                removed
            }
            CacheEvent::Refreshed {
                fingerprint,
                value,
                ttl,
                tags,
            } => {
                let now = self.inner.clock.now_ms();
                Self::remove_entry(state, &fingerprint);
                let version = state.next_version;
                state.next_version += 1;
                for tag in &tags {
                    state
                        .tags
                        .entry(tag.clone())
                        .or_default()
                        .insert(fingerprint.clone());
                }
                state.entries.insert(
                    fingerprint.clone(),
                    CacheEntry {
                        fingerprint,
                        value,
                        created_at_ms: now,
                        expires_at_ms: now.saturating_add(duration_ms(ttl)),
                        version,
                        tags,
                    },
                );
                self.evict_overflow(state);
                1
            }
        }
    }

    fn evict_overflow(&self, state: &mut CacheState<V>) {
        let max = self.inner.settings.max_entries.max(1);
        while state.entries.len() > max {
            let Some(fp) = state.entries.get_index(0).map(|(k, _)| k.clone()) else {
                break;
            };
            Self::remove_entry(state, &fp);
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%fp, "evicted least recently used entry");
        }
    }

    fn remove_entry(state: &mut CacheState<V>, fingerprint: &Fingerprint) -> bool {
        let Some(entry) = state.entries.shift_remove(fingerprint) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(set) = state.tags.get_mut(tag) {
                set.remove(fingerprint);
                if set.is_empty() {
                    state.tags.remove(tag);
                }
            }
        }
        true
    }
}

struct LoadGuard<V> {
    inner: Arc<CacheInner<V>>,
    fingerprint: Fingerprint,
    id: u64,
    armed: bool,
}

impl<V> Drop for LoadGuard<V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.inflight.get(&self.fingerprint).map(|i| i.id) == Some(self.id) {
            state.inflight.remove(&self.fingerprint);
            tracing::warn!(fingerprint = %self.fingerprint, "load aborted, not stored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;
    use serde_json::json;

    fn cache(clock: &ManualClock, settings: CacheSettings) -> Cache<u32> {
        Cache::new(settings, Arc::new(clock.clone()))
    }

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::compute("test", &json!({ "name": name }))
    }

    #[tokio::test]
    async fn lru_eviction_drops_coldest() {
        let clock = ManualClock::default();
        let c = cache(
            &clock,
            CacheSettings {
                max_entries: 2,
                ..CacheSettings::default()
            },
        );
        for (name, v) in [("a", 1), ("b", 2)] {
            c.get_or_load(&fp(name), move || async move { Ok(v) }).await.unwrap();
        }
        // Touch `a` so `b` becomes the coldest.
        assert_eq!(c.peek(&fp("a")), Some(1));
        c.get_or_load(&fp("a"), || async { Ok(99) }).await.unwrap();
        c.get_or_load(&fp("c"), || async { Ok(3) }).await.unwrap();
        assert_eq!(c.len(), 2);
        assert!(c.entry(&fp("b")).is_none());
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test]
    async fn expired_entry_reloads() {
        let clock = ManualClock::default();
        let c = cache(&clock, CacheSettings::default());
        let key = fp("x");
        c.get_or_load_with(
            &key,
            LoadOptions {
                ttl: Some(Duration::from_secs(1)),
                tags: vec![],
            },
            || async { Ok(1) },
        )
        .await
        .unwrap();
        let entry = c.entry(&key).unwrap();
        assert!(entry.expires_at_ms >= entry.created_at_ms);

        clock.advance(Duration::from_secs(2));
        let v = c.get_or_load(&key, || async { Ok(2) }).await.unwrap();
        assert_eq!(v, 2);
        assert!(c.entry(&key).unwrap().version > entry.version);
    }

    #[tokio::test]
    async fn tag_invalidation_removes_all_tagged() {
        let clock = ManualClock::default();
        let c = cache(&clock, CacheSettings::default());
        for name in ["u1", "u2"] {
            c.get_or_load_with(
                &fp(name),
                LoadOptions {
                    ttl: None,
                    tags: vec!["users".into()],
                },
                || async { Ok(5) },
            )
            .await
            .unwrap();
        }
        c.get_or_load(&fp("other"), || async { Ok(6) }).await.unwrap();
        assert_eq!(c.invalidate(InvalidationTarget::Tag("users".into())), 2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.invalidate(InvalidationTarget::Tag("users".into())), 0);
    }
}
