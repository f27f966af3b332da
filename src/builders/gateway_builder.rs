//! Builders to construct a gateway and its dispatcher from configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{DispatcherConfig, GatewayConfig, TaskStoreConfig};
use crate::core::admission::AdmissionController;
use crate::core::background::BackgroundLoop;
use crate::core::cache::Cache;
use crate::core::dispatcher::{Dispatcher, TaskHandler, TaskKind, TaskStore};
use crate::core::gateway::{Gateway, TransactionalConnection};
use crate::core::outbox::{
    CacheInvalidator, DedupSubscriber, OutboxConnection, OutboxPublisher, OutboxRecorder, OutboxSubscriber,
};
use crate::core::resource_pool::{ResourceManager, ResourcePool};
use crate::core::GatewayError;
use crate::infra::task_store::{AnyTaskStore, InMemoryTaskStore, JsonlTaskStore};
use crate::util::clock::{system_clock, SharedClock};

/// A built gateway and the publisher feeding its subscribers.
pub struct GatewayParts<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    /// Request entry point.
    pub gateway: Gateway<M>,
    /// Outbox publisher; already registered as a background loop.
    pub publisher: Arc<OutboxPublisher<M>>,
}

/// Assembles a [`Gateway`] from a [`GatewayConfig`].
pub struct GatewayBuilder<M> {
    config: GatewayConfig,
    manager: M,
    clock: SharedClock,
    subscribers: Vec<Arc<dyn OutboxSubscriber>>,
    loops: Vec<Arc<dyn BackgroundLoop>>,
}

impl<M> GatewayBuilder<M>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    /// Start from `config`, pooling resources from `manager`.
    pub fn new(config: GatewayConfig, manager: M) -> Self {
        Self {
            config,
            manager,
            clock: system_clock(),
            subscribers: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver published events to `subscriber` as well.
    #[must_use]
    pub fn subscriber(mut self, subscriber: Arc<dyn OutboxSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Feed follow-up tasks to `dispatcher` and run its poll loop in the
    /// background.
    #[must_use]
    pub fn dispatcher<P, S, H>(mut self, dispatcher: &Dispatcher<P, S, H>) -> Self
    where
        P: TaskKind,
        S: TaskStore<P>,
        H: TaskHandler<P>,
    {
        self.subscribers.push(Arc::new(dispatcher.clone()));
        self.loops.push(Arc::new(dispatcher.clone()));
        self
    }

    /// Validate the configuration and wire the components.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first bad field.
    pub fn build(self) -> Result<GatewayParts<M>, GatewayError> {
        let cfg = &self.config;
        cfg.validate().map_err(GatewayError::InvalidConfig)?;

        let pool = ResourcePool::new(self.manager, cfg.pool.limits(), Arc::clone(&self.clock));
        let admission = AdmissionController::new(
            cfg.admission.default_policy,
            cfg.admission.policies.clone(),
            cfg.admission.idle_eviction(),
            Arc::clone(&self.clock),
        );
        let cache = Cache::new(cfg.cache.settings(), Arc::clone(&self.clock));
        let recorder = OutboxRecorder::new(
            pool.clone(),
            Duration::from_millis(cfg.outbox.retention_ms),
            Arc::clone(&self.clock),
        );

        let mut publisher = OutboxPublisher::new(
            recorder.clone(),
            cfg.outbox.batch_size,
            Duration::from_millis(cfg.outbox.poll_interval_ms),
            Arc::clone(&self.clock),
        )
        .subscribe(Arc::new(DedupSubscriber::new(
            CacheInvalidator::new(cache.clone()),
            cfg.outbox.dedup_capacity,
        )));
        for subscriber in self.subscribers {
            publisher = publisher.subscribe(subscriber);
        }
        let publisher = Arc::new(publisher);

        let gateway = Gateway::new(
            admission,
            pool,
            cache,
            recorder,
            cfg.maintenance_interval(),
            Arc::clone(&self.clock),
        );
        gateway.add_background_loop(Arc::clone(&publisher) as Arc<dyn BackgroundLoop>);
        for background in self.loops {
            gateway.add_background_loop(background);
        }
        tracing::info!(
            pool_max = cfg.pool.max_size,
            cache_max = cfg.cache.max_entries,
            "gateway built"
        );
        Ok(GatewayParts { gateway, publisher })
    }
}

/// Open the task store selected by `cfg.store`.
///
/// # Errors
///
/// `Backend` if a file store cannot be opened.
pub fn open_task_store<P>(cfg: &DispatcherConfig) -> Result<AnyTaskStore<P>, GatewayError>
where
    P: Serialize + DeserializeOwned,
{
    Ok(match &cfg.store {
        TaskStoreConfig::InMemory => AnyTaskStore::Memory(InMemoryTaskStore::new()),
        TaskStoreConfig::File { dir, stream } => AnyTaskStore::File(JsonlTaskStore::open(dir, stream.clone())?),
    })
}

/// Build a dispatcher from configuration.
///
/// # Errors
///
/// `InvalidConfig` for bad values; `Backend` if the store cannot be opened.
pub fn build_dispatcher<P, H>(
    cfg: &DispatcherConfig,
    handler: H,
    clock: SharedClock,
) -> Result<Dispatcher<P, AnyTaskStore<P>, H>, GatewayError>
where
    P: TaskKind,
    H: TaskHandler<P>,
{
    cfg.validate().map_err(GatewayError::InvalidConfig)?;
    let store = open_task_store(cfg)?;
    Ok(Dispatcher::new(store, handler, cfg.settings(), clock))
}
