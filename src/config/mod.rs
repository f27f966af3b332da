//! Configuration models for the pool, admission, cache, dispatcher and outbox.

pub mod gateway;

pub use gateway::{
    AdmissionConfig, CacheConfig, DispatcherConfig, GatewayConfig, OutboxConfig, PoolConfig, TaskStoreConfig,
};
