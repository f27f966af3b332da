//! Tests for builders

use std::sync::Arc;

use async_trait::async_trait;
use prometheus_gateway::builders::{build_dispatcher, open_task_store, GatewayBuilder};
use prometheus_gateway::config::{DispatcherConfig, GatewayConfig, PoolConfig, TaskStoreConfig};
use prometheus_gateway::core::{GatewayError, TaskFailure, TaskHandler, TaskKind, TaskRecord, TaskState, TaskStore};
use prometheus_gateway::infra::{AnyTaskStore, MemoryStore, MemoryStoreManager};
use prometheus_gateway::util::{system_clock, ManualClock, SharedClock};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Job {
    Ping,
}

impl TaskKind for Job {
    fn kind(&self) -> &'static str {
        "ping"
    }
}

struct NoopHandler;

#[async_trait]
impl TaskHandler<Job> for NoopHandler {
    async fn handle(&self, _task: &TaskRecord<Job>) -> Result<(), TaskFailure> {
        Ok(())
    }
}

#[test]
fn test_gateway_builder_defaults() {
    let parts = GatewayBuilder::new(GatewayConfig::default(), MemoryStoreManager::new(MemoryStore::new()))
        .build()
        .unwrap();
    let status = parts.gateway.status();
    assert_eq!(status.pool.max_size, 10);
    assert_eq!(status.operations, 0);
    assert_eq!(status.cache.entries, 0);
}

#[test]
fn test_gateway_builder_rejects_invalid_config() {
    let config = GatewayConfig {
        pool: PoolConfig {
            max_size: 0,
            ..PoolConfig::default()
        },
        ..GatewayConfig::default()
    };
    let result = GatewayBuilder::new(config, MemoryStoreManager::new(MemoryStore::new())).build();
    match result {
        Err(GatewayError::InvalidConfig(msg)) => assert!(msg.starts_with("pool: "), "{msg}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("invalid config accepted"),
    }
}

#[test]
fn test_gateway_builder_with_clock_and_dispatcher() {
    let clock: SharedClock = Arc::new(ManualClock::new(5_000));
    let dispatcher = build_dispatcher(&DispatcherConfig::default(), NoopHandler, Arc::clone(&clock)).unwrap();
    let parts = GatewayBuilder::new(GatewayConfig::default(), MemoryStoreManager::new(MemoryStore::new()))
        .clock(clock)
        .dispatcher(&dispatcher)
        .build();
    assert!(parts.is_ok());
}

#[test]
fn test_open_in_memory_task_store() {
    let store = open_task_store::<Job>(&DispatcherConfig::default()).unwrap();
    assert!(matches!(store, AnyTaskStore::Memory(_)));
}

#[test]
fn test_open_file_task_store() {
    let dir = std::env::temp_dir().join(format!("gateway-builders-{}", uuid::Uuid::new_v4()));
    let cfg = DispatcherConfig {
        store: TaskStoreConfig::File {
            dir: dir.clone(),
            stream: "jobs".into(),
        },
        ..DispatcherConfig::default()
    };
    let mut store = open_task_store::<Job>(&cfg).unwrap();
    assert!(matches!(store, AnyTaskStore::File(_)));
    store.enqueue("k", "ping", Job::Ping, 1).unwrap();
    assert_eq!(store.by_state(TaskState::Queued).len(), 1);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_build_dispatcher_rejects_invalid_config() {
    let cfg = DispatcherConfig {
        max_attempts: 0,
        ..DispatcherConfig::default()
    };
    let result = build_dispatcher::<Job, _>(&cfg, NoopHandler, system_clock());
    assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));
}
