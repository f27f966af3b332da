//! Tests for configuration

use std::path::PathBuf;
use std::time::Duration;

use prometheus_gateway::config::{
    AdmissionConfig, CacheConfig, DispatcherConfig, GatewayConfig, OutboxConfig, PoolConfig, TaskStoreConfig,
};
use prometheus_gateway::core::BucketPolicy;

#[test]
fn test_gateway_config_defaults() {
    let cfg = GatewayConfig::default();
    assert_eq!(cfg.pool.max_size, 10);
    assert_eq!(cfg.dispatcher.max_attempts, 5);
    assert_eq!(cfg.dispatcher.store, TaskStoreConfig::InMemory);
    assert_eq!(cfg.outbox.dedup_capacity, 10_000);
    assert_eq!(cfg.maintenance_interval(), Duration::from_secs(30));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_pool_config_validation() {
    let cfg = PoolConfig {
        max_size: 0,
        ..PoolConfig::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = PoolConfig {
        min_size: 4,
        max_size: 2,
        ..PoolConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("min_size (4)"), "{err}");
}

#[test]
fn test_pool_config_limits() {
    let cfg = PoolConfig {
        acquire_timeout_ms: 250,
        ..PoolConfig::default()
    };
    let limits = cfg.limits();
    assert_eq!(limits.acquire_timeout, Duration::from_millis(250));
    assert_eq!(limits.max_size, 10);
}

#[test]
fn test_admission_config_validation() {
    let cfg = AdmissionConfig {
        default_policy: BucketPolicy {
            capacity: 0.5,
            ..BucketPolicy::default()
        },
        ..AdmissionConfig::default()
    };
    assert!(cfg.validate().unwrap_err().contains("capacity"));

    let cfg = AdmissionConfig {
        default_policy: BucketPolicy {
            refill_per_sec: 0.0,
            ..BucketPolicy::default()
        },
        ..AdmissionConfig::default()
    };
    assert!(cfg.validate().unwrap_err().contains("refill_per_sec"));
}

#[test]
fn test_cache_config_validation() {
    let cfg = CacheConfig {
        max_entries: 0,
        ..CacheConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_dispatcher_config_validation() {
    let cfg = DispatcherConfig {
        max_attempts: 0,
        ..DispatcherConfig::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = DispatcherConfig {
        backoff_base_ms: 10_000,
        max_backoff_ms: 1_000,
        ..DispatcherConfig::default()
    };
    assert!(cfg.validate().is_err());

    let settings = DispatcherConfig::default().settings();
    assert_eq!(settings.backoff_base, Duration::from_millis(500));
}

#[test]
fn test_gateway_config_prefixes_section() {
    let cfg = GatewayConfig {
        outbox: OutboxConfig {
            batch_size: 0,
            ..OutboxConfig::default()
        },
        ..GatewayConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.starts_with("outbox: "), "{err}");
}

#[test]
fn test_from_json_str_partial() {
    let json = r#"{
        "pool": { "max_size": 4 },
        "admission": {
            "policies": [
                { "route": "search", "tier": "pro", "capacity": 50.0, "refill_per_sec": 10.0 }
            ]
        },
        "dispatcher": { "store": { "kind": "file", "dir": "/var/lib/gateway", "stream": "tasks" } }
    }"#;
    let cfg = GatewayConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.pool.max_size, 4);
    assert_eq!(cfg.pool.acquire_timeout_ms, 5_000);
    assert_eq!(cfg.admission.policies.len(), 1);
    assert!((cfg.admission.policies[0].policy.capacity - 50.0).abs() < f64::EPSILON);
    assert_eq!(cfg.admission.policies[0].policy.delay_threshold, Duration::ZERO);
    assert_eq!(
        cfg.dispatcher.store,
        TaskStoreConfig::File {
            dir: PathBuf::from("/var/lib/gateway"),
            stream: "tasks".into(),
        }
    );
}

#[test]
fn test_from_json_str_rejects_invalid() {
    assert!(GatewayConfig::from_json_str("{ not json").unwrap_err().starts_with("parse error"));
    let err = GatewayConfig::from_json_str(r#"{ "pool": { "max_size": 0 } }"#).unwrap_err();
    assert!(err.starts_with("pool: "), "{err}");
}
