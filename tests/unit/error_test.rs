//! Tests for error types

use std::time::Duration;

use prometheus_gateway::core::{GatewayError, TaskFailure};

#[test]
fn test_pool_exhausted_error() {
    let err = GatewayError::PoolExhausted("no free slot".to_string());
    assert_eq!(format!("{err}"), "pool exhausted: no free slot");
}

#[test]
fn test_rate_limited_error() {
    let err = GatewayError::RateLimited {
        retry_after: Duration::from_secs(1),
    };
    assert_eq!(format!("{err}"), "rate limited, retry after 1s");
}

#[test]
fn test_invalid_cursor_error() {
    let err = GatewayError::InvalidCursor("checksum mismatch".to_string());
    assert_eq!(format!("{err}"), "invalid cursor: checksum mismatch");
}

#[test]
fn test_backend_error() {
    let err = GatewayError::backend("connection failed");
    assert_eq!(format!("{err}"), "backend error: connection failed");
}

#[test]
fn test_task_failure_round_trip() {
    let err: GatewayError = TaskFailure::Transient("timeout".into()).into();
    assert_eq!(format!("{err}"), "task failed (transient): timeout");
    assert_eq!(TaskFailure::from(err), TaskFailure::Transient("timeout".into()));
}

#[test]
fn test_errors_are_cloneable_for_waiters() {
    let err = GatewayError::CacheLoadFailed("db down".into());
    let copies: Vec<_> = (0..3).map(|_| err.clone()).collect();
    assert!(copies.iter().all(|e| *e == err));
}
