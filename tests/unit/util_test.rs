//! Tests for utility functions

use std::time::Duration;

use prometheus_gateway::util::{duration_ms, init_tracing, AdmissionKey, Clock, ManualClock, SystemClock};

#[test]
fn test_admission_key_display() {
    let key = AdmissionKey::new("search", "pro", "alice");
    assert_eq!(key.to_string(), "search/pro/alice");
}

#[test]
fn test_admission_key_serde() {
    let key = AdmissionKey::new("search", "free", "bob");
    let json = serde_json::to_value(&key).unwrap();
    assert_eq!(json["route"], "search");
    assert_eq!(json["tier"], "free");
    let back: AdmissionKey = serde_json::from_value(json).unwrap();
    assert_eq!(back, key);
}

#[test]
fn test_manual_clock_is_shared_between_clones() {
    let clock = ManualClock::new(0);
    let other = clock.clone();
    clock.advance(Duration::from_millis(1500));
    assert_eq!(other.now_ms(), 1500);
}

#[test]
fn test_system_clock_moves_forward() {
    let a = SystemClock.now_ms();
    let b = SystemClock.now_ms();
    assert!(b >= a);
    assert!(a > 1_600_000_000_000);
}

#[test]
fn test_duration_ms() {
    assert_eq!(duration_ms(Duration::from_secs(2)), 2000);
    assert_eq!(duration_ms(Duration::from_micros(999)), 0);
}

#[test]
fn test_init_tracing_twice() {
    init_tracing();
    init_tracing();
    tracing::info!("tracing initialized");
}
