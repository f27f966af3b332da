//! Admission controller tests.
//!
//! This test suite validates:
//! - A full bucket admits exactly `capacity` requests in a burst
//! - Rejections carry the time until the next token
//! - Concurrent callers never overdraw a bucket
//! - Wildcard route policies and the shared default bucket

use std::sync::Arc;
use std::time::Duration;

use prometheus_gateway::core::{Admission, AdmissionController, BucketPolicy, RoutePolicy};
use prometheus_gateway::util::{system_clock, AdmissionKey, ManualClock, SharedClock};

fn policy(capacity: f64, refill_per_sec: f64) -> BucketPolicy {
    BucketPolicy {
        capacity,
        refill_per_sec,
        delay_threshold: Duration::ZERO,
    }
}

fn controller(clock: SharedClock, route: &str, tier: &str, bucket: BucketPolicy) -> AdmissionController {
    AdmissionController::new(
        policy(1.0, 0.1),
        vec![RoutePolicy {
            route: route.into(),
            tier: tier.into(),
            policy: bucket,
        }],
        Duration::from_secs(600),
        clock,
    )
}

#[test]
fn test_burst_then_reject() {
    let clock = Arc::new(ManualClock::new(10_000));
    let admission = controller(clock.clone(), "search", "pro", policy(5.0, 1.0));
    let key = AdmissionKey::new("search", "pro", "alice");

    for _ in 0..5 {
        assert!(admission.admit(&key).is_accepted());
    }
    match admission.admit(&key) {
        Admission::Rejected { retry_after } => {
            assert!(
                retry_after > Duration::from_millis(900) && retry_after <= Duration::from_secs(1),
                "retry_after {retry_after:?}"
            );
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    clock.advance(Duration::from_secs(1));
    assert!(admission.admit(&key).is_accepted());
    assert!(!admission.admit(&key).is_accepted());
}

#[test]
fn test_rejection_consumes_nothing() {
    let clock = Arc::new(ManualClock::new(0));
    let admission = controller(clock.clone(), "search", "pro", policy(1.0, 2.0));
    let key = AdmissionKey::new("search", "pro", "alice");

    assert!(admission.admit(&key).is_accepted());
    for _ in 0..10 {
        assert!(!admission.admit(&key).is_accepted());
    }
    clock.advance(Duration::from_millis(500));
    assert!(admission.admit(&key).is_accepted());
}

#[test]
fn test_wildcard_route_policy() {
    let admission = controller(system_clock(), "*", "enterprise", policy(100.0, 10.0));
    let key = AdmissionKey::new("anything", "enterprise", "acme");

    for _ in 0..100 {
        assert!(admission.admit(&key).is_accepted());
    }
    let bucket = admission.bucket(&key).unwrap();
    assert!((bucket.capacity - 100.0).abs() < f64::EPSILON);
}

#[test]
fn test_unconfigured_callers_share_default_bucket() {
    let admission = controller(system_clock(), "search", "pro", policy(5.0, 1.0));

    // The default policy holds a single token for the whole route.
    assert!(admission
        .admit(&AdmissionKey::new("search", "free", "alice"))
        .is_accepted());
    assert!(!admission
        .admit(&AdmissionKey::new("search", "free", "bob"))
        .is_accepted());
    assert!(admission
        .admit(&AdmissionKey::new("search", "pro", "carol"))
        .is_accepted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_never_overdraws() {
    let clock = Arc::new(ManualClock::new(0));
    let admission = Arc::new(controller(clock, "search", "pro", policy(10.0, 1.0)));
    let key = AdmissionKey::new("search", "pro", "alice");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let admission = Arc::clone(&admission);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            (0..25).filter(|_| admission.admit(&key).is_accepted()).count()
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        accepted += handle.await.unwrap();
    }

    assert_eq!(accepted, 10);
    let bucket = admission.bucket(&key).unwrap();
    assert!(bucket.tokens >= 0.0 && bucket.tokens < 1.0);
}
