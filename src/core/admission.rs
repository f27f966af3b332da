//! Token-bucket admission control.
//!
//! Buckets live in a sharded map keyed by [`AdmissionKey`]; each decision
//! locks only the shard holding its bucket. `admit` never suspends: a
//! `Delayed` verdict is advice, any waiting is up to the caller.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::util::clock::{duration_ms, SharedClock};
use crate::util::serde::AdmissionKey;

/// Tier name of the shared fallback bucket.
pub const DEFAULT_TIER: &str = "default";
/// Caller name of the shared fallback bucket.
pub const SHARED_CALLER: &str = "*";
/// Route wildcard accepted in policy keys.
pub const ANY_ROUTE: &str = "*";

/// Bucket sizing for one route/tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Shortfalls that refill within this window yield `Delayed`
    /// instead of `Rejected`. Zero disables delaying.
    #[serde(default, with = "millis")]
    pub delay_threshold: Duration,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 5.0,
            delay_threshold: Duration::ZERO,
        }
    }
}

/// Token bucket state for one admission key. `0 <= tokens <= capacity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateBucket {
    /// Tokens currently available.
    pub tokens: f64,
    /// Maximum tokens.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Last time tokens were replenished (ms since epoch).
    pub last_refill_at_ms: u128,
}

impl RateBucket {
    fn full(policy: &BucketPolicy, now_ms: u128) -> Self {
        Self {
            tokens: policy.capacity,
            capacity: policy.capacity,
            refill_rate: policy.refill_per_sec,
            last_refill_at_ms: now_ms,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn refill(&mut self, now_ms: u128) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_at_ms);
        if elapsed_ms > 0 {
            let added = elapsed_ms as f64 / 1000.0 * self.refill_rate;
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill_at_ms = now_ms;
        }
    }

    fn shortfall_wait(&self) -> Duration {
        let secs = (1.0 - self.tokens).max(0.0) / self.refill_rate;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Request may proceed; one token was consumed.
    Accepted {
        /// Tokens left in the bucket.
        remaining: f64,
    },
    /// Request denied.
    Rejected {
        /// Time until one token is available.
        retry_after: Duration,
    },
    /// Request denied for now, but a token is close; retry at `until_ms`.
    Delayed {
        /// Suggested retry time (ms since epoch).
        until_ms: u128,
    },
}

impl Admission {
    /// Whether the request was let through.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Per-route/tier policy entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Route name, or `*` for any route.
    pub route: String,
    /// Tier name.
    pub tier: String,
    /// Bucket sizing.
    #[serde(flatten)]
    pub policy: BucketPolicy,
}

/// Token-bucket admission controller.
pub struct AdmissionController {
    default_policy: BucketPolicy,
    policies: HashMap<(String, String), BucketPolicy>,
    buckets: DashMap<AdmissionKey, RateBucket>,
    idle_eviction: Duration,
    clock: SharedClock,
}

impl AdmissionController {
    /// Create a controller. Keys without a matching route/tier policy share
    /// one conservative bucket per route, sized by `default_policy`.
    pub fn new(
        default_policy: BucketPolicy,
        policies: impl IntoIterator<Item = RoutePolicy>,
        idle_eviction: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            default_policy,
            policies: policies
                .into_iter()
                .map(|p| ((p.route, p.tier), p.policy))
                .collect(),
            buckets: DashMap::new(),
            idle_eviction,
            clock,
        }
    }

    /// Decide whether `key` may proceed now.
    pub fn admit(&self, key: &AdmissionKey) -> Admission {
        let (bucket_key, policy) = self.resolve(key);
        let now = self.clock.now_ms();
        let mut bucket = self
            .buckets
            .entry(bucket_key)
            .or_insert_with(|| RateBucket::full(&policy, now));
        bucket.refill(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Admission::Accepted {
                remaining: bucket.tokens,
            };
        }

        let retry_after = bucket.shortfall_wait();
        drop(bucket);
        if !policy.delay_threshold.is_zero() && retry_after <= policy.delay_threshold {
            Admission::Delayed {
                until_ms: now + duration_ms(retry_after),
            }
        } else {
            tracing::debug!(key = %key, retry_after_ms = duration_ms(retry_after), "admission rejected");
            Admission::Rejected { retry_after }
        }
    }

    /// Map a caller key to the bucket it draws from and that bucket's policy.
    fn resolve(&self, key: &AdmissionKey) -> (AdmissionKey, BucketPolicy) {
        let specific = self
            .policies
            .get(&(key.route.clone(), key.tier.clone()))
            .or_else(|| self.policies.get(&(ANY_ROUTE.to_string(), key.tier.clone())));
        match specific {
            Some(policy) => (key.clone(), *policy),
            None => (
                AdmissionKey::new(key.route.clone(), DEFAULT_TIER, SHARED_CALLER),
                self.default_policy,
            ),
        }
    }

    /// Drop buckets untouched for longer than the idle window. A dropped
    /// bucket comes back full on next use.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_ms();
        let window = duration_ms(self.idle_eviction);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_sub(b.last_refill_at_ms) <= window);
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle rate buckets");
        }
        evicted
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Copy of the bucket `key` currently draws from, if it exists.
    pub fn bucket(&self, key: &AdmissionKey) -> Option<RateBucket> {
        let (bucket_key, _) = self.resolve(key);
        self.buckets.get(&bucket_key).map(|b| b.value().clone())
    }
}

/// Serde helper for `Duration` stored as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
