//! Identifier types shared across components.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a durable task.
pub type TaskId = Uuid;

/// Unique identifier of an outbox record.
pub type EventId = Uuid;

/// Identifier of a pooled slot, unique for the lifetime of a pool.
pub type SlotId = u64;

/// Identity used to bucket admission decisions.
///
/// Buckets are keyed on the whole triple so the same caller can hold
/// independent budgets on different routes or tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdmissionKey {
    /// Route or operation family being admitted.
    pub route: String,
    /// Service tier of the caller (e.g. `free`, `pro`).
    pub tier: String,
    /// Caller identity supplied by the transport layer.
    pub caller: String,
}

impl AdmissionKey {
    /// Build a key from its parts.
    pub fn new(route: impl Into<String>, tier: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            tier: tier.into(),
            caller: caller.into(),
        }
    }
}

impl fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.route, self.tier, self.caller)
    }
}
