//! Error types for gateway operations.

use std::time::Duration;

use thiserror::Error;

use crate::util::serde::{EventId, TaskId};

/// Errors produced by gateway components.
///
/// Infrastructure faults are surfaced as-is; only the dispatcher retries, and
/// only up to its attempt cap. The enum is `Clone` so one single-flight
/// failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// No pool slot became available within the acquire timeout, or every
    /// replacement for an unhealthy slot failed.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
    /// Admission denied; the caller may retry after the given delay.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// The cache loader failed; nothing was cached.
    #[error("cache load failed: {0}")]
    CacheLoadFailed(String),
    /// A task body failed.
    #[error("task failed ({}): {reason}", if *permanent { "permanent" } else { "transient" })]
    TaskFailed {
        /// Permanent failures go straight to dead letter.
        permanent: bool,
        /// Failure description.
        reason: String,
    },
    /// A pagination cursor did not decode to the expected sort-key shape.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    /// An outbox record with this event id already exists.
    #[error("duplicate outbox event {0}")]
    DuplicateEvent(EventId),
    /// No operation registered under this key.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    /// No task with this id.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl GatewayError {
    /// Shorthand for a backend error from any displayable source.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
