//! # Prometheus Gateway
//!
//! The serving core that sits between a transport layer and an expensive
//! backing store.
//!
//! Every request passes a token-bucket admission gate, borrows one slot from a
//! bounded resource pool, and is answered from a single-flight cache when the
//! operation allows it. Mutations commit together with their outbox records;
//! a publisher delivers those records at-least-once to subscribers such as the
//! cache invalidator and the durable task dispatcher.
//!
//! ## Components
//!
//! - **Resource pool**: lazily created slots up to `max_size`, FIFO waiters,
//!   health-checked reuse, idle eviction.
//! - **Admission controller**: per `(route, tier, caller)` token buckets that
//!   never block.
//! - **Cache**: single-flight loads, TTL, stale-while-revalidate, LRU
//!   eviction, invalidation by fingerprint or tag.
//! - **Outbox**: records staged in the caller's unit of work, published and
//!   purged in the background.
//! - **Task dispatcher**: idempotent enqueue, exponential backoff with
//!   jitter, dead letter, reclaim of silent attempts.
//! - **Cursor codec**: opaque, tamper-evident keyset cursors.
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_gateway::builders::GatewayBuilder;
//! use prometheus_gateway::config::GatewayConfig;
//! use prometheus_gateway::infra::{MemoryStore, MemoryStoreManager};
//! use prometheus_gateway::runtime::TokioSpawner;
//! use prometheus_gateway::util::serde::AdmissionKey;
//!
//! let store = MemoryStore::new();
//! let parts = GatewayBuilder::new(GatewayConfig::from_env()?, MemoryStoreManager::new(store))
//!     .build()?;
//! parts.gateway.register("get_user", GetUser);
//! parts.gateway.start_background(&TokioSpawner::new(tokio::runtime::Handle::current()));
//!
//! let user = parts
//!     .gateway
//!     .handle("get_user", &AdmissionKey::new("users", "pro", "alice"), json!({"id": "7"}))
//!     .await?;
//! ```
//!
//! For complete examples, see:
//! - `tests/gateway_test.rs` - end-to-end request flow
//! - `tests/outbox_test.rs` - crash and redelivery behaviour

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Serving-core components and their composition.
pub mod core;
/// Configuration models for the pool, admission, cache, dispatcher and outbox.
pub mod config;
/// Builders that assemble components from configuration.
pub mod builders;
/// Infrastructure adapters for the backing store and task storage.
pub mod infra;
/// Runtime spawner and API surface models.
pub mod runtime;
/// Shared utilities.
pub mod util;
