//! Builders that assemble components from configuration.

pub mod gateway_builder;

pub use gateway_builder::{build_dispatcher, open_task_store, GatewayBuilder, GatewayParts};
