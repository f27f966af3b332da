//! API-facing request/response models.
//!
//! The transport layer owns routing and authentication; these types are what
//! it exchanges with the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::cursor::KeysetSource;
use crate::core::gateway::{Gateway, GatewayStatus, TransactionalConnection};
use crate::core::outbox::OutboxConnection;
use crate::core::resource_pool::{PoolHealth, ResourceManager};
use crate::core::GatewayError;
use crate::util::serde::AdmissionKey;

/// One inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleRequest {
    /// Registered operation key.
    pub operation: String,
    /// Identity used for admission.
    pub admission_key: AdmissionKey,
    /// Operation parameters.
    #[serde(default)]
    pub params: Value,
}

/// Outcome of an inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandleResponse {
    /// Operation result.
    Ok {
        /// Result value.
        value: Value,
    },
    /// Admission denied.
    RateLimited {
        /// Suggested wait (ms).
        retry_after_ms: u64,
    },
    /// Any other failure.
    Error {
        /// Error description.
        message: String,
    },
}

impl From<Result<Value, GatewayError>> for HandleResponse {
    fn from(result: Result<Value, GatewayError>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(GatewayError::RateLimited { retry_after }) => Self::RateLimited {
                retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            },
            Err(e) => Self::Error {
                message: e.to_string(),
            },
        }
    }
}

/// A listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Table to list.
    pub table: String,
    /// Cursor from the previous page.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Requested page size.
    pub page_size: usize,
}

/// A listing response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    /// Items in order.
    pub items: Vec<Value>,
    /// Cursor for the next page.
    pub next_cursor: Option<String>,
}

/// Health response.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Result of the pool health check.
    pub pool: PoolHealth,
    /// Gateway statistics.
    pub status: GatewayStatus,
}

/// Run a [`HandleRequest`] and map the result to a [`HandleResponse`].
pub async fn handle_request<M>(gateway: &Gateway<M>, req: HandleRequest) -> HandleResponse
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    gateway
        .handle(&req.operation, &req.admission_key, req.params)
        .await
        .into()
}

/// Serve a [`PageRequest`].
///
/// # Errors
///
/// `InvalidCursor` when the caller must restart pagination; pool and backend
/// failures.
pub async fn list_page<M>(gateway: &Gateway<M>, req: &PageRequest) -> Result<PageResponse, GatewayError>
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection + KeysetSource,
{
    let page = gateway
        .list(&req.table, req.cursor.as_deref(), req.page_size)
        .await?;
    Ok(PageResponse {
        items: page.items,
        next_cursor: page.next_cursor,
    })
}

/// Check idle pool slots and report gateway statistics. Unhealthy when the
/// pool is closed or any idle slot failed its check.
pub async fn health<M>(gateway: &Gateway<M>) -> Health
where
    M: ResourceManager,
    M::Resource: TransactionalConnection + OutboxConnection,
{
    let pool = gateway.pool().healthcheck().await;
    Health {
        ok: !gateway.pool().is_closed() && pool.discarded == 0,
        pool,
        status: gateway.status(),
    }
}
