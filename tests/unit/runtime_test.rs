//! Tests for runtime components and API models

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus_gateway::builders::GatewayBuilder;
use prometheus_gateway::config::GatewayConfig;
use prometheus_gateway::core::{CachePolicy, Effects, GatewayError, Operation, Spawn};
use prometheus_gateway::infra::{MemoryStore, MemoryStoreManager, Transaction};
use prometheus_gateway::runtime::{
    handle_request, health, list_page, HandleRequest, HandleResponse, PageRequest, TokioSpawner,
};
use prometheus_gateway::util::AdmissionKey;
use serde_json::{json, Value};

struct Echo;

#[async_trait]
impl Operation<Transaction> for Echo {
    fn cache_policy(&self, _params: &Value) -> CachePolicy {
        CachePolicy::Cache {
            ttl: None,
            tags: vec![],
        }
    }

    async fn execute(&self, _tx: &mut Transaction, params: &Value, _effects: &mut Effects) -> Result<Value, GatewayError> {
        Ok(json!({ "echo": params }))
    }
}

#[test]
fn test_handle_response_from_result() {
    assert_eq!(
        HandleResponse::from(Ok(json!(1))),
        HandleResponse::Ok { value: json!(1) }
    );
    assert_eq!(
        HandleResponse::from(Err(GatewayError::RateLimited {
            retry_after: Duration::from_millis(1500)
        })),
        HandleResponse::RateLimited { retry_after_ms: 1500 }
    );
    assert_eq!(
        HandleResponse::from(Err(GatewayError::UnknownOperation("nope".into()))),
        HandleResponse::Error {
            message: "unknown operation: nope".into()
        }
    );
}

#[test]
fn test_handle_response_wire_format() {
    let json = serde_json::to_value(HandleResponse::RateLimited { retry_after_ms: 10 }).unwrap();
    assert_eq!(json, json!({ "status": "rate_limited", "retry_after_ms": 10 }));

    let req: HandleRequest = serde_json::from_value(json!({
        "operation": "echo",
        "admission_key": { "route": "r", "tier": "t", "caller": "c" }
    }))
    .unwrap();
    assert_eq!(req.params, Value::Null);
}

#[tokio::test]
async fn test_handle_request_round_trip() {
    let parts = GatewayBuilder::new(GatewayConfig::default(), MemoryStoreManager::new(MemoryStore::new()))
        .build()
        .unwrap();
    parts.gateway.register("echo", Echo);

    let req = HandleRequest {
        operation: "echo".into(),
        admission_key: AdmissionKey::new("echo", "free", "alice"),
        params: json!({ "n": 1 }),
    };
    let resp = handle_request(&parts.gateway, req).await;
    assert_eq!(
        resp,
        HandleResponse::Ok {
            value: json!({ "echo": { "n": 1 } })
        }
    );
}

#[tokio::test]
async fn test_list_page_and_health() {
    let store = MemoryStore::new();
    let parts = GatewayBuilder::new(GatewayConfig::default(), MemoryStoreManager::new(Arc::clone(&store)))
        .build()
        .unwrap();

    let page = list_page(
        &parts.gateway,
        &PageRequest {
            table: "users".into(),
            cursor: None,
            page_size: 10,
        },
    )
    .await
    .unwrap();
    assert!(page.items.is_empty());
    assert!(page.next_cursor.is_none());

    let report = health(&parts.gateway).await;
    assert!(report.ok);
    assert_eq!(report.pool.discarded, 0);

    parts.gateway.pool().close();
    assert!(!health(&parts.gateway).await.ok);
}

#[tokio::test]
async fn test_tokio_spawner_runs_future() {
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let c = Arc::clone(&counter);
    TokioSpawner::current().spawn(async move {
        c.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(());
    });
    rx.await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
