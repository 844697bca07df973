use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use super::{AppState, build_router};
use crate::{
    config::Config,
    reconcile::{
        gateway::{GatewayError, PaymentGateway},
        identity,
        service::ReconcileService,
        store,
        types::{PaymentRecord, PaymentStatus},
    },
};

struct StubGateway {
    records: HashMap<String, PaymentRecord>,
    errors: HashMap<String, GatewayError>,
}

#[async_trait::async_trait]
impl PaymentGateway for StubGateway {
    async fn fetch_payment(&self, resource_id: &str) -> Result<PaymentRecord, GatewayError> {
        if let Some(error) = self.errors.get(resource_id) {
            return Err(error.clone());
        }
        self.records
            .get(resource_id)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }
}

fn loopback_bind_addr() -> std::net::SocketAddr {
    std::net::SocketAddr::from(([127, 0, 0, 1], 0))
}

fn test_config() -> Config {
    Config {
        service_name: "billing-test".to_string(),
        bind_addr: loopback_bind_addr(),
        build_sha: "test".to_string(),
        db_url: None,
        gateway_base_url: "http://gateway.test".to_string(),
        gateway_access_token: Some("test-token".to_string()),
        gateway_timeout_ms: 2_000,
    }
}

async fn test_router(
    records: Vec<PaymentRecord>,
    errors: Vec<(&str, GatewayError)>,
    known_accounts: &[&str],
) -> axum::Router {
    let gateway = Arc::new(StubGateway {
        records: records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect(),
        errors: errors
            .into_iter()
            .map(|(id, error)| (id.to_string(), error))
            .collect(),
    });
    let directory = identity::memory();
    for account in known_accounts {
        directory.register_account(account).await;
    }
    let store = store::memory();
    let reconciler = Arc::new(ReconcileService::new(
        gateway,
        directory.clone(),
        store.clone(),
    ));
    build_router(AppState::new(
        test_config(),
        reconciler,
        directory,
        store,
        "memory",
    ))
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    Ok(serde_json::from_slice(&collected.to_bytes())?)
}

fn post_webhook(body: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::POST)
        .uri("/webhook")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

fn approved_record(id: &str, account_ref: &str, credits: &str) -> PaymentRecord {
    PaymentRecord {
        id: id.to_string(),
        status: PaymentStatus::Approved,
        amount: 1500,
        external_reference: String::new(),
        metadata: HashMap::from([
            ("account_ref".to_string(), account_ref.to_string()),
            ("package_id".to_string(), "pkg_10".to_string()),
            ("credits_amount".to_string(), credits.to_string()),
        ]),
    }
}

#[tokio::test]
async fn health_and_webhook_probe_are_available() -> Result<()> {
    let app = test_router(vec![], vec![], &[]).await;

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
        .await?;
    assert_eq!(health.status(), StatusCode::OK);
    let health = response_json(health).await?;
    assert_eq!(health.get("status").and_then(Value::as_str), Some("ok"));
    assert_eq!(
        health.get("store_driver").and_then(Value::as_str),
        Some("memory")
    );

    let probe = app
        .oneshot(Request::builder().uri("/webhook").body(Body::empty())?)
        .await?;
    assert_eq!(probe.status(), StatusCode::OK);
    let probe = response_json(probe).await?;
    assert_eq!(
        probe
            .get("gateway_credential_configured")
            .and_then(Value::as_bool),
        Some(true)
    );
    Ok(())
}

#[tokio::test]
async fn malformed_payload_is_acknowledged_with_200() -> Result<()> {
    let app = test_router(vec![], vec![], &[]).await;

    let response = app.oneshot(post_webhook("this is not json {{")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await?;
    assert_eq!(ack.get("success").and_then(Value::as_bool), Some(false));
    assert_eq!(ack.get("outcome").and_then(Value::as_str), Some("failed"));
    assert_eq!(
        ack.get("errorKind").and_then(Value::as_str),
        Some("validation_error")
    );
    Ok(())
}

#[tokio::test]
async fn non_payment_events_are_acknowledged_and_ignored() -> Result<()> {
    let app = test_router(vec![], vec![], &[]).await;

    let response = app
        .oneshot(post_webhook(r#"{"type":"subscription","data":{"id":"S1"}}"#)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await?;
    assert_eq!(ack.get("success").and_then(Value::as_bool), Some(true));
    assert_eq!(ack.get("outcome").and_then(Value::as_str), Some("ignored"));
    assert_eq!(
        ack.get("detail").and_then(Value::as_str),
        Some("non-payment event")
    );
    Ok(())
}

#[tokio::test]
async fn missing_resource_id_is_acknowledged_as_validation_failure() -> Result<()> {
    let app = test_router(vec![], vec![], &[]).await;

    let response = app
        .oneshot(post_webhook(r#"{"type":"payment","data":{}}"#)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await?;
    assert_eq!(ack.get("success").and_then(Value::as_bool), Some(false));
    assert_eq!(
        ack.get("errorKind").and_then(Value::as_str),
        Some("validation_error")
    );
    Ok(())
}

#[tokio::test]
async fn every_gateway_failure_is_still_acknowledged_with_200() -> Result<()> {
    let cases = [
        ("P1", GatewayError::NotFound, "ignored"),
        ("P2", GatewayError::Unauthorized, "failed"),
        (
            "P3",
            GatewayError::ServerError {
                status: 502,
                body: "bad gateway".to_string(),
            },
            "failed",
        ),
        (
            "P4",
            GatewayError::Unreachable("timed out".to_string()),
            "failed",
        ),
    ];
    for (resource_id, error, expected_outcome) in cases {
        let app = test_router(vec![], vec![(resource_id, error)], &[]).await;
        let body = format!(r#"{{"type":"payment","data":{{"id":"{resource_id}"}}}}"#);
        let response = app.oneshot(post_webhook(body.as_str())?).await?;
        assert_eq!(
            response.status(),
            StatusCode::OK,
            "delivery ack for {resource_id} must be 200"
        );
        let ack = response_json(response).await?;
        assert_eq!(
            ack.get("outcome").and_then(Value::as_str),
            Some(expected_outcome),
            "unexpected outcome for {resource_id}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn approved_payment_is_credited_then_replayed_then_visible_in_snapshot() -> Result<()> {
    let app = test_router(vec![approved_record("P1", "u1", "10")], vec![], &["u1"]).await;
    let body = r#"{"type":"payment","data":{"id":"P1"}}"#;

    let first = app.clone().oneshot(post_webhook(body)?).await?;
    assert_eq!(first.status(), StatusCode::OK);
    let first = response_json(first).await?;
    assert_eq!(first.get("outcome").and_then(Value::as_str), Some("credited"));
    assert_eq!(first.get("accountId").and_then(Value::as_str), Some("u1"));
    assert_eq!(first.get("creditsAdded").and_then(Value::as_i64), Some(10));
    assert_eq!(first.get("paymentId").and_then(Value::as_str), Some("P1"));

    let second = app.clone().oneshot(post_webhook(body)?).await?;
    assert_eq!(second.status(), StatusCode::OK);
    let second = response_json(second).await?;
    assert_eq!(
        second.get("outcome").and_then(Value::as_str),
        Some("already_processed")
    );

    let snapshot = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/internal/v1/accounts/u1")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(snapshot.status(), StatusCode::OK);
    let snapshot = response_json(snapshot).await?;
    assert_eq!(
        snapshot.get("credit_balance").and_then(Value::as_i64),
        Some(10)
    );
    let applied = snapshot
        .get("applied_payment_ids")
        .and_then(Value::as_array)
        .context("snapshot should list applied payment ids")?;
    assert_eq!(applied.len(), 1);

    let unknown = app
        .oneshot(
            Request::builder()
                .uri("/internal/v1/accounts/ghost")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    Ok(())
}
