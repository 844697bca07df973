use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::Config,
    reconcile::{
        identity::{IdentityResolver, ResolveError},
        service::ReconcileService,
        store::AccountStore,
        types::{AccountSnapshot, FailureKind, Outcome, PaymentEvent},
    },
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    reconciler: Arc<ReconcileService>,
    identity: Arc<dyn IdentityResolver>,
    store: Arc<dyn AccountStore>,
    store_driver: &'static str,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        reconciler: Arc<ReconcileService>,
        identity: Arc<dyn IdentityResolver>,
        store: Arc<dyn AccountStore>,
        store_driver: &'static str,
    ) -> Self {
        Self {
            config,
            reconciler,
            identity,
            store,
            store_driver,
            started_at: Utc::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/webhook", get(webhook_probe).post(receive_notification))
        .route("/internal/v1/accounts/:account_ref", get(get_account))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store_driver: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        build_sha: state.config.build_sha,
        uptime_seconds,
        store_driver: state.store_driver,
    })
}

#[derive(Debug, Serialize)]
struct WebhookProbeResponse {
    service: String,
    gateway_base_url: String,
    gateway_credential_configured: bool,
    store_driver: &'static str,
}

/// Config-sanity probe for the webhook path. No side effects; useful to check
/// from the gateway's dashboard that the endpoint is alive and actually holds
/// a credential.
async fn webhook_probe(State(state): State<AppState>) -> Json<WebhookProbeResponse> {
    Json(WebhookProbeResponse {
        service: state.config.service_name,
        gateway_base_url: state.config.gateway_base_url,
        gateway_credential_configured: state.config.gateway_access_token.is_some(),
        store_driver: state.store_driver,
    })
}

#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<NotificationData>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationData {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationAck {
    success: bool,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credits_added: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Receives a payment notification from the gateway.
///
/// Always answers HTTP 200, whatever happened internally: a non-success
/// response would only make the gateway's retry policy amplify a local fault
/// into a duplicate-delivery storm. The real result travels in the body's
/// `outcome` field and in the logs; operators watch those, not status codes.
async fn receive_notification(
    State(state): State<AppState>,
    body: String,
) -> Json<NotificationAck> {
    let envelope = match serde_json::from_str::<NotificationEnvelope>(&body) {
        Ok(envelope) => envelope,
        Err(parse_error) => {
            warn!(reason = %parse_error, "discarding unparsable payment notification");
            return ack(
                Outcome::Failed {
                    kind: FailureKind::Validation,
                    detail: "unparsable notification payload".to_string(),
                },
                None,
            );
        }
    };

    if envelope.kind.as_deref() != Some("payment") {
        return ack(
            Outcome::Ignored {
                reason: "non-payment event".to_string(),
            },
            None,
        );
    }

    let resource_id = envelope
        .data
        .and_then(|data| data.id)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let Some(resource_id) = resource_id else {
        warn!("payment notification is missing the payment resource id");
        return ack(
            Outcome::Failed {
                kind: FailureKind::Validation,
                detail: "missing payment resource id".to_string(),
            },
            None,
        );
    };

    let event = PaymentEvent {
        kind: "payment".to_string(),
        resource_id: resource_id.clone(),
    };
    let outcome = state.reconciler.process(&event).await;
    ack(outcome, Some(resource_id))
}

fn ack(outcome: Outcome, payment_id: Option<String>) -> Json<NotificationAck> {
    let label = outcome.label();
    let ack = match outcome {
        Outcome::Credited {
            account_id,
            amount_applied,
        } => NotificationAck {
            success: true,
            outcome: label,
            error_kind: None,
            payment_id,
            account_id: Some(account_id),
            credits_added: Some(amount_applied),
            detail: None,
        },
        Outcome::AlreadyProcessed { payment_id } => NotificationAck {
            success: true,
            outcome: label,
            error_kind: None,
            payment_id: Some(payment_id),
            account_id: None,
            credits_added: None,
            detail: None,
        },
        Outcome::Ignored { reason } => NotificationAck {
            success: true,
            outcome: label,
            error_kind: None,
            payment_id,
            account_id: None,
            credits_added: None,
            detail: Some(reason),
        },
        Outcome::Failed { kind, detail } => {
            warn!(
                payment_id = payment_id.as_deref().unwrap_or("unknown"),
                error_kind = kind.as_str(),
                detail = %detail,
                "payment notification processing failed; acknowledged anyway"
            );
            NotificationAck {
                success: false,
                outcome: label,
                error_kind: Some(kind.as_str()),
                payment_id,
                account_id: None,
                credits_added: None,
                detail: Some(detail),
            }
        }
    };
    Json(ack)
}

#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal_error",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

async fn get_account(
    State(state): State<AppState>,
    Path(account_ref): Path<String>,
) -> Result<Json<AccountSnapshot>, ApiError> {
    let handle = state
        .identity
        .resolve(account_ref.as_str())
        .await
        .map_err(|error| match error {
            ResolveError::Unknown(_) => ApiError::NotFound,
            ResolveError::Directory(detail) => ApiError::Internal(detail),
        })?;
    let snapshot = state
        .store
        .get_account(handle.account_id.as_str())
        .await
        .map_err(|error| ApiError::Internal(error.to_string()))?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests;
