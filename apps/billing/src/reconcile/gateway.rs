use async_trait::async_trait;

use super::types::PaymentRecord;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The gateway has no record of the payment. Benign: test or expired
    /// payments produce deliveries whose resource no longer exists.
    #[error("payment not found at gateway")]
    NotFound,
    /// The gateway rejected our credentials. A configuration fault that
    /// blocks all reconciliation until fixed.
    #[error("gateway rejected credentials")]
    Unauthorized,
    #[error("gateway error: http {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn fetch_payment(&self, resource_id: &str) -> Result<PaymentRecord, GatewayError>;
}

/// Queries the payment gateway's REST API for the authoritative payment
/// record. One bounded request per call; retries, if any, belong to the
/// caller (the reconciler performs none — redelivery safety comes from the
/// store's idempotency guard instead).
pub struct HttpPaymentGateway {
    base_url: String,
    access_token: Option<String>,
    timeout_ms: u64,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, access_token: Option<String>, timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            timeout_ms: timeout_ms.max(250).min(120_000),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn fetch_payment(&self, resource_id: &str) -> Result<PaymentRecord, GatewayError> {
        let Some(token) = self.access_token.as_deref() else {
            tracing::error!(
                resource_id,
                "no gateway access token configured; cannot verify payment"
            );
            return Err(GatewayError::Unauthorized);
        };

        let url = format!("{}/v1/payments/{resource_id}", self.base_url);
        match reqwest::Client::new()
            .get(url)
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .header("authorization", format!("Bearer {token}"))
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if status.is_success() {
                    return serde_json::from_str::<PaymentRecord>(&body).map_err(|error| {
                        GatewayError::ServerError {
                            status: status.as_u16(),
                            body: format!("unparsable payment record: {error}"),
                        }
                    });
                }
                match status.as_u16() {
                    404 => Err(GatewayError::NotFound),
                    401 => {
                        tracing::error!(
                            resource_id,
                            "gateway rejected credentials; reconciliation is blocked until the access token is fixed"
                        );
                        Err(GatewayError::Unauthorized)
                    }
                    code => Err(GatewayError::ServerError { status: code, body }),
                }
            }
            Err(error) => Err(GatewayError::Unreachable(error.to_string())),
        }
    }
}
