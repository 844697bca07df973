use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use super::gateway::{GatewayError, PaymentGateway};
use super::identity::IdentityResolver;
use super::reference;
use super::store::AccountStore;
use super::types::{FailureKind, Outcome, PaymentEvent, PaymentStatus};

/// Drives one notification through the reconciliation pipeline:
/// fetch the authoritative record, gate on status, decode the intent,
/// resolve the account, apply the credit idempotently.
///
/// All collaborators are injected at construction so tests can substitute
/// fakes and so a misconfigured gateway is reported once, at startup, rather
/// than discovered lazily.
pub struct ReconcileService {
    gateway: Arc<dyn PaymentGateway>,
    identity: Arc<dyn IdentityResolver>,
    store: Arc<dyn AccountStore>,
}

impl ReconcileService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        identity: Arc<dyn IdentityResolver>,
        store: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            gateway,
            identity,
            store,
        }
    }

    /// Never returns an error: every internal failure folds into the
    /// [`Outcome`] so the receiver can acknowledge the delivery regardless.
    /// There are no retries here either — if the gateway redelivers, the
    /// store's idempotency guard is what keeps the credit single.
    pub async fn process(&self, event: &PaymentEvent) -> Outcome {
        let record = match self.gateway.fetch_payment(event.resource_id.as_str()).await {
            Ok(record) => record,
            Err(GatewayError::NotFound) => {
                info!(
                    resource_id = %event.resource_id,
                    "payment not found at gateway; treating as a test or expired payment"
                );
                return Outcome::Ignored {
                    reason: "payment not found".to_string(),
                };
            }
            Err(error @ GatewayError::Unauthorized) => {
                return Outcome::Failed {
                    kind: FailureKind::Configuration,
                    detail: error.to_string(),
                };
            }
            Err(error) => {
                warn!(
                    resource_id = %event.resource_id,
                    reason = %error,
                    "gateway query failed; payment left unreconciled"
                );
                return Outcome::Failed {
                    kind: FailureKind::Gateway,
                    detail: error.to_string(),
                };
            }
        };

        // Only approved payments ever reach the store; pending, rejected and
        // any status we do not recognize are acknowledged without mutation.
        if record.status != PaymentStatus::Approved {
            info!(
                payment_id = %record.id,
                status = %record.status.as_str(),
                "payment is not approved; nothing to credit"
            );
            return Outcome::Ignored {
                reason: format!("payment status is {}", record.status.as_str()),
            };
        }

        let intent = match reference::decode(&record) {
            Ok(intent) => intent,
            Err(decode_error) => {
                warn!(
                    payment_id = %record.id,
                    external_reference = %record.external_reference,
                    reason = %decode_error,
                    "approved payment carries no decodable credit intent"
                );
                return Outcome::Failed {
                    kind: FailureKind::Decode,
                    detail: decode_error.to_string(),
                };
            }
        };

        let account = match self.identity.resolve(intent.account_ref()).await {
            Ok(handle) => handle,
            Err(resolve_error) => {
                warn!(
                    payment_id = %record.id,
                    account_ref = %intent.account_ref(),
                    reason = %resolve_error,
                    "could not resolve the account for an approved payment"
                );
                return Outcome::Failed {
                    kind: FailureKind::Resolve,
                    detail: resolve_error.to_string(),
                };
            }
        };

        let delta = intent.delta();
        match self
            .store
            .apply_credit(&account, record.id.as_str(), &delta, Utc::now())
            .await
        {
            Ok((audit, true)) => {
                info!(
                    payment_id = %record.id,
                    account_id = %account.account_id,
                    delta_kind = %audit.delta_kind,
                    amount = audit.amount,
                    "credit applied"
                );
                Outcome::Credited {
                    account_id: account.account_id,
                    amount_applied: audit.amount,
                }
            }
            Ok((audit, false)) => {
                info!(
                    payment_id = %record.id,
                    account_id = %account.account_id,
                    applied_at = %audit.applied_at,
                    "payment already applied; duplicate delivery skipped"
                );
                Outcome::AlreadyProcessed {
                    payment_id: record.id.clone(),
                }
            }
            Err(store_error) => {
                error!(
                    payment_id = %record.id,
                    account_id = %account.account_id,
                    reason = %store_error,
                    "failed to persist the credit"
                );
                Outcome::Failed {
                    kind: FailureKind::Store,
                    detail: store_error.to_string(),
                }
            }
        }
    }
}
