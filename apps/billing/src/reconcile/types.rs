use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The inbound notification, reduced to the two fields we act on. Everything
/// else in the delivery body is untrusted and ignored; the authoritative
/// payment data is re-fetched from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub kind: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    Approved,
    Pending,
    Rejected,
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::Other(status) => status.as_str(),
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(value: String) -> Self {
        match value.trim() {
            "approved" => Self::Approved,
            "pending" => Self::Pending,
            "rejected" => Self::Rejected,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<PaymentStatus> for String {
    fn from(value: PaymentStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Authoritative payment record as served by the gateway. Fetched fresh per
/// event, never cached beyond the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub external_reference: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What a payment should credit, and to whom. One variant per product type;
/// adding a product means adding a variant here, not threading new field
/// checks through the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditIntent {
    CreditsPurchase {
        account_ref: String,
        package_id: String,
        credits_amount: i64,
    },
    ReviewPackagePurchase {
        account_ref: String,
        units_to_add: i64,
    },
}

impl CreditIntent {
    pub fn account_ref(&self) -> &str {
        match self {
            Self::CreditsPurchase { account_ref, .. }
            | Self::ReviewPackagePurchase { account_ref, .. } => account_ref.as_str(),
        }
    }

    pub fn delta(&self) -> CreditDelta {
        match self {
            Self::CreditsPurchase { credits_amount, .. } => CreditDelta::Credits {
                amount: *credits_amount,
            },
            Self::ReviewPackagePurchase { units_to_add, .. } => CreditDelta::ReviewPackage {
                units: *units_to_add,
            },
        }
    }
}

/// The account-agnostic mutation a decoded intent reduces to once the account
/// reference has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditDelta {
    Credits { amount: i64 },
    ReviewPackage { units: i64 },
}

impl CreditDelta {
    pub fn amount(&self) -> i64 {
        match self {
            Self::Credits { amount } => *amount,
            Self::ReviewPackage { units } => *units,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credits { .. } => "credits",
            Self::ReviewPackage { .. } => "review_package",
        }
    }
}

/// Canonical account handle produced by identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountHandle {
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPackage {
    pub id: String,
    pub included_units: i64,
    pub used_units: i64,
    pub remaining_units: i64,
    pub source_payment_id: String,
}

/// One row of the applied-payment trail. Doubles as the idempotency set (the
/// payment ids) and the audit history (what was applied, when).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAuditRow {
    pub audit_id: String,
    pub account_id: String,
    pub payment_id: String,
    pub delta_kind: String,
    pub amount: i64,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub credit_balance: i64,
    pub review_packages: Vec<ReviewPackage>,
    pub applied_payment_ids: Vec<String>,
    pub audit: Vec<CreditAuditRow>,
}

/// Terminal result of processing one notification. Always mapped to a success
/// acknowledgement at the receiver boundary; the variant is what operators
/// monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ignored { reason: String },
    AlreadyProcessed { payment_id: String },
    Credited { account_id: String, amount_applied: i64 },
    Failed { kind: FailureKind, detail: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored { .. } => "ignored",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::Credited { .. } => "credited",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Configuration,
    Gateway,
    Decode,
    Resolve,
    Store,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Configuration => "configuration_error",
            Self::Gateway => "gateway_error",
            Self::Decode => "decode_error",
            Self::Resolve => "resolve_error",
            Self::Store => "store_error",
        }
    }
}
