use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::BillingDb;

use super::types::{
    AccountHandle, AccountSnapshot, CreditAuditRow, CreditDelta, ReviewPackage,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(String),
}

/// Durable per-account ledger.
///
/// Idempotency contract for `apply_credit`:
/// - first call for an `(account, payment_id)` pair applies the delta and
///   returns `(row, true)`;
/// - every later call (including a concurrent loser) returns the stored row
///   and `false`, without mutating anything.
/// The check and the mutation are one atomic unit per account; callers never
/// need a retry loop around this.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn apply_credit(
        &self,
        account: &AccountHandle,
        payment_id: &str,
        delta: &CreditDelta,
        now: DateTime<Utc>,
    ) -> Result<(CreditAuditRow, bool), StoreError>;

    async fn get_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountSnapshot>, StoreError>;
}

pub fn memory() -> Arc<dyn AccountStore> {
    Arc::new(MemoryAccountStore::default())
}

pub fn postgres(db: Arc<BillingDb>) -> Arc<dyn AccountStore> {
    Arc::new(PostgresAccountStore { db })
}

#[derive(Default)]
struct MemoryAccountStore {
    inner: Mutex<HashMap<String, MemoryAccount>>,
}

#[derive(Default)]
struct MemoryAccount {
    credit_balance: i64,
    review_packages: Vec<ReviewPackage>,
    applied: Vec<CreditAuditRow>,
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn apply_credit(
        &self,
        account: &AccountHandle,
        payment_id: &str,
        delta: &CreditDelta,
        now: DateTime<Utc>,
    ) -> Result<(CreditAuditRow, bool), StoreError> {
        // Check and mutation happen under a single lock acquisition; the
        // losing side of a concurrent duplicate delivery observes the
        // winner's audit row.
        let mut inner = self.inner.lock().await;
        let entry = inner.entry(account.account_id.clone()).or_default();
        if let Some(existing) = entry
            .applied
            .iter()
            .find(|row| row.payment_id == payment_id)
        {
            return Ok((existing.clone(), false));
        }

        match delta {
            CreditDelta::Credits { amount } => {
                entry.credit_balance += amount;
            }
            CreditDelta::ReviewPackage { units } => {
                entry.review_packages.push(ReviewPackage {
                    id: Uuid::new_v4().to_string(),
                    included_units: *units,
                    used_units: 0,
                    remaining_units: *units,
                    source_payment_id: payment_id.to_string(),
                });
            }
        }
        let row = CreditAuditRow {
            audit_id: Uuid::new_v4().to_string(),
            account_id: account.account_id.clone(),
            payment_id: payment_id.to_string(),
            delta_kind: delta.kind().to_string(),
            amount: delta.amount(),
            applied_at: now,
        };
        entry.applied.push(row.clone());
        Ok((row, true))
    }

    async fn get_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountSnapshot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.get(account_id).map(|account| AccountSnapshot {
            account_id: account_id.to_string(),
            credit_balance: account.credit_balance,
            review_packages: account.review_packages.clone(),
            applied_payment_ids: account
                .applied
                .iter()
                .map(|row| row.payment_id.clone())
                .collect(),
            audit: account.applied.clone(),
        }))
    }
}

struct PostgresAccountStore {
    db: Arc<BillingDb>,
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn apply_credit(
        &self,
        account: &AccountHandle,
        payment_id: &str,
        delta: &CreditDelta,
        now: DateTime<Utc>,
    ) -> Result<(CreditAuditRow, bool), StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO billing.accounts (account_id, credit_balance, created_at, updated_at)
            VALUES ($1, 0, $2, $2)
            ON CONFLICT (account_id) DO NOTHING
            "#,
            &[&account.account_id, &now],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;

        let audit_id = Uuid::new_v4().to_string();
        let delta_kind = delta.kind();
        let amount = delta.amount();
        // The (account_id, payment_id) primary key is the idempotency guard.
        // A concurrent duplicate blocks on the winner's uncommitted insert
        // and then resolves to zero rows here, never to a double credit.
        let inserted = tx
            .execute(
                r#"
                INSERT INTO billing.applied_payments (
                    account_id, payment_id, audit_id, delta_kind, amount, applied_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (account_id, payment_id) DO NOTHING
                "#,
                &[
                    &account.account_id,
                    &payment_id,
                    &audit_id,
                    &delta_kind,
                    &amount,
                    &now,
                ],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        if inserted == 0 {
            let row = tx
                .query_one(
                    r#"
                    SELECT audit_id, account_id, payment_id, delta_kind, amount, applied_at
                      FROM billing.applied_payments
                     WHERE account_id = $1 AND payment_id = $2
                    "#,
                    &[&account.account_id, &payment_id],
                )
                .await
                .map_err(|error| StoreError::Db(error.to_string()))?;
            let existing = map_audit_row(&row).map_err(StoreError::Db)?;
            tx.commit()
                .await
                .map_err(|error| StoreError::Db(error.to_string()))?;
            return Ok((existing, false));
        }

        match delta {
            CreditDelta::Credits { amount } => {
                tx.execute(
                    r#"
                    UPDATE billing.accounts
                       SET credit_balance = credit_balance + $2, updated_at = $3
                     WHERE account_id = $1
                    "#,
                    &[&account.account_id, amount, &now],
                )
                .await
                .map_err(|error| StoreError::Db(error.to_string()))?;
            }
            CreditDelta::ReviewPackage { units } => {
                tx.execute(
                    r#"
                    INSERT INTO billing.review_packages (
                        id, account_id, included_units, used_units, source_payment_id, created_at
                    ) VALUES ($1, $2, $3, 0, $4, $5)
                    "#,
                    &[
                        &Uuid::new_v4().to_string(),
                        &account.account_id,
                        units,
                        &payment_id,
                        &now,
                    ],
                )
                .await
                .map_err(|error| StoreError::Db(error.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        Ok((
            CreditAuditRow {
                audit_id,
                account_id: account.account_id.clone(),
                payment_id: payment_id.to_string(),
                delta_kind: delta_kind.to_string(),
                amount,
                applied_at: now,
            },
            true,
        ))
    }

    async fn get_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountSnapshot>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let account = client
            .query_opt(
                r#"
                SELECT account_id, credit_balance
                  FROM billing.accounts
                 WHERE account_id = $1
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let Some(account) = account else {
            return Ok(None);
        };
        let credit_balance: i64 = account
            .try_get("credit_balance")
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let packages = client
            .query(
                r#"
                SELECT id, included_units, used_units, source_payment_id
                  FROM billing.review_packages
                 WHERE account_id = $1
                 ORDER BY created_at
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let review_packages = packages
            .iter()
            .map(map_review_package_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)?;

        let applied = client
            .query(
                r#"
                SELECT audit_id, account_id, payment_id, delta_kind, amount, applied_at
                  FROM billing.applied_payments
                 WHERE account_id = $1
                 ORDER BY applied_at
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let audit = applied
            .iter()
            .map(map_audit_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)?;

        Ok(Some(AccountSnapshot {
            account_id: account_id.to_string(),
            credit_balance,
            applied_payment_ids: audit.iter().map(|row| row.payment_id.clone()).collect(),
            review_packages,
            audit,
        }))
    }
}

fn map_audit_row(row: &tokio_postgres::Row) -> Result<CreditAuditRow, String> {
    Ok(CreditAuditRow {
        audit_id: row.try_get("audit_id").map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        payment_id: row.try_get("payment_id").map_err(|e| e.to_string())?,
        delta_kind: row.try_get("delta_kind").map_err(|e| e.to_string())?,
        amount: row.try_get("amount").map_err(|e| e.to_string())?,
        applied_at: row.try_get("applied_at").map_err(|e| e.to_string())?,
    })
}

fn map_review_package_row(row: &tokio_postgres::Row) -> Result<ReviewPackage, String> {
    let included_units: i64 = row.try_get("included_units").map_err(|e| e.to_string())?;
    let used_units: i64 = row.try_get("used_units").map_err(|e| e.to_string())?;
    Ok(ReviewPackage {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        included_units,
        used_units,
        remaining_units: included_units - used_units,
        source_payment_id: row
            .try_get("source_payment_id")
            .map_err(|e| e.to_string())?,
    })
}
