use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Ledger tables live in the `billing` schema. The composite primary key on
/// `applied_payments` is the idempotency guard: a redelivered payment's insert
/// conflicts and the reconciliation resolves to `already_processed` instead of
/// crediting twice.
const SCHEMA_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS billing;

CREATE TABLE IF NOT EXISTS billing.account_directory (
    account_id TEXT PRIMARY KEY,
    email      TEXT UNIQUE
);

CREATE TABLE IF NOT EXISTS billing.accounts (
    account_id     TEXT PRIMARY KEY,
    credit_balance BIGINT NOT NULL DEFAULT 0 CHECK (credit_balance >= 0),
    created_at     TIMESTAMPTZ NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS billing.applied_payments (
    account_id TEXT NOT NULL REFERENCES billing.accounts (account_id),
    payment_id TEXT NOT NULL,
    audit_id   TEXT NOT NULL,
    delta_kind TEXT NOT NULL,
    amount     BIGINT NOT NULL CHECK (amount > 0),
    applied_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (account_id, payment_id)
);

CREATE TABLE IF NOT EXISTS billing.review_packages (
    id                TEXT PRIMARY KEY,
    account_id        TEXT NOT NULL REFERENCES billing.accounts (account_id),
    included_units    BIGINT NOT NULL,
    used_units        BIGINT NOT NULL DEFAULT 0,
    source_payment_id TEXT NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL
);
"#;

#[derive(Clone)]
pub struct BillingDb {
    client: Arc<Mutex<Client>>,
}

impl BillingDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "billing postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA_DDL)
            .await
            .context("apply billing schema")?;
        Ok(())
    }
}
