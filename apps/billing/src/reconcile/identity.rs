use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::BillingDb;

use super::types::AccountHandle;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown account reference: {0}")]
    Unknown(String),
    #[error("directory error: {0}")]
    Directory(String),
}

/// Maps an opaque account reference (an email address or an internal account
/// id) to the canonical account handle. Crediting an unknown account is never
/// acceptable, so resolution failure is terminal for the reconciliation.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, account_ref: &str) -> Result<AccountHandle, ResolveError>;
}

pub fn memory() -> Arc<MemoryDirectory> {
    Arc::new(MemoryDirectory::default())
}

pub fn postgres(db: Arc<BillingDb>) -> Arc<dyn IdentityResolver> {
    Arc::new(PostgresDirectory { db })
}

#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<MemoryDirectoryInner>,
}

#[derive(Default)]
struct MemoryDirectoryInner {
    by_email: HashMap<String, String>,
    account_ids: HashSet<String>,
}

impl MemoryDirectory {
    pub async fn register_account(&self, account_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.account_ids.insert(account_id.to_string());
    }

    pub async fn register_email(&self, email: &str, account_id: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .by_email
            .insert(email.to_string(), account_id.to_string());
        inner.account_ids.insert(account_id.to_string());
    }
}

#[async_trait]
impl IdentityResolver for MemoryDirectory {
    async fn resolve(&self, account_ref: &str) -> Result<AccountHandle, ResolveError> {
        let account_ref = account_ref.trim();
        let inner = self.inner.lock().await;
        if account_ref.contains('@') {
            if let Some(account_id) = inner.by_email.get(account_ref) {
                return Ok(AccountHandle {
                    account_id: account_id.clone(),
                });
            }
        }
        if inner.account_ids.contains(account_ref) {
            return Ok(AccountHandle {
                account_id: account_ref.to_string(),
            });
        }
        Err(ResolveError::Unknown(account_ref.to_string()))
    }
}

struct PostgresDirectory {
    db: Arc<BillingDb>,
}

#[async_trait]
impl IdentityResolver for PostgresDirectory {
    async fn resolve(&self, account_ref: &str) -> Result<AccountHandle, ResolveError> {
        let account_ref = account_ref.trim();
        let client = self.db.client();
        let client = client.lock().await;
        // Email-shaped refs try the email column first but still fall back to
        // an id match, since legacy references carry whatever the checkout
        // flow put there.
        let query = if account_ref.contains('@') {
            r#"
            SELECT account_id
              FROM billing.account_directory
             WHERE email = $1 OR account_id = $1
            "#
        } else {
            r#"
            SELECT account_id
              FROM billing.account_directory
             WHERE account_id = $1
            "#
        };
        let row = client
            .query_opt(query, &[&account_ref])
            .await
            .map_err(|error| ResolveError::Directory(error.to_string()))?;
        let Some(row) = row else {
            return Err(ResolveError::Unknown(account_ref.to_string()));
        };
        let account_id: String = row
            .try_get("account_id")
            .map_err(|error| ResolveError::Directory(error.to_string()))?;
        Ok(AccountHandle { account_id })
    }
}
