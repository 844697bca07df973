#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{
    config::Config,
    db::BillingDb,
    reconcile::{
        gateway::HttpPaymentGateway,
        identity::{self, IdentityResolver},
        service::ReconcileService,
        store::{self, AccountStore},
    },
    server::{AppState, build_router},
};

pub mod config;
pub mod db;
pub mod reconcile;
pub mod server;

pub async fn build_state(config: Config) -> Result<AppState> {
    if config.gateway_access_token.is_none() {
        // Without a credential the gateway answers 401 to every lookup, which
        // silently blocks all reconciliation. Surface it once, loudly, at
        // startup instead of letting it show up as per-event failures only.
        error!(
            gateway_base_url = %config.gateway_base_url,
            "PAYMENT_GATEWAY_ACCESS_TOKEN is not set; every payment notification will fail reconciliation as unauthorized"
        );
    }

    let db = match config.db_url.clone() {
        Some(url) => {
            let db = Arc::new(BillingDb::connect(url.as_str()).await?);
            db.ensure_schema().await?;
            Some(db)
        }
        None => None,
    };
    let (store, identity, store_driver): (
        Arc<dyn AccountStore>,
        Arc<dyn IdentityResolver>,
        &'static str,
    ) = match db {
        Some(db) => (store::postgres(db.clone()), identity::postgres(db), "postgres"),
        None => (store::memory(), identity::memory(), "memory"),
    };

    let gateway = Arc::new(HttpPaymentGateway::new(
        config.gateway_base_url.clone(),
        config.gateway_access_token.clone(),
        config.gateway_timeout_ms,
    ));
    let reconciler = Arc::new(ReconcileService::new(gateway, identity.clone(), store.clone()));

    Ok(AppState::new(config, reconciler, identity, store, store_driver))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "billing service listening"
    );
    axum::serve(listener, build_app(config).await?).await?;
    Ok(())
}
