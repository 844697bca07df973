use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub gateway_base_url: String,
    pub gateway_access_token: Option<String>,
    pub gateway_timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid BILLING_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid PAYMENT_GATEWAY_BASE_URL: {0}")]
    InvalidGatewayBaseUrl(String),
    #[error("invalid PAYMENT_GATEWAY_TIMEOUT_MS: {0}")]
    InvalidGatewayTimeoutMs(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("BILLING_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            env::var("BILLING_SERVICE_NAME").unwrap_or_else(|_| "billing".to_string());
        let build_sha = env::var("BILLING_BUILD_SHA").unwrap_or_else(|_| "dev".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let gateway_base_url = env::var("PAYMENT_GATEWAY_BASE_URL")
            .unwrap_or_else(|_| "https://api.mercadopago.com".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if gateway_base_url.is_empty() {
            return Err(ConfigError::InvalidGatewayBaseUrl(
                "must not be empty".to_string(),
            ));
        }
        let gateway_access_token = env::var("PAYMENT_GATEWAY_ACCESS_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let gateway_timeout_ms = env::var("PAYMENT_GATEWAY_TIMEOUT_MS")
            .unwrap_or_else(|_| "15000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidGatewayTimeoutMs(error.to_string()))?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            gateway_base_url,
            gateway_access_token,
            gateway_timeout_ms,
        })
    }
}
