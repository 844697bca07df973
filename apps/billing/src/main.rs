use anyhow::Result;
use tracing_subscriber::EnvFilter;

use gradhire_billing_service::{config::Config, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    serve(config).await
}
