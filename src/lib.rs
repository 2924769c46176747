pub mod billing;
pub mod commands;
pub mod config;
pub mod error;
mod rate_limit;

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use billing::{EntitlementService, SqliteStore, StripeProvider};
use config::Config;
use error::StartupError;

/// Load configuration, open the store and serve the command surface
pub async fn run() -> Result<(), StartupError> {
    // Load .env from the working directory, then its parent
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }

    // Initialize tracing with RUST_LOG env filter
    // Default: warn for most crates, info for ours (reconcile summaries visible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,entitlements=info")),
        )
        .init();

    let config = Config::from_env()?;
    let store = SqliteStore::open(&config.db_path)?;
    let provider = StripeProvider::new(config.stripe.clone())?;
    let service = EntitlementService::new(Arc::new(store), Arc::new(provider), config.service);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        addr = %config.bind_addr,
        db = %config.db_path.display(),
        "Entitlement service listening"
    );
    axum::serve(listener, commands::router(Arc::new(service))).await?;
    Ok(())
}
