#![forbid(unsafe_code)]

use std::sync::Arc;

use forge_adapter::config::AdapterConfig;
use forge_adapter::{http, AdapterRuntime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AdapterConfig::from_env()?;
    let runtime = Arc::new(AdapterRuntime::from_config(&config)?);
    let app = http::router(runtime.clone());

    info!(bind = %config.bind, "forge_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let in_flight = runtime.submitter().in_flight_count();
    if in_flight > 0 {
        warn!(in_flight, "shutting down with builds in flight; they stay pending");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
