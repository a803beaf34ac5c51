//! # groupcast server
//!
//! Real-time group relay over WebSockets.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! groupcast
//!
//! # Run with a config file
//! GROUPCAST_CONFIG=/path/to/groupcast.toml groupcast
//!
//! # Run with environment variables
//! GROUPCAST_PORT=8080 GROUPCAST_HOST=0.0.0.0 groupcast
//!
//! # Then
//! curl -X POST 'http://127.0.0.1:8080/create?id=lobby'
//! websocat ws://127.0.0.1:8080/groups/lobby
//! curl -X DELETE http://127.0.0.1:8080/groups/lobby
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "groupcast_core=debug,groupcast_server=debug,groupcast_transport=debug,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting groupcast on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
