use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use shard_route::api;
use shard_route::config::Config;
use shard_route::models::rule_config::RuleConfiguration;
use shard_route::services::rule::{RuleModelBuilder, RuleModelHolder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Pick up RUST_LOG from .env before the subscriber reads it
    let _ = dotenv::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting server on {}", config.server_address());

    // Build the rule model
    let rule_config = RuleConfiguration::load(&config.rules.path).map_err(|e| {
        error!("Failed to load rules from {}: {}", config.rules.path, e);
        e
    })?;
    let model = RuleModelBuilder::new(config.kernel.worker_id)
        .build(&rule_config)
        .map_err(|e| {
            error!("Failed to build rule model: {}", e);
            e
        })?;
    info!(
        "Loaded {} logic table(s) over {} data source(s)",
        model.sharding.table_rules().count(),
        model.logic_data_source_names().len()
    );

    let rules = Arc::new(RuleModelHolder::new(model));

    // Create router with state
    let app: Router = api::routes::create_router_with_state(rules, config.clone());

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
