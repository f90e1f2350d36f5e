use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{preview, rules, AppState};
use crate::config::Config;
use crate::services::rule::RuleModelHolder;

/// Create router with application state
pub fn create_router_with_state(rules: Arc<RuleModelHolder>, config: Config) -> Router {
    let state = AppState::new(rules, config);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/preview", post(preview::preview))
        .route("/api/rules", get(rules::get_rules))
        .route("/api/rules/reload", post(rules::reload_rules))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
