use axum::{extract::State, Json};

use super::AppState;
use crate::api::middleware::AppError;
use crate::models::preview::RulesView;
use crate::models::rule_config::RuleConfiguration;
use crate::services::rule::RuleModelBuilder;

/// Summary of the active rule model
pub async fn get_rules(State(state): State<AppState>) -> Result<Json<RulesView>, AppError> {
    let model = state.rules.snapshot();
    Ok(Json(RulesView::from(model.as_ref())))
}

/// Rebuild the rule model from the rule file and swap it in; in-flight requests keep
/// the snapshot they started with
pub async fn reload_rules(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let path = state.config.rules.path.clone();
    let configuration = RuleConfiguration::load(&path)?;
    let model = RuleModelBuilder::new(state.config.kernel.worker_id).build(&configuration)?;
    let logic_tables = model.sharding.table_rules().count();
    state.rules.replace(model);

    tracing::info!("Reloaded rules from {} ({} logic tables)", path, logic_tables);

    Ok(Json(serde_json::json!({
        "reloaded": true,
        "path": path,
        "logic_tables": logic_tables
    })))
}
