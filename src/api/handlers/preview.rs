use axum::{extract::State, Json};

use super::AppState;
use crate::api::middleware::AppError;
use crate::models::preview::{PreviewRequest, PreviewResponse};

/// Route and rewrite a statement without executing it
pub async fn preview(
    State(state): State<AppState>,
    Json(payload): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, AppError> {
    if payload.sql.trim().is_empty() {
        return Err(AppError::Validation("SQL cannot be empty".to_string()));
    }

    let span = tracing::info_span!("route", sql = %payload.sql);
    let _entered = span.enter();

    let context = state
        .kernel()
        .execute(&payload.sql, &payload.parameters, &payload.hint)?;

    tracing::info!(
        "Previewed statement: {} route unit(s), {} execution unit(s)",
        context.route_context.route_units().len(),
        context.execution_units.len()
    );

    Ok(Json(context.into()))
}
