// Hint routing: a forced data source bypasses the sharding rules entirely.

use crate::api::middleware::AppError;
use crate::models::route::{RouteContext, RouteMapper, RouteUnit};
use crate::services::rule::RuleModel;

pub fn route_hint(model: &RuleModel, data_source: &str, tables: &[String]) -> Result<RouteContext, AppError> {
    if !model.contains_data_source(data_source) {
        return Err(AppError::HintDataSourceNotFound(data_source.to_string()));
    }
    let mut unit = RouteUnit::new(RouteMapper::identity(data_source));
    if !tables.is_empty() {
        unit.add_group(tables.iter().map(|table| RouteMapper::identity(table.clone())).collect());
    }
    let mut context = RouteContext::new();
    context.put_unit(unit);
    Ok(context)
}
