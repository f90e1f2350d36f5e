// Readwrite decoration: units routed to a readwrite group are pointed at one member.

use crate::api::middleware::AppError;
use crate::models::route::RouteContext;
use crate::services::rule::ReadwriteSplittingRule;

/// Replace each group-named actual data source with the primary, or with a replica for reads
pub fn decorate(
    rule: &ReadwriteSplittingRule,
    context: &mut RouteContext,
    is_read: bool,
) -> Result<(), AppError> {
    if rule.is_empty() {
        return Ok(());
    }
    for unit in context.route_units_mut() {
        let Some(group) = rule.find_group(unit.logic_data_source()) else {
            continue;
        };
        let member = group.route(is_read)?;
        tracing::debug!("Readwrite group {} resolved to {}", group.name, member);
        unit.data_source_mapper.actual_name = member;
    }
    Ok(())
}
