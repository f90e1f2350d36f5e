// Unicast routing: exactly one deterministic target.

use crate::api::middleware::AppError;
use crate::models::route::{RouteContext, RouteMapper, RouteUnit};
use crate::services::rule::RuleModel;

/// Default data source when configured, else the first logical data source by name
pub fn default_target(model: &RuleModel) -> Option<String> {
    model
        .sharding
        .default_data_source()
        .map(str::to_string)
        .or_else(|| model.logic_data_source_names().into_iter().next())
}

/// One unit on a data source every sharded table lives on, using each table's first local node
pub fn route_unicast(model: &RuleModel, tables: &[String]) -> Result<RouteContext, AppError> {
    let rule = &model.sharding;
    let sharded = rule.sharding_logic_tables(tables);

    let data_source = if sharded.is_empty() {
        default_target(model)
    } else {
        let mut candidates: Option<Vec<String>> = None;
        for table in &sharded {
            let Some(table_rule) = rule.find_table_rule(table) else {
                continue;
            };
            let names = table_rule.actual_data_source_names().to_vec();
            candidates = Some(match candidates {
                None => names,
                Some(existing) => existing.into_iter().filter(|name| names.contains(name)).collect(),
            });
        }
        candidates.and_then(|names| names.into_iter().next())
    };
    let data_source = data_source.ok_or_else(|| {
        AppError::Configuration(format!(
            "Cannot find a data source shared by tables [{}]",
            tables.join(", ")
        ))
    })?;

    let mut group = Vec::with_capacity(tables.len());
    for table in tables {
        let actual = rule
            .find_table_rule(table)
            .and_then(|table_rule| table_rule.actual_table_names(&data_source).first())
            .cloned()
            .unwrap_or_else(|| table.clone());
        group.push(RouteMapper::new(table.clone(), actual));
    }
    let mut unit = RouteUnit::new(RouteMapper::identity(data_source));
    if !group.is_empty() {
        unit.add_group(group);
    }
    let mut context = RouteContext::new();
    context.put_unit(unit);
    Ok(context)
}

/// Tables without any sharding rule go to the default data source
pub fn route_default(model: &RuleModel, tables: &[String]) -> Result<RouteContext, AppError> {
    let data_source = default_target(model)
        .ok_or_else(|| AppError::Configuration("No data source is configured".to_string()))?;
    let mut unit = RouteUnit::new(RouteMapper::identity(data_source));
    if !tables.is_empty() {
        unit.add_group(tables.iter().map(|table| RouteMapper::identity(table.clone())).collect());
    }
    let mut context = RouteContext::new();
    context.put_unit(unit);
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rule::tests::sample_model;

    #[test]
    fn test_unicast_picks_first_shared_node() {
        let model = sample_model();
        let context = route_unicast(&model, &["t_order".to_string(), "t_user".to_string()]).unwrap();
        assert!(context.is_single_routing());
        let unit = &context.route_units()[0];
        assert_eq!(unit.logic_data_source(), "ds_0");
        assert_eq!(unit.actual_tables("t_order"), vec!["t_order_0"]);
        assert_eq!(unit.actual_tables("t_user"), vec!["t_user"]);
    }

    #[test]
    fn test_default_route_without_tables() {
        let model = sample_model();
        let context = route_default(&model, &[]).unwrap();
        assert_eq!(context.route_units()[0].logic_data_source(), "ds_0");
        assert!(context.route_units()[0].table_groups().is_empty());
    }
}
