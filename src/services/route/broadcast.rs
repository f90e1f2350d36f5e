// Broadcast routing: every data source, every data node of a table, or one data source
// per database instance.

use crate::api::middleware::AppError;
use crate::models::route::{RouteContext, RouteMapper, RouteUnit};
use crate::services::rule::RuleModel;

fn identity_group(tables: &[String]) -> Vec<RouteMapper> {
    tables.iter().map(|table| RouteMapper::identity(table.clone())).collect()
}

/// Every logical data source, tables unchanged
pub fn route_database_broadcast(model: &RuleModel, tables: &[String]) -> RouteContext {
    let mut context = RouteContext::new();
    for data_source in model.logic_data_source_names() {
        let mut unit = RouteUnit::new(RouteMapper::identity(data_source));
        if !tables.is_empty() {
            unit.add_group(identity_group(tables));
        }
        context.put_unit(unit);
    }
    context
}

/// Every data node of every sharded table in `tables`; binding partners follow the
/// aligned node and other tables keep their names
pub fn route_table_broadcast(model: &RuleModel, tables: &[String]) -> Result<RouteContext, AppError> {
    let rule = &model.sharding;
    let sharded = rule.sharding_logic_tables(tables);
    let plain: Vec<String> = tables
        .iter()
        .filter(|table| !rule.is_sharding_table(table))
        .cloned()
        .collect();

    let mut context = RouteContext::new();
    let mut covered: Vec<String> = Vec::new();
    for table in &sharded {
        if covered.iter().any(|name| name.eq_ignore_ascii_case(table)) {
            continue;
        }
        let Some(table_rule) = rule.find_table_rule(table) else {
            continue;
        };
        let partners = rule.binding_partners(table, &sharded);
        covered.push(table.clone());
        covered.extend(partners.iter().cloned());

        for node in table_rule.data_nodes() {
            let mut group = vec![RouteMapper::new(table.clone(), node.table.clone())];
            for partner in &partners {
                let aligned = rule.aligned_data_node(table_rule, node, partner).ok_or_else(|| {
                    AppError::Configuration(format!(
                        "Binding table `{}` has no data node aligned with `{}`",
                        partner, node
                    ))
                })?;
                group.push(RouteMapper::new(partner.clone(), aligned.table));
            }
            group.extend(identity_group(&plain));
            context.put_unit(
                RouteUnit::new(RouteMapper::identity(node.data_source.clone())).with_group(group),
            );
        }
    }
    Ok(context)
}

/// One data source per distinct instance, first in name order
pub fn route_instance_broadcast(model: &RuleModel) -> RouteContext {
    let mut context = RouteContext::new();
    let mut instances: Vec<&str> = Vec::new();
    for data_source in model.logic_data_source_names() {
        if let Some(instance) = model.instance_of(&data_source) {
            if instances.contains(&instance) {
                continue;
            }
            instances.push(instance);
        }
        context.put_unit(RouteUnit::new(RouteMapper::identity(data_source)));
    }
    context
}
