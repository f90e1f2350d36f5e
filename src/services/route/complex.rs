// Complex routing: several sharded tables that are not all bound together. Each binding
// cluster is routed on its own, then clusters are combined per shared data source.

use super::standard::{route_cluster, ClusterRoute};
use crate::api::middleware::AppError;
use crate::models::condition::ResolvedConditions;
use crate::models::route::{RouteContext, RouteMapper, RouteUnit};
use crate::services::rule::ShardingRule;

/// Split tables into binding clusters, keeping first-seen order
fn clusters(rule: &ShardingRule, tables: &[String]) -> Vec<Vec<String>> {
    let mut result: Vec<Vec<String>> = Vec::new();
    for table in tables {
        if result.iter().flatten().any(|seen| seen.eq_ignore_ascii_case(table)) {
            continue;
        }
        let mut cluster = vec![table.clone()];
        cluster.extend(rule.binding_partners(table, tables));
        result.push(cluster);
    }
    result
}

pub fn route_complex(
    rule: &ShardingRule,
    tables: &[String],
    conditions: &ResolvedConditions,
) -> Result<RouteContext, AppError> {
    let mut routed: Vec<Vec<ClusterRoute>> = Vec::new();
    for cluster in clusters(rule, tables) {
        routed.push(route_cluster(rule, &cluster, conditions)?.0);
    }

    let mut data_sources: Vec<String> = Vec::new();
    if let Some((first, rest)) = routed.split_first() {
        for route in first {
            let data_source = &route.node.data_source;
            let shared = rest
                .iter()
                .all(|other| other.iter().any(|each| &each.node.data_source == data_source));
            if shared && !data_sources.contains(data_source) {
                data_sources.push(data_source.clone());
            }
        }
    }
    if data_sources.is_empty() && routed.iter().all(|routes| !routes.is_empty()) {
        return Err(AppError::UnsupportedConstruct(format!(
            "Tables {} do not share a data source; cross data source joins are not supported",
            tables.join(", ")
        )));
    }

    let mut context = RouteContext::new();
    for data_source in data_sources {
        // Cartesian product of the per-cluster groups local to this data source
        let mut combined: Vec<Vec<RouteMapper>> = vec![Vec::new()];
        for routes in &routed {
            let local: Vec<&Vec<RouteMapper>> = routes
                .iter()
                .filter(|route| route.node.data_source == data_source)
                .map(|route| &route.group)
                .collect();
            combined = combined
                .iter()
                .flat_map(|prefix| {
                    local.iter().map(move |group| {
                        let mut next = prefix.clone();
                        next.extend(group.iter().cloned());
                        next
                    })
                })
                .collect();
        }
        let mut unit = RouteUnit::new(RouteMapper::identity(data_source));
        for group in combined {
            unit.add_group(group);
        }
        context.put_unit(unit);
    }
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::condition::{ConditionOperator, ConditionValue, ShardingCondition, ShardingConditions};
    use crate::models::statement::Operand;
    use crate::services::rule::tests::sample_model;
    use serde_json::json;

    #[test]
    fn test_cartesian_within_shared_data_source() {
        let model = sample_model();
        let mut condition = ShardingCondition::new("t_order");
        condition.values.push(ConditionValue::List {
            table: "t_order".to_string(),
            column: "user_id".to_string(),
            operator: ConditionOperator::Eq,
            values: vec![Operand::Literal(json!(1))],
        });
        let mut conditions = ShardingConditions::new();
        conditions.add(condition);
        let resolved = conditions.resolve(&[]).unwrap();

        let tables = vec!["t_order".to_string(), "t_user".to_string()];
        let context = route_complex(&model.sharding, &tables, &resolved).unwrap();
        assert_eq!(context.route_units().len(), 1);
        let unit = &context.route_units()[0];
        assert_eq!(unit.logic_data_source(), "ds_1");
        // two t_order tables on ds_1 times the single t_user table
        assert_eq!(unit.table_groups().len(), 2);
        assert!(unit.table_groups().iter().all(|group| group.len() == 2));
    }

    #[test]
    fn test_binding_members_form_one_cluster() {
        let model = sample_model();
        let tables = vec![
            "t_order".to_string(),
            "t_user".to_string(),
            "t_order_item".to_string(),
        ];
        let groups = clusters(&model.sharding, &tables);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec!["t_order".to_string(), "t_order_item".to_string()]);
    }
}
