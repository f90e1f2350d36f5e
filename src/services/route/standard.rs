// Standard routing: one sharded table, or several tables of one binding group routed
// in lock-step through the aligned data node index.

use crate::api::middleware::AppError;
use crate::models::condition::ResolvedConditions;
use crate::models::route::{DataNode, RouteContext, RouteMapper, RouteUnit};
use crate::services::rule::{ShardingRule, TableRule};

/// Data nodes of one binding cluster: the routed node of the primary table and the
/// table group rendered for it
#[derive(Debug, Clone)]
pub struct ClusterRoute {
    pub node: DataNode,
    pub group: Vec<RouteMapper>,
}

/// Route `tables` (all members of one binding cluster) and return one entry per primary node.
/// For INSERT the per-row nodes are returned too.
pub fn route_cluster(
    rule: &ShardingRule,
    tables: &[String],
    conditions: &ResolvedConditions,
) -> Result<(Vec<ClusterRoute>, Vec<Vec<DataNode>>), AppError> {
    // Any binding member with conditions can drive the cluster; bindings share sharding columns
    let primary_name = tables
        .iter()
        .find(|table| !conditions.get(table).is_empty())
        .or_else(|| tables.first())
        .ok_or_else(|| AppError::Internal("standard routing without tables".to_string()))?;
    let primary = find_rule(rule, primary_name)?;

    let table_conditions = conditions.get(primary_name);
    let mut nodes: Vec<DataNode> = Vec::new();
    let mut row_nodes: Vec<Vec<DataNode>> = Vec::new();
    if table_conditions.is_empty() {
        nodes = primary.route(None)?;
    } else {
        for condition in table_conditions {
            let routed = primary.route(Some(condition))?;
            for node in &routed {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            }
            row_nodes.push(routed);
        }
    }

    let mut routes = Vec::with_capacity(nodes.len());
    for node in nodes {
        routes.push(ClusterRoute {
            group: aligned_group(rule, primary, &node, tables)?,
            node,
        });
    }
    Ok((routes, row_nodes))
}

/// Table group for `node` of `primary` plus the aligned nodes of the other cluster members
fn aligned_group(
    rule: &ShardingRule,
    primary: &TableRule,
    node: &DataNode,
    tables: &[String],
) -> Result<Vec<RouteMapper>, AppError> {
    let mut group = Vec::with_capacity(tables.len());
    for table in tables {
        if table.eq_ignore_ascii_case(&primary.logic_table) {
            group.push(RouteMapper::new(table.clone(), node.table.clone()));
            continue;
        }
        let aligned = rule.aligned_data_node(primary, node, table).ok_or_else(|| {
            AppError::Configuration(format!(
                "Binding table `{}` has no data node aligned with `{}`",
                table, node
            ))
        })?;
        group.push(RouteMapper::new(table.clone(), aligned.table));
    }
    Ok(group)
}

fn find_rule<'a>(rule: &'a ShardingRule, table: &str) -> Result<&'a TableRule, AppError> {
    rule.find_table_rule(table).ok_or_else(|| {
        AppError::Configuration(format!("Cannot find table rule for `{}`", table))
    })
}

pub fn route_standard(
    rule: &ShardingRule,
    tables: &[String],
    conditions: &ResolvedConditions,
    is_insert: bool,
) -> Result<RouteContext, AppError> {
    let (routes, row_nodes) = route_cluster(rule, tables, conditions)?;
    let mut context = RouteContext::new();
    for route in routes {
        context.put_unit(
            RouteUnit::new(RouteMapper::identity(route.node.data_source.clone()))
                .with_group(route.group),
        );
    }
    if is_insert {
        if let Some(row) = row_nodes.iter().position(|nodes| nodes.len() > 1) {
            return Err(AppError::UnsupportedConstruct(format!(
                "Insert row {} routes to {} data nodes; supply every sharding column",
                row,
                row_nodes[row].len()
            )));
        }
        context.set_original_data_nodes(row_nodes);
    }
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::condition::ShardingConditions;
    use crate::models::condition::{ConditionOperator, ConditionValue, ShardingCondition};
    use crate::models::statement::Operand;
    use crate::services::rule::tests::sample_model;
    use serde_json::json;

    fn user_id_condition(table: &str, value: i64) -> ShardingConditions {
        let mut condition = ShardingCondition::new(table);
        condition.values.push(ConditionValue::List {
            table: table.to_string(),
            column: "user_id".to_string(),
            operator: ConditionOperator::Eq,
            values: vec![Operand::Literal(json!(value))],
        });
        let mut conditions = ShardingConditions::new();
        conditions.add(condition);
        conditions
    }

    #[test]
    fn test_precise_database_match() {
        let model = sample_model();
        let conditions = user_id_condition("t_order", 3).resolve(&[]).unwrap();
        let context = route_standard(&model.sharding, &["t_order".to_string()], &conditions, false).unwrap();
        assert_eq!(context.route_units().len(), 1);
        let unit = &context.route_units()[0];
        assert_eq!(unit.logic_data_source(), "ds_1");
        assert_eq!(unit.actual_tables("t_order"), vec!["t_order_0", "t_order_1"]);
    }

    #[test]
    fn test_binding_tables_are_aligned() {
        let model = sample_model();
        let conditions = user_id_condition("t_order_item", 2).resolve(&[]).unwrap();
        let tables = vec!["t_order".to_string(), "t_order_item".to_string()];
        let context = route_standard(&model.sharding, &tables, &conditions, false).unwrap();
        let order_rule = model.sharding.find_table_rule("t_order").unwrap();
        let item_rule = model.sharding.find_table_rule("t_order_item").unwrap();
        for unit in context.route_units() {
            for group in unit.table_groups() {
                let order = DataNode::new(unit.logic_data_source(), group[0].actual_name.clone());
                let item = DataNode::new(unit.logic_data_source(), group[1].actual_name.clone());
                assert_eq!(order_rule.data_node_index(&order), item_rule.data_node_index(&item));
            }
        }
        assert_eq!(context.route_units()[0].logic_data_source(), "ds_0");
    }

    #[test]
    fn test_without_conditions_every_node_is_routed() {
        let model = sample_model();
        let context = route_standard(
            &model.sharding,
            &["t_order".to_string()],
            &ShardingConditions::new().resolve(&[]).unwrap(),
            false,
        )
        .unwrap();
        assert_eq!(context.route_units().len(), 2);
        assert!(context.route_units().iter().all(|unit| unit.table_groups().len() == 2));
    }
}
