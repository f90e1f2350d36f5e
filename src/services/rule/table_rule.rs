use std::collections::HashMap;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::condition::ResolvedCondition;
use crate::models::route::DataNode;
use crate::services::algorithm::{KeyGenerateAlgorithm, ShardingAlgorithm};

/// Sharding columns plus the algorithm that consumes their values
#[derive(Debug, Clone)]
pub struct ShardingStrategy {
    pub columns: Vec<String>,
    pub algorithm_name: String,
    pub algorithm: Arc<dyn ShardingAlgorithm>,
}

impl ShardingStrategy {
    /// Narrow `targets`; without values for the strategy's columns every target is kept
    pub fn route(
        &self,
        targets: &[String],
        condition: Option<&ResolvedCondition>,
    ) -> Result<Vec<String>, AppError> {
        let values = condition
            .map(|condition| condition.values_for(&self.columns))
            .unwrap_or_default();
        if values.is_empty() {
            return Ok(targets.to_vec());
        }
        let selected = self.algorithm.do_sharding(targets, &values)?;
        Ok(targets
            .iter()
            .filter(|target| selected.contains(target))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct KeyGenerateStrategy {
    pub column: String,
    pub algorithm: Arc<dyn KeyGenerateAlgorithm>,
}

/// A logical table, its data nodes and its strategies
#[derive(Debug, Clone)]
pub struct TableRule {
    pub logic_table: String,
    data_nodes: Vec<DataNode>,
    data_sources: Vec<String>,
    tables_by_source: HashMap<String, Vec<String>>,
    pub database_strategy: Option<ShardingStrategy>,
    pub table_strategy: Option<ShardingStrategy>,
    pub key_generate: Option<KeyGenerateStrategy>,
    pub indexes: Vec<String>,
}

impl TableRule {
    pub fn new(logic_table: impl Into<String>, data_nodes: Vec<DataNode>) -> Result<Self, AppError> {
        let logic_table = logic_table.into();
        if data_nodes.is_empty() {
            return Err(AppError::Configuration(format!(
                "Table `{}` has no data nodes",
                logic_table
            )));
        }
        let mut data_sources: Vec<String> = Vec::new();
        let mut tables_by_source: HashMap<String, Vec<String>> = HashMap::new();
        for node in &data_nodes {
            if !data_sources.contains(&node.data_source) {
                data_sources.push(node.data_source.clone());
            }
            let tables = tables_by_source.entry(node.data_source.clone()).or_default();
            if tables.contains(&node.table) {
                return Err(AppError::Configuration(format!(
                    "Duplicate data node `{}` for table `{}`",
                    node, logic_table
                )));
            }
            tables.push(node.table.clone());
        }
        Ok(Self {
            logic_table,
            data_nodes,
            data_sources,
            tables_by_source,
            database_strategy: None,
            table_strategy: None,
            key_generate: None,
            indexes: Vec::new(),
        })
    }

    pub fn data_nodes(&self) -> &[DataNode] {
        &self.data_nodes
    }

    /// Data sources in data node declaration order
    pub fn actual_data_source_names(&self) -> &[String] {
        &self.data_sources
    }

    pub fn actual_table_names(&self, data_source: &str) -> &[String] {
        self.tables_by_source
            .get(data_source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn data_node_index(&self, node: &DataNode) -> Option<usize> {
        self.data_nodes.iter().position(|each| each == node)
    }

    /// Database sharding columns followed by table sharding columns
    pub fn sharding_columns(&self) -> Vec<&str> {
        let mut result: Vec<&str> = Vec::new();
        for strategy in [&self.database_strategy, &self.table_strategy].into_iter().flatten() {
            for column in &strategy.columns {
                if !result.iter().any(|each| each.eq_ignore_ascii_case(column)) {
                    result.push(column);
                }
            }
        }
        result
    }

    pub fn is_sharding_column(&self, column: &str) -> bool {
        self.sharding_columns()
            .iter()
            .any(|each| each.eq_ignore_ascii_case(column))
    }

    pub fn generate_key_column(&self) -> Option<&str> {
        self.key_generate.as_ref().map(|strategy| strategy.column.as_str())
    }

    /// Data nodes selected by both strategies, in declaration order
    pub fn route(&self, condition: Option<&ResolvedCondition>) -> Result<Vec<DataNode>, AppError> {
        let data_sources = match &self.database_strategy {
            Some(strategy) => strategy.route(&self.data_sources, condition)?,
            None => self.data_sources.clone(),
        };
        let mut result = Vec::new();
        for data_source in data_sources {
            let candidates = self.actual_table_names(&data_source);
            let tables = match &self.table_strategy {
                Some(strategy) => strategy.route(candidates, condition)?,
                None => candidates.to_vec(),
            };
            for table in tables {
                result.push(DataNode::new(data_source.clone(), table));
            }
        }
        tracing::debug!(
            "Table {} routed to {} of {} data nodes",
            self.logic_table,
            result.len(),
            self.data_nodes.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::condition::{ShardingValue, ShardingValueKind};
    use crate::services::algorithm::{AlgorithmRegistry, Properties};
    use serde_json::json;

    fn mod_strategy(column: &str, count: &str) -> ShardingStrategy {
        let registry = AlgorithmRegistry::<dyn ShardingAlgorithm>::sharding_builtins();
        let mut props = Properties::new();
        props.insert("sharding-count".to_string(), count.to_string());
        ShardingStrategy {
            columns: vec![column.to_string()],
            algorithm_name: format!("{}_mod", column),
            algorithm: registry.create("MOD", &props).unwrap(),
        }
    }

    fn order_rule() -> TableRule {
        let nodes = ["ds_0.t_order_0", "ds_0.t_order_1", "ds_1.t_order_0", "ds_1.t_order_1"]
            .iter()
            .map(|text| DataNode::parse(text).unwrap())
            .collect();
        let mut rule = TableRule::new("t_order", nodes).unwrap();
        rule.database_strategy = Some(mod_strategy("user_id", "2"));
        rule.table_strategy = Some(mod_strategy("order_id", "2"));
        rule
    }

    fn condition(values: Vec<(&str, i64)>) -> ResolvedCondition {
        ResolvedCondition {
            values: values
                .into_iter()
                .map(|(column, value)| ShardingValue {
                    logic_table: "t_order".to_string(),
                    column: column.to_string(),
                    kind: ShardingValueKind::List(vec![json!(value)]),
                })
                .collect(),
        }
    }

    #[test]
    fn test_route_precise() {
        let rule = order_rule();
        let nodes = rule
            .route(Some(&condition(vec![("user_id", 3), ("order_id", 4)])))
            .unwrap();
        assert_eq!(nodes, vec![DataNode::new("ds_1", "t_order_0")]);
    }

    #[test]
    fn test_route_without_conditions_keeps_declaration_order() {
        let rule = order_rule();
        let nodes = rule.route(None).unwrap();
        assert_eq!(nodes, rule.data_nodes().to_vec());

        let nodes = rule.route(Some(&condition(vec![("order_id", 1)]))).unwrap();
        assert_eq!(
            nodes,
            vec![
                DataNode::new("ds_0", "t_order_1"),
                DataNode::new("ds_1", "t_order_1")
            ]
        );
    }

    #[test]
    fn test_sharding_columns() {
        let rule = order_rule();
        assert_eq!(rule.sharding_columns(), vec!["user_id", "order_id"]);
        assert!(rule.is_sharding_column("USER_ID"));
        assert!(!rule.is_sharding_column("status"));
        assert_eq!(rule.actual_data_source_names(), ["ds_0", "ds_1"]);
        assert_eq!(rule.actual_table_names("ds_1"), ["t_order_0", "t_order_1"]);
    }

    #[test]
    fn test_duplicate_data_node() {
        let nodes = vec![DataNode::new("ds_0", "t_a"), DataNode::new("ds_0", "t_a")];
        assert!(TableRule::new("t_a", nodes).is_err());
        assert!(TableRule::new("t_a", Vec::new()).is_err());
    }
}
