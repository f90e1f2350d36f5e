use std::collections::HashMap;

use super::table_rule::TableRule;
use crate::api::middleware::AppError;
use crate::models::route::DataNode;

/// Sharded tables, binding groups and broadcast tables. Names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ShardingRule {
    tables: HashMap<String, TableRule>,
    logic_tables: Vec<String>,
    binding_groups: Vec<Vec<String>>,
    broadcast_tables: Vec<String>,
    default_data_source: Option<String>,
}

impl ShardingRule {
    pub fn new(
        table_rules: Vec<TableRule>,
        binding_groups: Vec<Vec<String>>,
        broadcast_tables: Vec<String>,
        default_data_source: Option<String>,
    ) -> Result<Self, AppError> {
        let mut tables = HashMap::with_capacity(table_rules.len());
        let mut logic_tables = Vec::with_capacity(table_rules.len());
        for rule in table_rules {
            let key = rule.logic_table.to_ascii_lowercase();
            logic_tables.push(key.clone());
            tables.insert(key, rule);
        }

        let binding_groups: Vec<Vec<String>> = binding_groups
            .into_iter()
            .map(|group| group.iter().map(|name| name.to_ascii_lowercase()).collect())
            .collect();
        let rule = Self {
            tables,
            logic_tables,
            binding_groups,
            broadcast_tables: broadcast_tables
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            default_data_source,
        };
        rule.check_binding_groups()?;
        Ok(rule)
    }

    /// Every binding table must exist and share the node layout of the group's first table
    fn check_binding_groups(&self) -> Result<(), AppError> {
        for group in &self.binding_groups {
            let mut rules = Vec::with_capacity(group.len());
            for name in group {
                let rule = self.find_table_rule(name).ok_or_else(|| {
                    AppError::Configuration(format!(
                        "Binding table `{}` has no sharding table rule",
                        name
                    ))
                })?;
                rules.push(rule);
            }
            if let Some((first, rest)) = rules.split_first() {
                for other in rest {
                    let aligned = first.data_nodes().len() == other.data_nodes().len()
                        && first
                            .data_nodes()
                            .iter()
                            .zip(other.data_nodes())
                            .all(|(a, b)| a.data_source == b.data_source);
                    if !aligned {
                        return Err(AppError::Configuration(format!(
                            "Binding tables `{}` and `{}` have misaligned data nodes",
                            first.logic_table, other.logic_table
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn find_table_rule(&self, logic_table: &str) -> Option<&TableRule> {
        self.tables.get(&logic_table.to_ascii_lowercase())
    }

    /// Table rules in configuration order
    pub fn table_rules(&self) -> impl Iterator<Item = &TableRule> {
        self.logic_tables
            .iter()
            .filter_map(|name| self.tables.get(name))
    }

    pub fn is_sharding_table(&self, logic_table: &str) -> bool {
        self.tables.contains_key(&logic_table.to_ascii_lowercase())
    }

    pub fn is_broadcast_table(&self, logic_table: &str) -> bool {
        self.broadcast_tables
            .iter()
            .any(|name| name.eq_ignore_ascii_case(logic_table))
    }

    pub fn is_all_broadcast_tables(&self, logic_tables: &[String]) -> bool {
        !logic_tables.is_empty() && logic_tables.iter().all(|name| self.is_broadcast_table(name))
    }

    /// The subset of `logic_tables` that have a sharding rule, input order
    pub fn sharding_logic_tables(&self, logic_tables: &[String]) -> Vec<String> {
        logic_tables
            .iter()
            .filter(|name| self.is_sharding_table(name))
            .cloned()
            .collect()
    }

    fn binding_group(&self, logic_table: &str) -> Option<&Vec<String>> {
        let key = logic_table.to_ascii_lowercase();
        self.binding_groups.iter().find(|group| group.contains(&key))
    }

    /// All tables are sharded and belong to one binding group
    pub fn is_all_binding_tables(&self, logic_tables: &[String]) -> bool {
        match logic_tables.first() {
            None => false,
            Some(first) => match self.binding_group(first) {
                Some(group) => logic_tables
                    .iter()
                    .all(|name| group.contains(&name.to_ascii_lowercase())),
                None => false,
            },
        }
    }

    /// Members of `logic_table`'s binding group among `candidates`, excluding itself
    pub fn binding_partners(&self, logic_table: &str, candidates: &[String]) -> Vec<String> {
        let Some(group) = self.binding_group(logic_table) else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|name| !name.eq_ignore_ascii_case(logic_table))
            .filter(|name| group.contains(&name.to_ascii_lowercase()))
            .cloned()
            .collect()
    }

    /// Node of `other_table` at the same position as `node` in `primary`'s node list
    pub fn aligned_data_node(
        &self,
        primary: &TableRule,
        node: &DataNode,
        other_table: &str,
    ) -> Option<DataNode> {
        let index = primary.data_node_index(node)?;
        self.find_table_rule(other_table)?
            .data_nodes()
            .get(index)
            .cloned()
    }

    /// Reverse lookup of a declared index name to its logical table
    pub fn find_table_by_index(&self, index_name: &str) -> Option<&str> {
        self.table_rules()
            .find(|rule| rule.indexes.iter().any(|index| index.eq_ignore_ascii_case(index_name)))
            .map(|rule| rule.logic_table.as_str())
    }

    pub fn is_sharding_column(&self, logic_table: &str, column: &str) -> bool {
        self.find_table_rule(logic_table)
            .is_some_and(|rule| rule.is_sharding_column(column))
    }

    pub fn default_data_source(&self) -> Option<&str> {
        self.default_data_source.as_deref()
    }

    pub fn binding_groups(&self) -> &[Vec<String>] {
        &self.binding_groups
    }

    pub fn broadcast_tables(&self) -> &[String] {
        &self.broadcast_tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, nodes: &[&str]) -> TableRule {
        let nodes = nodes.iter().map(|text| DataNode::parse(text).unwrap()).collect();
        TableRule::new(name, nodes).unwrap()
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn sharding_rule() -> ShardingRule {
        let mut order = rule("t_order", &["ds_0.t_order_0", "ds_0.t_order_1", "ds_1.t_order_0", "ds_1.t_order_1"]);
        order.indexes = names(&["idx_user"]);
        ShardingRule::new(
            vec![
                order,
                rule("t_order_item", &[
                    "ds_0.t_order_item_0",
                    "ds_0.t_order_item_1",
                    "ds_1.t_order_item_0",
                    "ds_1.t_order_item_1",
                ]),
                rule("t_user", &["ds_0.t_user", "ds_1.t_user"]),
            ],
            vec![names(&["t_order", "T_ORDER_ITEM"])],
            names(&["t_config"]),
            Some("ds_0".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_binding_alignment() {
        let rule = sharding_rule();
        let order = rule.find_table_rule("T_Order").unwrap();
        let aligned = rule
            .aligned_data_node(order, &DataNode::new("ds_1", "t_order_1"), "t_order_item")
            .unwrap();
        assert_eq!(aligned, DataNode::new("ds_1", "t_order_item_1"));

        assert!(rule.is_all_binding_tables(&names(&["t_order_item", "t_order"])));
        assert!(!rule.is_all_binding_tables(&names(&["t_order", "t_user"])));
        assert_eq!(
            rule.binding_partners("t_order", &names(&["t_order", "t_order_item", "t_user"])),
            names(&["t_order_item"])
        );
    }

    #[test]
    fn test_misaligned_binding_group() {
        let result = ShardingRule::new(
            vec![
                rule("t_order", &["ds_0.t_order_0", "ds_1.t_order_0"]),
                rule("t_user", &["ds_0.t_user"]),
            ],
            vec![names(&["t_order", "t_user"])],
            Vec::new(),
            None,
        );
        assert!(matches!(result, Err(AppError::Configuration(_))));

        let result = ShardingRule::new(Vec::new(), vec![names(&["t_x"])], Vec::new(), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_lookups() {
        let rule = sharding_rule();
        assert!(rule.is_sharding_table("T_USER"));
        assert!(rule.is_broadcast_table("t_config"));
        assert!(rule.is_all_broadcast_tables(&names(&["t_config"])));
        assert!(!rule.is_all_broadcast_tables(&[]));
        assert_eq!(
            rule.sharding_logic_tables(&names(&["t_config", "t_order"])),
            names(&["t_order"])
        );
        assert_eq!(rule.find_table_by_index("IDX_USER"), Some("t_order"));
        assert_eq!(rule.default_data_source(), Some("ds_0"));
        let order: Vec<&str> = rule.table_rules().map(|r| r.logic_table.as_str()).collect();
        assert_eq!(order, vec!["t_order", "t_order_item", "t_user"]);
    }
}
