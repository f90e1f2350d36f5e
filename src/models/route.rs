use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::middleware::AppError;

/// Physical storage location `dataSource.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataNode {
    pub data_source: String,
    pub table: String,
}

impl DataNode {
    pub fn new(data_source: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            table: table.into(),
        }
    }

    /// Parse `ds.table`; exactly one separator is accepted
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let trimmed = text.trim();
        let mut parts = trimmed.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(data_source), Some(table), None)
                if !data_source.is_empty() && !table.is_empty() =>
            {
                Ok(Self::new(data_source, table))
            }
            _ => Err(AppError::Configuration(format!(
                "Invalid data node format `{}`, expected `dataSource.table`",
                trimmed
            ))),
        }
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_source, self.table)
    }
}

/// Logical name paired with the physical name it routes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteMapper {
    pub logic_name: String,
    pub actual_name: String,
}

impl RouteMapper {
    pub fn new(logic_name: impl Into<String>, actual_name: impl Into<String>) -> Self {
        Self {
            logic_name: logic_name.into(),
            actual_name: actual_name.into(),
        }
    }

    /// Mapper whose actual name equals the logical one
    pub fn identity(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), name)
    }
}

/// One physical data source target and the table groups rendered against it.
///
/// Each table group is one consistent logical-to-actual table assignment; the
/// rewriter produces one SQL per group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUnit {
    pub data_source_mapper: RouteMapper,
    table_groups: Vec<Vec<RouteMapper>>,
}

impl RouteUnit {
    pub fn new(data_source_mapper: RouteMapper) -> Self {
        Self {
            data_source_mapper,
            table_groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: Vec<RouteMapper>) -> Self {
        self.add_group(group);
        self
    }

    /// Add a table group unless an identical one is already present
    pub fn add_group(&mut self, group: Vec<RouteMapper>) {
        if !self.table_groups.contains(&group) {
            self.table_groups.push(group);
        }
    }

    pub fn table_groups(&self) -> &[Vec<RouteMapper>] {
        &self.table_groups
    }

    /// Distinct table mappers across all groups
    pub fn table_mappers(&self) -> Vec<&RouteMapper> {
        let mut result: Vec<&RouteMapper> = Vec::new();
        for mapper in self.table_groups.iter().flatten() {
            if !result.contains(&mapper) {
                result.push(mapper);
            }
        }
        result
    }

    /// Actual table names mapped from `logic_table`
    pub fn actual_tables(&self, logic_table: &str) -> Vec<&str> {
        let mut result: Vec<&str> = Vec::new();
        for mapper in self.table_mappers() {
            if mapper.logic_name.eq_ignore_ascii_case(logic_table)
                && !result.contains(&mapper.actual_name.as_str())
            {
                result.push(&mapper.actual_name);
            }
        }
        result
    }

    pub fn logic_data_source(&self) -> &str {
        &self.data_source_mapper.logic_name
    }

    pub fn actual_data_source(&self) -> &str {
        &self.data_source_mapper.actual_name
    }

    fn merge(&mut self, other: RouteUnit) {
        for group in other.table_groups {
            self.add_group(group);
        }
    }
}

/// Look up the actual name of `logic_table` inside one table group
pub fn find_actual_table<'a>(group: &'a [RouteMapper], logic_table: &str) -> Option<&'a str> {
    group
        .iter()
        .find(|mapper| mapper.logic_name.eq_ignore_ascii_case(logic_table))
        .map(|mapper| mapper.actual_name.as_str())
}

/// Routing result: the set of route units plus the data nodes of each inserted row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteContext {
    route_units: Vec<RouteUnit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    original_data_nodes: Vec<Vec<DataNode>>,
}

impl RouteContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit, merging table groups into an existing unit with the same data source mapper
    pub fn put_unit(&mut self, unit: RouteUnit) {
        match self
            .route_units
            .iter_mut()
            .find(|existing| existing.data_source_mapper == unit.data_source_mapper)
        {
            Some(existing) => existing.merge(unit),
            None => self.route_units.push(unit),
        }
    }

    pub fn route_units(&self) -> &[RouteUnit] {
        &self.route_units
    }

    pub fn route_units_mut(&mut self) -> &mut [RouteUnit] {
        &mut self.route_units
    }

    pub fn find_unit(&self, logic_data_source: &str) -> Option<&RouteUnit> {
        self.route_units
            .iter()
            .find(|unit| unit.logic_data_source() == logic_data_source)
    }

    pub fn is_empty(&self) -> bool {
        self.route_units.is_empty()
    }

    /// Exactly one data source and at most one table group
    pub fn is_single_routing(&self) -> bool {
        self.route_units.len() == 1 && self.route_units[0].table_groups.len() <= 1
    }

    /// Whether any table was mapped to a different physical name
    pub fn contains_table_sharding(&self) -> bool {
        self.route_units
            .iter()
            .flat_map(|unit| unit.table_mappers())
            .any(|mapper| mapper.logic_name != mapper.actual_name)
    }

    pub fn actual_data_source_names(&self) -> Vec<&str> {
        let mut result: Vec<&str> = Vec::new();
        for unit in &self.route_units {
            if !result.contains(&unit.actual_data_source()) {
                result.push(unit.actual_data_source());
            }
        }
        result
    }

    pub fn set_original_data_nodes(&mut self, nodes: Vec<Vec<DataNode>>) {
        self.original_data_nodes = nodes;
    }

    /// Data nodes of each inserted row, indexed by row
    pub fn original_data_nodes(&self) -> &[Vec<DataNode>] {
        &self.original_data_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_node_parse() {
        let node = DataNode::parse(" ds_0.t_order_1 ").unwrap();
        assert_eq!(node, DataNode::new("ds_0", "t_order_1"));
        assert_eq!(node.to_string(), "ds_0.t_order_1");

        assert!(DataNode::parse("t_order").is_err());
        assert!(DataNode::parse("a.b.c").is_err());
        assert!(DataNode::parse(".t_order").is_err());
    }

    #[test]
    fn test_put_unit_merges_same_data_source() {
        let mut context = RouteContext::new();
        context.put_unit(
            RouteUnit::new(RouteMapper::identity("ds_0"))
                .with_group(vec![RouteMapper::new("t_order", "t_order_0")]),
        );
        context.put_unit(
            RouteUnit::new(RouteMapper::identity("ds_0"))
                .with_group(vec![RouteMapper::new("t_order", "t_order_1")]),
        );
        context.put_unit(
            RouteUnit::new(RouteMapper::identity("ds_0"))
                .with_group(vec![RouteMapper::new("t_order", "t_order_1")]),
        );

        assert_eq!(context.route_units().len(), 1);
        let unit = &context.route_units()[0];
        assert_eq!(unit.table_groups().len(), 2);
        assert_eq!(unit.actual_tables("T_ORDER"), vec!["t_order_0", "t_order_1"]);
        assert!(!context.is_single_routing());
        assert!(context.contains_table_sharding());
    }

    #[test]
    fn test_single_routing_without_table_sharding() {
        let mut context = RouteContext::new();
        context.put_unit(
            RouteUnit::new(RouteMapper::identity("ds_1"))
                .with_group(vec![RouteMapper::identity("t_config")]),
        );
        assert!(context.is_single_routing());
        assert!(!context.contains_table_sharding());
        assert_eq!(context.actual_data_source_names(), vec!["ds_1"]);
    }

    #[test]
    fn test_find_actual_table_in_group() {
        let group = vec![
            RouteMapper::new("t_order", "t_order_1"),
            RouteMapper::new("t_order_item", "t_order_item_1"),
        ];
        assert_eq!(find_actual_table(&group, "t_order_item"), Some("t_order_item_1"));
        assert_eq!(find_actual_table(&group, "t_user"), None);
    }
}
