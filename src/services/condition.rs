// Sharding Condition Service
//
// Extracts, per logical table, the values compared against sharding columns. INSERT
// statements contribute one condition per row; SELECT/UPDATE/DELETE contribute the
// `=`, `IN` and `BETWEEN` terms of the top-level AND chain of their WHERE clause.

use serde_json::Value;
use std::collections::HashMap;

use crate::models::condition::{ConditionOperator, ConditionValue, ShardingCondition, ShardingConditions};
use crate::models::statement::{
    BinaryOperator, BoundStatement, ColumnSegment, Expr, InsertStatement, Operand, Statement,
    TableResolver, TableSegment,
};
use crate::services::rule::ShardingRule;

/// Keys generated for an INSERT that omits its key column, one per row
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKeyContext {
    pub logic_table: String,
    pub column: String,
    pub values: Vec<Value>,
}

impl GeneratedKeyContext {
    /// Generate keys before routing so they take part in the sharding conditions
    pub fn generate(statement: &BoundStatement, rule: &ShardingRule) -> Option<Self> {
        let Statement::Insert(insert) = &statement.statement else {
            return None;
        };
        let table_rule = rule.find_table_rule(insert.table.logic_name())?;
        let strategy = table_rule.key_generate.as_ref()?;
        if insert.contains_column(&strategy.column) {
            return None;
        }
        if insert.columns.is_none() && insert.set_assignments.is_none() {
            return None;
        }
        let values: Vec<Value> = (0..insert.row_count())
            .map(|_| strategy.algorithm.generate_key())
            .collect();
        tracing::debug!(
            "Generated {} key(s) for {}.{}",
            values.len(),
            table_rule.logic_table,
            strategy.column
        );
        Some(Self {
            logic_table: table_rule.logic_table.clone(),
            column: strategy.column.clone(),
            values,
        })
    }

    pub fn value(&self, row: usize) -> Option<&Value> {
        self.values.get(row)
    }
}

pub struct ShardingConditionEngine<'a> {
    rule: &'a ShardingRule,
}

impl<'a> ShardingConditionEngine<'a> {
    pub fn new(rule: &'a ShardingRule) -> Self {
        Self { rule }
    }

    pub fn extract(
        &self,
        statement: &BoundStatement,
        generated_keys: Option<&GeneratedKeyContext>,
    ) -> ShardingConditions {
        let conditions = match &statement.statement {
            Statement::Insert(insert) => self.extract_insert(insert, generated_keys),
            Statement::Select(select) => {
                let mut predicates: Vec<&Expr> = Vec::new();
                if let Some(where_clause) = &select.where_clause {
                    predicates.extend(where_clause.expr.and_predicates());
                }
                for condition in &select.join_conditions {
                    predicates.extend(condition.and_predicates());
                }
                self.extract_predicates(&select.from, &predicates)
            }
            Statement::Update(update) => {
                let predicates = update
                    .where_clause
                    .as_ref()
                    .map(|where_clause| where_clause.expr.and_predicates())
                    .unwrap_or_default();
                self.extract_predicates(&update.tables, &predicates)
            }
            Statement::Delete(delete) => {
                let predicates = delete
                    .where_clause
                    .as_ref()
                    .map(|where_clause| where_clause.expr.and_predicates())
                    .unwrap_or_default();
                self.extract_predicates(&delete.tables, &predicates)
            }
            Statement::Ddl(_) | Statement::Dal(_) | Statement::Dcl(_) | Statement::Tcl(_) => {
                ShardingConditions::new()
            }
        };
        tracing::debug!(
            "Extracted sharding conditions for {} statement: {}",
            statement.statement.type_name(),
            if conditions.is_empty() { "none" } else { "present" }
        );
        conditions
    }

    fn extract_insert(
        &self,
        insert: &InsertStatement,
        generated_keys: Option<&GeneratedKeyContext>,
    ) -> ShardingConditions {
        let mut result = ShardingConditions::new();
        let Some(table_rule) = self.rule.find_table_rule(insert.table.logic_name()) else {
            return result;
        };
        for row in 0..insert.row_count() {
            let mut condition = ShardingCondition::new(table_rule.logic_table.clone());
            condition.insert_row = Some(row);
            for column in table_rule.sharding_columns() {
                let generated = generated_keys
                    .filter(|keys| keys.column.eq_ignore_ascii_case(column))
                    .and_then(|keys| keys.value(row))
                    .map(|value| Operand::Literal(value.clone()));
                let operand = generated.or_else(|| {
                    insert
                        .row_value(row, column)
                        .and_then(Expr::as_operand)
                });
                if let Some(operand) = operand {
                    condition.values.push(ConditionValue::List {
                        table: table_rule.logic_table.clone(),
                        column: column.to_string(),
                        operator: ConditionOperator::Insert,
                        values: vec![operand],
                    });
                }
            }
            result.add(condition);
        }
        result
    }

    fn extract_predicates(&self, tables: &[TableSegment], predicates: &[&Expr]) -> ShardingConditions {
        let resolver = TableResolver::new(tables);
        let mut by_table: HashMap<String, Vec<ConditionValue>> = HashMap::new();
        let mut join_pairs: Vec<((String, String), (String, String))> = Vec::new();

        for predicate in predicates {
            match predicate {
                Expr::Binary {
                    left,
                    op: BinaryOperator::Eq,
                    right,
                    ..
                } => {
                    if let (Some(a), Some(b)) = (left.as_column(), right.as_column()) {
                        for first in self.sharding_targets(&resolver, a) {
                            for second in self.sharding_targets(&resolver, b) {
                                if first.0 != second.0 {
                                    join_pairs.push((first.clone(), second));
                                }
                            }
                        }
                        continue;
                    }
                    let pair = match (left.as_column(), right.as_operand()) {
                        (Some(column), Some(operand)) => Some((column, operand)),
                        _ => right.as_column().zip(left.as_operand()),
                    };
                    if let Some((column, operand)) = pair {
                        self.push_list(&resolver, &mut by_table, column, ConditionOperator::Eq, vec![operand]);
                    }
                }
                Expr::In {
                    expr,
                    list,
                    negated: false,
                    ..
                } => {
                    let Some(column) = expr.as_column() else {
                        continue;
                    };
                    let operands: Option<Vec<Operand>> = list.iter().map(Expr::as_operand).collect();
                    if let Some(operands) = operands {
                        self.push_list(&resolver, &mut by_table, column, ConditionOperator::In, operands);
                    }
                }
                Expr::Between {
                    expr,
                    low,
                    high,
                    negated: false,
                    ..
                } => {
                    let (Some(column), Some(lower), Some(upper)) =
                        (expr.as_column(), low.as_operand(), high.as_operand())
                    else {
                        continue;
                    };
                    for (table, column) in self.sharding_targets(&resolver, column) {
                        by_table.entry(table.clone()).or_default().push(ConditionValue::Range {
                            table,
                            column,
                            lower: lower.clone(),
                            upper: upper.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        // Join equality between sharding columns shares value constraints across tables
        let mut propagated: Vec<ConditionValue> = Vec::new();
        for ((left_table, left_column), (right_table, right_column)) in &join_pairs {
            for (from_table, from_column, to_table, to_column) in [
                (left_table, left_column, right_table, right_column),
                (right_table, right_column, left_table, left_column),
            ] {
                if let Some(values) = by_table.get(from_table) {
                    propagated.extend(
                        values
                            .iter()
                            .filter(|value| value.column().eq_ignore_ascii_case(from_column))
                            .map(|value| value.retarget(to_table, to_column)),
                    );
                }
            }
        }
        for value in propagated {
            by_table.entry(value.table().to_string()).or_default().push(value);
        }

        let mut result = ShardingConditions::new();
        for table in resolver.table_names() {
            if let Some(values) = by_table.remove(table) {
                let mut condition = ShardingCondition::new(table.clone());
                condition.values = values;
                result.add(condition);
            }
        }
        result
    }

    /// (table, column) pairs a column reference constrains; only sharding columns count
    fn sharding_targets(&self, resolver: &TableResolver, column: &ColumnSegment) -> Vec<(String, String)> {
        resolver
            .candidates(column)
            .into_iter()
            .filter(|table| self.rule.is_sharding_column(table, &column.name.value))
            .map(|table| (table.to_string(), column.name.value.clone()))
            .collect()
    }

    fn push_list(
        &self,
        resolver: &TableResolver,
        by_table: &mut HashMap<String, Vec<ConditionValue>>,
        column: &ColumnSegment,
        operator: ConditionOperator,
        values: Vec<Operand>,
    ) {
        for (table, column) in self.sharding_targets(resolver, column) {
            by_table.entry(table.clone()).or_default().push(ConditionValue::List {
                table,
                column,
                operator,
                values: values.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::bind;
    use crate::models::condition::ShardingValueKind;
    use crate::services::rule::tests::sample_model;
    use serde_json::json;

    fn extract(sql: &str, params: &[Value]) -> crate::models::condition::ResolvedConditions {
        let model = sample_model();
        let bound = bind(sql).unwrap();
        let keys = GeneratedKeyContext::generate(&bound, &model.sharding);
        ShardingConditionEngine::new(&model.sharding)
            .extract(&bound, keys.as_ref())
            .resolve(params)
            .unwrap()
    }

    #[test]
    fn test_where_equality_and_in() {
        let resolved = extract(
            "SELECT * FROM t_order WHERE user_id = ? AND order_id IN (1, 2) AND status = 'x'",
            &[json!(7)],
        );
        let condition = &resolved.get("t_order")[0];
        assert_eq!(condition.values.len(), 2);
        assert_eq!(condition.values[0].kind, ShardingValueKind::List(vec![json!(7)]));
        assert_eq!(condition.values[1].kind, ShardingValueKind::List(vec![json!(1), json!(2)]));
    }

    #[test]
    fn test_or_and_negation_are_ignored() {
        let resolved = extract("SELECT * FROM t_order WHERE user_id = 1 OR user_id = 2", &[]);
        assert!(resolved.get("t_order").is_empty());
        let resolved = extract("SELECT * FROM t_order WHERE user_id NOT IN (1, 2)", &[]);
        assert!(resolved.get("t_order").is_empty());
    }

    #[test]
    fn test_between_becomes_range() {
        let resolved = extract("DELETE FROM t_order WHERE order_id BETWEEN 1 AND 5", &[]);
        assert_eq!(
            resolved.get("t_order")[0].values[0].kind,
            ShardingValueKind::Range {
                lower: json!(1),
                upper: json!(5)
            }
        );
    }

    #[test]
    fn test_contradiction_is_always_false() {
        let resolved = extract("SELECT * FROM t_order WHERE user_id = 1 AND user_id = 2", &[]);
        assert!(resolved.is_always_false());
    }

    #[test]
    fn test_join_equality_propagates_values() {
        let resolved = extract(
            "SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id WHERE o.order_id = 10",
            &[],
        );
        let item = &resolved.get("t_order_item")[0];
        assert_eq!(item.values[0].column, "order_id");
        assert_eq!(item.values[0].kind, ShardingValueKind::List(vec![json!(10)]));
    }

    #[test]
    fn test_insert_rows_and_generated_keys() {
        let resolved = extract(
            "INSERT INTO t_order (user_id, status) VALUES (?, 'a'), (2, 'b')",
            &[json!(1)],
        );
        let rows = resolved.get("t_order");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0].column, "user_id");
        assert_eq!(rows[0].values[0].kind, ShardingValueKind::List(vec![json!(1)]));
        // order_id comes from the snowflake generator
        assert_eq!(rows[1].values.len(), 2);
        assert_eq!(rows[1].values[1].column, "order_id");
    }

    #[test]
    fn test_keys_are_not_generated_when_supplied() {
        let model = sample_model();
        let bound = bind("INSERT INTO t_order (order_id, user_id) VALUES (1, 2)").unwrap();
        assert!(GeneratedKeyContext::generate(&bound, &model.sharding).is_none());
    }
}
