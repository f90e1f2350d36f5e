// Sharding condition model
//
// Conditions are extracted once per statement and hold operands rather than values, so
// parameter markers are resolved against the parameter list only at routing time.

use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::api::middleware::AppError;
use crate::models::statement::Operand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConditionOperator {
    Eq,
    In,
    Between,
    /// Value taken from an INSERT row
    Insert,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConditionValue {
    List {
        table: String,
        column: String,
        operator: ConditionOperator,
        values: Vec<Operand>,
    },
    Range {
        table: String,
        column: String,
        lower: Operand,
        upper: Operand,
    },
}

impl ConditionValue {
    pub fn table(&self) -> &str {
        match self {
            ConditionValue::List { table, .. } | ConditionValue::Range { table, .. } => table,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            ConditionValue::List { column, .. } | ConditionValue::Range { column, .. } => column,
        }
    }

    /// Same constraint re-targeted at another table column (join equality propagation)
    pub fn retarget(&self, table: &str, column: &str) -> ConditionValue {
        match self {
            ConditionValue::List {
                operator, values, ..
            } => ConditionValue::List {
                table: table.to_string(),
                column: column.to_string(),
                operator: *operator,
                values: values.clone(),
            },
            ConditionValue::Range { lower, upper, .. } => ConditionValue::Range {
                table: table.to_string(),
                column: column.to_string(),
                lower: lower.clone(),
                upper: upper.clone(),
            },
        }
    }
}

/// Constraints on one logical table; for INSERT there is one condition per row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingCondition {
    pub logic_table: String,
    pub values: Vec<ConditionValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_row: Option<usize>,
}

impl ShardingCondition {
    pub fn new(logic_table: impl Into<String>) -> Self {
        Self {
            logic_table: logic_table.into(),
            values: Vec::new(),
            insert_row: None,
        }
    }

    /// Resolve operands and merge constraints on the same column
    pub fn resolve(&self, parameters: &[Value]) -> Result<ResolvedCondition, AppError> {
        let mut columns: Vec<ShardingValue> = Vec::new();
        for value in &self.values {
            let resolved = resolve_value(value, parameters)?;
            match columns
                .iter_mut()
                .find(|existing| existing.column.eq_ignore_ascii_case(&resolved.column))
            {
                Some(existing) => {
                    let current = std::mem::replace(&mut existing.kind, ShardingValueKind::List(Vec::new()));
                    existing.kind = current.intersect(resolved.kind);
                }
                None => columns.push(resolved),
            }
        }
        Ok(ResolvedCondition { values: columns })
    }
}

fn resolve_value(value: &ConditionValue, parameters: &[Value]) -> Result<ShardingValue, AppError> {
    let resolve = |operand: &Operand| -> Result<Value, AppError> {
        operand.resolve(parameters).cloned().ok_or_else(|| match operand {
            Operand::Parameter(index) => AppError::Validation(format!(
                "Missing value for parameter {} ({} supplied)",
                index,
                parameters.len()
            )),
            Operand::Literal(_) => AppError::Internal("literal operand without value".to_string()),
        })
    };
    let kind = match value {
        ConditionValue::List { values, .. } => {
            let mut resolved = Vec::with_capacity(values.len());
            for operand in values {
                let each = resolve(operand)?;
                if !resolved.iter().any(|existing| values_equal(existing, &each)) {
                    resolved.push(each);
                }
            }
            ShardingValueKind::List(resolved)
        }
        ConditionValue::Range { lower, upper, .. } => ShardingValueKind::Range {
            lower: resolve(lower)?,
            upper: resolve(upper)?,
        },
    };
    Ok(ShardingValue {
        logic_table: value.table().to_string(),
        column: value.column().to_string(),
        kind,
    })
}

/// Resolved values for one sharding column, as handed to a sharding algorithm
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingValue {
    pub logic_table: String,
    pub column: String,
    pub kind: ShardingValueKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ShardingValueKind {
    List(Vec<Value>),
    /// Inclusive bounds
    Range { lower: Value, upper: Value },
}

impl ShardingValueKind {
    /// Conjunction of two constraints on the same column
    fn intersect(self, other: ShardingValueKind) -> ShardingValueKind {
        match (self, other) {
            (ShardingValueKind::List(left), ShardingValueKind::List(right)) => ShardingValueKind::List(
                left.into_iter()
                    .filter(|value| right.iter().any(|each| values_equal(value, each)))
                    .collect(),
            ),
            (ShardingValueKind::List(values), ShardingValueKind::Range { lower, upper })
            | (ShardingValueKind::Range { lower, upper }, ShardingValueKind::List(values)) => {
                ShardingValueKind::List(
                    values
                        .into_iter()
                        .filter(|value| in_range(value, &lower, &upper))
                        .collect(),
                )
            }
            (
                ShardingValueKind::Range {
                    lower: left_lower,
                    upper: left_upper,
                },
                ShardingValueKind::Range {
                    lower: right_lower,
                    upper: right_upper,
                },
            ) => {
                let lower = match compare_values(&left_lower, &right_lower) {
                    Some(Ordering::Less) => right_lower,
                    _ => left_lower,
                };
                let upper = match compare_values(&left_upper, &right_upper) {
                    Some(Ordering::Greater) => right_upper,
                    _ => left_upper,
                };
                if compare_values(&lower, &upper) == Some(Ordering::Greater) {
                    ShardingValueKind::List(Vec::new())
                } else {
                    ShardingValueKind::Range { lower, upper }
                }
            }
        }
    }

    /// No value can satisfy the constraint
    pub fn is_always_false(&self) -> bool {
        matches!(self, ShardingValueKind::List(values) if values.is_empty())
    }
}

/// Incomparable values are treated as inside the range so routing only broadens
fn in_range(value: &Value, lower: &Value, upper: &Value) -> bool {
    compare_values(value, lower) != Some(Ordering::Less)
        && compare_values(value, upper) != Some(Ordering::Greater)
}

/// Total order on numbers and on strings; other combinations are incomparable
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

pub fn values_equal(left: &Value, right: &Value) -> bool {
    match compare_values(left, right) {
        Some(ordering) => ordering == Ordering::Equal,
        None => left == right,
    }
}

/// A condition with every operand resolved, one entry per constrained column
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedCondition {
    pub values: Vec<ShardingValue>,
}

impl ResolvedCondition {
    /// Values for the given sharding columns, in column order
    pub fn values_for(&self, columns: &[String]) -> Vec<ShardingValue> {
        columns
            .iter()
            .filter_map(|column| {
                self.values
                    .iter()
                    .find(|value| value.column.eq_ignore_ascii_case(column))
                    .cloned()
            })
            .collect()
    }

    pub fn is_always_false(&self) -> bool {
        self.values.iter().any(|value| value.kind.is_always_false())
    }
}

/// Output of the condition extractor, keyed by lower-cased logical table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShardingConditions {
    tables: HashMap<String, Vec<ShardingCondition>>,
}

impl ShardingConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, condition: ShardingCondition) {
        self.tables
            .entry(condition.logic_table.to_ascii_lowercase())
            .or_default()
            .push(condition);
    }

    pub fn get(&self, logic_table: &str) -> &[ShardingCondition] {
        self.tables
            .get(&logic_table.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(Vec::is_empty)
    }

    /// Resolve every table's conditions against the parameter list
    pub fn resolve(&self, parameters: &[Value]) -> Result<ResolvedConditions, AppError> {
        let mut tables = HashMap::with_capacity(self.tables.len());
        for (table, conditions) in &self.tables {
            let mut resolved = Vec::with_capacity(conditions.len());
            for condition in conditions {
                resolved.push(condition.resolve(parameters)?);
            }
            tables.insert(table.clone(), resolved);
        }
        Ok(ResolvedConditions { tables })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConditions {
    tables: HashMap<String, Vec<ResolvedCondition>>,
}

impl ResolvedConditions {
    pub fn get(&self, logic_table: &str) -> &[ResolvedCondition] {
        self.tables
            .get(&logic_table.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Some table's constraints are contradictory, e.g. `id = 1 AND id = 2`
    pub fn is_always_false(&self) -> bool {
        self.tables.values().any(|conditions| {
            !conditions.is_empty() && conditions.iter().all(ResolvedCondition::is_always_false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eq(column: &str, operand: Operand) -> ConditionValue {
        ConditionValue::List {
            table: "t_order".to_string(),
            column: column.to_string(),
            operator: ConditionOperator::Eq,
            values: vec![operand],
        }
    }

    #[test]
    fn test_resolve_parameters() {
        let mut condition = ShardingCondition::new("t_order");
        condition.values.push(eq("user_id", Operand::Parameter(1)));
        let resolved = condition.resolve(&[json!(10), json!(3)]).unwrap();
        assert_eq!(
            resolved.values[0].kind,
            ShardingValueKind::List(vec![json!(3)])
        );

        let missing = condition.resolve(&[json!(10)]);
        assert!(matches!(missing, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_contradictory_equalities_are_always_false() {
        let mut condition = ShardingCondition::new("t_order");
        condition.values.push(eq("order_id", Operand::Literal(json!(1))));
        condition.values.push(eq("order_id", Operand::Literal(json!(2))));

        let mut conditions = ShardingConditions::new();
        conditions.add(condition);
        let resolved = conditions.resolve(&[]).unwrap();
        assert!(resolved.is_always_false());
        assert_eq!(resolved.get("T_ORDER").len(), 1);
    }

    #[test]
    fn test_list_filtered_by_range() {
        let mut condition = ShardingCondition::new("t_order");
        condition.values.push(ConditionValue::List {
            table: "t_order".to_string(),
            column: "order_id".to_string(),
            operator: ConditionOperator::In,
            values: vec![
                Operand::Literal(json!(1)),
                Operand::Literal(json!(5)),
                Operand::Literal(json!(9)),
            ],
        });
        condition.values.push(ConditionValue::Range {
            table: "t_order".to_string(),
            column: "order_id".to_string(),
            lower: Operand::Literal(json!(2)),
            upper: Operand::Literal(json!(9)),
        });
        let resolved = condition.resolve(&[]).unwrap();
        assert_eq!(
            resolved.values[0].kind,
            ShardingValueKind::List(vec![json!(5), json!(9)])
        );
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!(1), &json!("1")), None);
        assert!(values_equal(&json!(1.0), &json!(1)));
    }
}
