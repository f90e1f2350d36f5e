// Sharding Algorithms
//
// A sharding algorithm narrows a candidate list (data source names or actual table
// names, in data node declaration order) using the resolved values of its sharding
// columns. Results are always a subset of the candidates, in candidate order.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::{bool_prop, parse_prop, required_prop, Properties};
use crate::api::middleware::AppError;
use crate::models::condition::{ShardingValue, ShardingValueKind};
use crate::services::inline_expr::{InlineExpression, InlineExpressionParser};

/// Strategy algorithm invoked with the values of its sharding columns
pub trait ShardingAlgorithm: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    /// Select targets. `values` holds one entry per sharding column that carries a
    /// condition and is never empty; without conditions the engine takes every target.
    fn do_sharding(&self, targets: &[String], values: &[ShardingValue]) -> Result<Vec<String>, AppError>;
}

/// Trailing decimal suffix of a target name, e.g. `t_order_12` -> 12
fn trailing_suffix(name: &str) -> Option<u64> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

fn targets_with_suffix(targets: &[String], indexes: &BTreeSet<u64>) -> Vec<String> {
    targets
        .iter()
        .filter(|target| trailing_suffix(target).is_some_and(|suffix| indexes.contains(&suffix)))
        .cloned()
        .collect()
}

/// Integer view of a sharding value
pub fn value_as_i64(value: &Value) -> Result<i64, AppError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        AppError::UnsupportedConstruct(format!("Unsupported sharding value `{}`", value))
    })
}

/// First column's values; standard algorithms shard on a single column
fn first_value(values: &[ShardingValue]) -> Result<&ShardingValueKind, AppError> {
    values
        .first()
        .map(|value| &value.kind)
        .ok_or_else(|| AppError::Internal("sharding algorithm invoked without values".to_string()))
}

/// `value % sharding-count`
#[derive(Debug)]
pub struct ModShardingAlgorithm {
    sharding_count: u64,
}

impl ModShardingAlgorithm {
    pub fn create(props: &Properties) -> Result<Arc<dyn ShardingAlgorithm>, AppError> {
        let sharding_count: u64 = parse_prop(props, "sharding-count", "MOD")?;
        if sharding_count == 0 {
            return Err(AppError::Configuration(
                "MOD algorithm property `sharding-count` must be positive".to_string(),
            ));
        }
        Ok(Arc::new(Self { sharding_count }))
    }

    fn index(&self, value: i64) -> u64 {
        value.rem_euclid(self.sharding_count as i64) as u64
    }
}

impl ShardingAlgorithm for ModShardingAlgorithm {
    fn type_name(&self) -> &'static str {
        "MOD"
    }

    fn do_sharding(&self, targets: &[String], values: &[ShardingValue]) -> Result<Vec<String>, AppError> {
        let mut indexes = BTreeSet::new();
        match first_value(values)? {
            ShardingValueKind::List(list) => {
                for value in list {
                    indexes.insert(self.index(value_as_i64(value)?));
                }
            }
            ShardingValueKind::Range { lower, upper } => {
                let lower = value_as_i64(lower)?;
                let upper = value_as_i64(upper)?;
                if upper < lower {
                    return Ok(Vec::new());
                }
                // A range wider than the modulus touches every shard
                if upper.abs_diff(lower) >= self.sharding_count - 1 {
                    return Ok(targets.to_vec());
                }
                for value in lower..=upper {
                    indexes.insert(self.index(value));
                }
            }
        }
        Ok(targets_with_suffix(targets, &indexes))
    }
}

/// `abs(hashCode(value)) % sharding-count`, precise values only
#[derive(Debug)]
pub struct HashModShardingAlgorithm {
    sharding_count: u64,
}

impl HashModShardingAlgorithm {
    pub fn create(props: &Properties) -> Result<Arc<dyn ShardingAlgorithm>, AppError> {
        let sharding_count: u64 = parse_prop(props, "sharding-count", "HASH_MOD")?;
        if sharding_count == 0 {
            return Err(AppError::Configuration(
                "HASH_MOD algorithm property `sharding-count` must be positive".to_string(),
            ));
        }
        Ok(Arc::new(Self { sharding_count }))
    }

    /// JVM-compatible hash so existing shard layouts keep their placement
    fn hash(value: &Value) -> Result<i32, AppError> {
        match value {
            Value::Number(number) if number.as_i64().is_some() => {
                let long = number.as_i64().unwrap_or_default();
                Ok((long ^ ((long as u64) >> 32) as i64) as i32)
            }
            Value::String(text) => Ok(text
                .encode_utf16()
                .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))),
            other => Err(AppError::UnsupportedConstruct(format!(
                "Unsupported sharding value `{}` for HASH_MOD",
                other
            ))),
        }
    }
}

impl ShardingAlgorithm for HashModShardingAlgorithm {
    fn type_name(&self) -> &'static str {
        "HASH_MOD"
    }

    fn do_sharding(&self, targets: &[String], values: &[ShardingValue]) -> Result<Vec<String>, AppError> {
        match first_value(values)? {
            ShardingValueKind::List(list) => {
                let mut indexes = BTreeSet::new();
                for value in list {
                    let hash = (Self::hash(value)? as i64).unsigned_abs();
                    indexes.insert(hash % self.sharding_count);
                }
                Ok(targets_with_suffix(targets, &indexes))
            }
            ShardingValueKind::Range { .. } => Ok(targets.to_vec()),
        }
    }
}

/// Ascending boundaries `b0,b1,..`; partition i holds `[b(i-1), b(i))`
#[derive(Debug)]
pub struct BoundaryRangeShardingAlgorithm {
    boundaries: Vec<i64>,
}

impl BoundaryRangeShardingAlgorithm {
    pub fn create(props: &Properties) -> Result<Arc<dyn ShardingAlgorithm>, AppError> {
        let raw = required_prop(props, "sharding-ranges", "BOUNDARY_RANGE")?;
        let mut boundaries = Vec::new();
        for part in raw.split(',') {
            let boundary = part.trim().parse::<i64>().map_err(|_| {
                AppError::Configuration(format!(
                    "BOUNDARY_RANGE algorithm has malformed boundary `{}`",
                    part.trim()
                ))
            })?;
            boundaries.push(boundary);
        }
        if boundaries.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(AppError::Configuration(format!(
                "BOUNDARY_RANGE boundaries `{}` must be strictly ascending",
                raw
            )));
        }
        Ok(Arc::new(Self { boundaries }))
    }

    fn partition(&self, value: i64) -> u64 {
        self.boundaries.partition_point(|boundary| *boundary <= value) as u64
    }
}

impl ShardingAlgorithm for BoundaryRangeShardingAlgorithm {
    fn type_name(&self) -> &'static str {
        "BOUNDARY_RANGE"
    }

    fn do_sharding(&self, targets: &[String], values: &[ShardingValue]) -> Result<Vec<String>, AppError> {
        let mut indexes = BTreeSet::new();
        match first_value(values)? {
            ShardingValueKind::List(list) => {
                for value in list {
                    indexes.insert(self.partition(value_as_i64(value)?));
                }
            }
            ShardingValueKind::Range { lower, upper } => {
                let lower = self.partition(value_as_i64(lower)?);
                let upper = self.partition(value_as_i64(upper)?);
                indexes.extend(lower..=upper);
            }
        }
        Ok(targets_with_suffix(targets, &indexes))
    }
}

/// Evaluates `algorithm-expression` (e.g. `ds_${user_id % 2}`) per value combination
#[derive(Debug)]
pub struct InlineShardingAlgorithm {
    expression: InlineExpression,
    allow_range_query: bool,
}

impl InlineShardingAlgorithm {
    pub fn create(props: &Properties) -> Result<Arc<dyn ShardingAlgorithm>, AppError> {
        let raw = required_prop(props, "algorithm-expression", "INLINE")?;
        let expression = InlineExpressionParser::shared().parse_single(raw)?;
        let allow_range_query =
            bool_prop(props, "allow-range-query-with-inline-sharding", "INLINE")?;
        Ok(Arc::new(Self {
            expression,
            allow_range_query,
        }))
    }
}

impl ShardingAlgorithm for InlineShardingAlgorithm {
    fn type_name(&self) -> &'static str {
        "INLINE"
    }

    fn do_sharding(&self, targets: &[String], values: &[ShardingValue]) -> Result<Vec<String>, AppError> {
        if values
            .iter()
            .any(|value| matches!(value.kind, ShardingValueKind::Range { .. }))
        {
            if self.allow_range_query {
                return Ok(targets.to_vec());
            }
            return Err(AppError::UnsupportedConstruct(format!(
                "Range condition on inline sharding expression `{}` requires `allow-range-query-with-inline-sharding`",
                self.expression.source()
            )));
        }

        let mut columns: Vec<(String, &Vec<Value>)> = Vec::new();
        for variable in self.expression.variables() {
            let list = values.iter().find_map(|value| match &value.kind {
                ShardingValueKind::List(list) if value.column.eq_ignore_ascii_case(&variable) => {
                    Some(list)
                }
                _ => None,
            });
            match list {
                Some(list) => columns.push((variable, list)),
                // Unconstrained variable: cannot narrow
                None => return Ok(targets.to_vec()),
            }
        }

        let mut combinations: Vec<HashMap<String, Value>> = vec![HashMap::new()];
        for (column, list) in &columns {
            combinations = combinations
                .iter()
                .flat_map(|base| {
                    list.iter().map(move |value| {
                        let mut next = base.clone();
                        next.insert(column.clone(), value.clone());
                        next
                    })
                })
                .collect();
        }

        let mut names = Vec::with_capacity(combinations.len());
        for variables in &combinations {
            names.push(self.expression.evaluate(variables)?);
        }
        Ok(targets
            .iter()
            .filter(|target| names.iter().any(|name| name.eq_ignore_ascii_case(target)))
            .cloned()
            .collect())
    }
}
