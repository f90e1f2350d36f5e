// SQL Rewrite Engine
//
// Token generators inspect the bound statement once and emit byte-range edits; the
// assembler then renders those edits once per (route unit, table group).

pub mod assembler;
pub mod generator;
pub mod token;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::api::middleware::AppError;
use crate::models::route::RouteContext;
use crate::models::statement::{BoundStatement, Expr, Span};
use crate::services::condition::GeneratedKeyContext;
use crate::services::rule::RuleModel;

pub use token::{SqlToken, TokenKind, ValueItem};

/// One physical statement ready for dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUnit {
    pub data_source: String,
    pub sql: String,
    pub parameters: Vec<Value>,
}

/// Per-statement inputs shared by every token generator
pub struct RewriteContext<'a> {
    pub bound: &'a BoundStatement,
    pub model: &'a RuleModel,
    pub route_context: &'a RouteContext,
    pub generated_keys: Option<&'a GeneratedKeyContext>,
    pub parameters: &'a [Value],
}

impl<'a> RewriteContext<'a> {
    pub fn sql(&self) -> &'a str {
        &self.bound.sql
    }

    /// Indexes of the parameter markers inside `span`, left to right
    pub fn markers_within(&self, span: Span) -> Vec<usize> {
        self.bound
            .parameter_markers
            .iter()
            .filter(|marker| span.contains(marker.span.start))
            .map(|marker| marker.index)
            .collect()
    }

    /// Value slot that reproduces `expr` as written
    pub fn original(&self, expr: &Expr) -> ValueItem {
        let span = expr.span();
        ValueItem::Original {
            span,
            markers: self.markers_within(span),
        }
    }
}

/// A stateless pass that contributes tokens for one concern
pub trait SqlTokenGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool;

    /// Append tokens; later generators may refine tokens added by earlier ones
    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError>;
}

pub struct SqlRewriteEngine {
    generators: Vec<Box<dyn SqlTokenGenerator>>,
}

impl SqlRewriteEngine {
    /// Sharding generators first, then encrypt generators
    pub fn new() -> Self {
        Self {
            generators: generator::builtin_generators(),
        }
    }

    pub fn with_generators(generators: Vec<Box<dyn SqlTokenGenerator>>) -> Self {
        Self { generators }
    }

    /// Run every applicable generator and sort the result
    pub fn generate_tokens(&self, context: &RewriteContext<'_>) -> Result<Vec<SqlToken>, AppError> {
        let mut tokens = Vec::new();
        for generator in &self.generators {
            if generator.is_applicable(context) {
                let before = tokens.len();
                generator.generate(context, &mut tokens)?;
                debug!("{} produced {} token(s)", generator.name(), tokens.len() - before);
            }
        }
        assembler::sort_tokens(&mut tokens);
        Ok(tokens)
    }

    /// One execution unit per table group of every route unit; a unit without table
    /// groups renders once
    pub fn rewrite(&self, context: &RewriteContext<'_>) -> Result<Vec<ExecutionUnit>, AppError> {
        let tokens = self.generate_tokens(context)?;
        let markers = &context.bound.parameter_markers;
        let mut units = Vec::new();
        for unit in context.route_context.route_units() {
            let groups = unit.table_groups();
            let empty = [Vec::new()];
            let groups = if groups.is_empty() { &empty[..] } else { groups };
            for group in groups {
                let (sql, parameters) = assembler::assemble(
                    context.sql(),
                    &tokens,
                    markers,
                    context.parameters,
                    unit,
                    group,
                )?;
                units.push(ExecutionUnit {
                    data_source: unit.actual_data_source().to_string(),
                    sql,
                    parameters,
                });
            }
        }
        Ok(units)
    }
}

impl Default for SqlRewriteEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::binder::bind;
    use crate::services::condition::ShardingConditionEngine;
    use crate::services::route::RouteEngine;
    use crate::models::statement::HintContext;
    use crate::services::rule::tests::sample_model;
    use crate::services::rule::RuleModel;
    use serde_json::json;

    /// Bind, route and rewrite against the sample rules
    pub(crate) fn rewrite(sql: &str, parameters: &[Value]) -> Result<Vec<ExecutionUnit>, AppError> {
        rewrite_with(&sample_model(), sql, parameters)
    }

    pub(crate) fn rewrite_with(
        model: &RuleModel,
        sql: &str,
        parameters: &[Value],
    ) -> Result<Vec<ExecutionUnit>, AppError> {
        let bound = bind(sql)?;
        let keys = GeneratedKeyContext::generate(&bound, &model.sharding);
        let conditions = ShardingConditionEngine::new(&model.sharding).extract(&bound, keys.as_ref());
        let route_context = RouteEngine::new(model).route(&bound, &conditions, parameters, &HintContext::default())?;
        let context = RewriteContext {
            bound: &bound,
            model,
            route_context: &route_context,
            generated_keys: keys.as_ref(),
            parameters,
        };
        SqlRewriteEngine::new().rewrite(&context)
    }

    fn sqls(units: &[ExecutionUnit]) -> Vec<String> {
        units.iter().map(|unit| format!("{}: {}", unit.data_source, unit.sql)).collect()
    }

    #[test]
    fn test_precise_select_rewrites_table() {
        let units = rewrite(
            "SELECT * FROM t_order WHERE user_id = ? AND order_id = ?",
            &[json!(2), json!(3)],
        )
        .unwrap();
        assert_eq!(
            sqls(&units),
            vec!["ds_0: SELECT * FROM t_order_1 WHERE user_id = ? AND order_id = ?"]
        );
        assert_eq!(units[0].parameters, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_unit_without_groups_renders_once() {
        let units = rewrite("BEGIN", &[]).unwrap();
        assert_eq!(sqls(&units), vec!["ds_0: BEGIN", "ds_1_primary: BEGIN"]);
    }

    #[test]
    fn test_alter_table_rendered_per_node() {
        let units = rewrite("ALTER TABLE t_order ADD COLUMN x INT", &[]).unwrap();
        assert_eq!(
            sqls(&units),
            vec![
                "ds_0: ALTER TABLE t_order_0 ADD COLUMN x INT",
                "ds_0: ALTER TABLE t_order_1 ADD COLUMN x INT",
                "ds_1_primary: ALTER TABLE t_order_0 ADD COLUMN x INT",
                "ds_1_primary: ALTER TABLE t_order_1 ADD COLUMN x INT",
            ]
        );
    }

    #[test]
    fn test_binding_join_keeps_aligned_tables() {
        let units = rewrite(
            "SELECT i.* FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id WHERE o.user_id = 1 AND o.order_id = 1",
            &[],
        )
        .unwrap();
        assert_eq!(
            sqls(&units),
            vec!["ds_1_replica: SELECT i.* FROM t_order_1 o JOIN t_order_item_1 i ON o.order_id = i.order_id WHERE o.user_id = 1 AND o.order_id = 1"]
        );
    }
}
