use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::binder::bind;
use crate::models::route::RouteContext;
use crate::models::statement::{BoundStatement, HintContext};
use crate::services::condition::{GeneratedKeyContext, ShardingConditionEngine};
use crate::services::rewrite::{ExecutionUnit, RewriteContext, SqlRewriteEngine};
use crate::services::route::RouteEngine;
use crate::services::rule::RuleModel;

#[derive(Debug, Clone, Copy, Default)]
pub struct KernelProps {
    /// Log the logical SQL and every rewritten unit at info level
    pub sql_show: bool,
}

/// Route context plus the physical statements rendered from it
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub route_context: RouteContext,
    pub execution_units: Vec<ExecutionUnit>,
}

/// Bind, route and rewrite one statement against a rule model snapshot
pub struct ShardingKernel {
    rules: Arc<RuleModel>,
    rewrite_engine: SqlRewriteEngine,
    props: KernelProps,
}

impl ShardingKernel {
    pub fn new(rules: Arc<RuleModel>, props: KernelProps) -> Self {
        Self {
            rules,
            rewrite_engine: SqlRewriteEngine::new(),
            props,
        }
    }

    pub fn rules(&self) -> &Arc<RuleModel> {
        &self.rules
    }

    /// Execute the full pipeline for SQL text; `hint` is the session hint and wins over
    /// any inline `ROUTE_HINT` comment
    pub fn execute(&self, sql: &str, parameters: &[Value], hint: &HintContext) -> Result<ExecutionContext, AppError> {
        let bound = bind(sql)?;
        self.execute_statement(&bound, parameters, hint)
    }

    pub fn execute_statement(
        &self,
        bound: &BoundStatement,
        parameters: &[Value],
        hint: &HintContext,
    ) -> Result<ExecutionContext, AppError> {
        let rules = self.rules.as_ref();

        // Every marker needs a value
        if parameters.len() < bound.parameter_markers.len() {
            return Err(AppError::Validation(format!(
                "Statement has {} parameter marker(s) but {} value(s) were supplied",
                bound.parameter_markers.len(),
                parameters.len()
            )));
        }

        let hint = hint.merge(&bound.inline_hint);

        // Keys are generated before routing so they take part in the sharding conditions
        let generated_keys = GeneratedKeyContext::generate(bound, &rules.sharding);
        let conditions = ShardingConditionEngine::new(&rules.sharding).extract(bound, generated_keys.as_ref());

        let route_context = RouteEngine::new(rules).route(bound, &conditions, parameters, &hint)?;
        if route_context.is_empty() {
            return Err(AppError::NoMatchingShard(format!(
                "No data node matches {} statement on [{}]",
                bound.statement.type_name(),
                bound.table_names().join(", ")
            )));
        }

        let rewrite_context = RewriteContext {
            bound,
            model: rules,
            route_context: &route_context,
            generated_keys: generated_keys.as_ref(),
            parameters,
        };
        let execution_units = self.rewrite_engine.rewrite(&rewrite_context)?;

        if self.props.sql_show {
            tracing::info!("Logic SQL: {}", bound.sql);
            for unit in &execution_units {
                let parameters = Value::Array(unit.parameters.clone());
                tracing::info!("Actual SQL: {} ::: {} ::: {}", unit.data_source, unit.sql, parameters);
            }
        }

        Ok(ExecutionContext {
            route_context,
            execution_units,
        })
    }
}
