// Route Service
//
// Chooses a routing engine for a bound statement and produces its RouteContext.
// Decision order: hint, then statement-scoped engines (unicast, broadcast, default),
// then standard or complex sharding routes, then readwrite decoration.

pub mod broadcast;
pub mod complex;
pub mod hint;
pub mod readwrite;
pub mod standard;
pub mod unicast;

use serde_json::Value;
use std::fmt;

use crate::api::middleware::AppError;
use crate::models::condition::{ResolvedConditions, ShardingConditions};
use crate::models::route::RouteContext;
use crate::models::statement::{
    BoundStatement, DalKind, DdlKind, HintContext, Statement,
};
use crate::services::rule::RuleModel;

/// Engine selected for a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEngineKind {
    Hint,
    Unicast,
    DefaultDataSource,
    DatabaseBroadcast,
    TableBroadcast,
    InstanceBroadcast,
    Standard,
    Complex,
}

impl fmt::Display for RouteEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteEngineKind::Hint => "hint",
            RouteEngineKind::Unicast => "unicast",
            RouteEngineKind::DefaultDataSource => "default data source",
            RouteEngineKind::DatabaseBroadcast => "database broadcast",
            RouteEngineKind::TableBroadcast => "table broadcast",
            RouteEngineKind::InstanceBroadcast => "instance broadcast",
            RouteEngineKind::Standard => "standard",
            RouteEngineKind::Complex => "complex",
        };
        f.write_str(name)
    }
}

pub struct RouteEngine<'a> {
    model: &'a RuleModel,
}

impl<'a> RouteEngine<'a> {
    pub fn new(model: &'a RuleModel) -> Self {
        Self { model }
    }

    pub fn route(
        &self,
        statement: &BoundStatement,
        conditions: &ShardingConditions,
        parameters: &[Value],
        hint: &HintContext,
    ) -> Result<RouteContext, AppError> {
        let tables = statement.table_names();
        let resolved = conditions.resolve(parameters)?;
        let kind = match &hint.data_source {
            Some(_) => RouteEngineKind::Hint,
            None => self.select_engine(statement, &tables, &resolved),
        };

        let mut context = match kind {
            RouteEngineKind::Hint => {
                let data_source = hint.data_source.as_deref().unwrap_or_default();
                hint::route_hint(self.model, data_source, &tables)?
            }
            RouteEngineKind::Unicast => unicast::route_unicast(self.model, &tables)?,
            RouteEngineKind::DefaultDataSource => unicast::route_default(self.model, &tables)?,
            RouteEngineKind::DatabaseBroadcast => {
                broadcast::route_database_broadcast(self.model, &tables)
            }
            RouteEngineKind::TableBroadcast => {
                broadcast::route_table_broadcast(self.model, &self.broadcast_tables(statement, &tables))?
            }
            RouteEngineKind::InstanceBroadcast => broadcast::route_instance_broadcast(self.model),
            RouteEngineKind::Standard => standard::route_standard(
                &self.model.sharding,
                &self.model.sharding.sharding_logic_tables(&tables),
                &resolved,
                matches!(statement.statement, Statement::Insert(_)),
            )?,
            RouteEngineKind::Complex => complex::route_complex(
                &self.model.sharding,
                &self.model.sharding.sharding_logic_tables(&tables),
                &resolved,
            )?,
        };

        let is_read = statement.is_read_query() && !hint.write_route_only;
        readwrite::decorate(&self.model.readwrite, &mut context, is_read)?;
        tracing::debug!(
            "Routed {} statement with {} engine to {} unit(s)",
            statement.statement.type_name(),
            kind,
            context.route_units().len()
        );
        Ok(context)
    }

    /// Tables a table broadcast covers; index-only DDL resolves its table through the index name
    fn broadcast_tables(&self, statement: &BoundStatement, tables: &[String]) -> Vec<String> {
        if !tables.is_empty() {
            return tables.to_vec();
        }
        match &statement.statement {
            Statement::Ddl(ddl) => ddl
                .indexes
                .iter()
                .filter_map(|index| self.model.sharding.find_table_by_index(&index.value))
                .map(|table| table.to_ascii_lowercase())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn any_sharded(&self, tables: &[String]) -> bool {
        tables.iter().any(|table| self.model.sharding.is_sharding_table(table))
    }

    /// Broadcast tables everywhere, otherwise the default data source
    fn non_sharded_kind(&self, tables: &[String]) -> RouteEngineKind {
        if self.model.sharding.is_all_broadcast_tables(tables) {
            RouteEngineKind::DatabaseBroadcast
        } else {
            RouteEngineKind::DefaultDataSource
        }
    }

    pub fn select_engine(
        &self,
        statement: &BoundStatement,
        tables: &[String],
        conditions: &ResolvedConditions,
    ) -> RouteEngineKind {
        let sharding = &self.model.sharding;
        match &statement.statement {
            Statement::Tcl(_) => RouteEngineKind::DatabaseBroadcast,
            Statement::Ddl(ddl) => match ddl.kind {
                DdlKind::Routine => RouteEngineKind::DatabaseBroadcast,
                DdlKind::Tablespace => RouteEngineKind::InstanceBroadcast,
                _ if tables.is_empty() => {
                    let indexed = self.broadcast_tables(statement, tables);
                    if indexed.is_empty() {
                        RouteEngineKind::DatabaseBroadcast
                    } else {
                        RouteEngineKind::TableBroadcast
                    }
                }
                _ if self.any_sharded(tables) => RouteEngineKind::TableBroadcast,
                _ => self.non_sharded_kind(tables),
            },
            Statement::Dal(dal) => match dal.kind {
                DalKind::Set | DalKind::Use => RouteEngineKind::DatabaseBroadcast,
                DalKind::ShowDatabases | DalKind::Show => RouteEngineKind::Unicast,
                DalKind::DescribeTable if self.any_sharded(tables) => RouteEngineKind::Unicast,
                DalKind::DescribeTable => RouteEngineKind::DefaultDataSource,
                DalKind::OptimizeTable | DalKind::AnalyzeTable if self.any_sharded(tables) => {
                    RouteEngineKind::TableBroadcast
                }
                DalKind::OptimizeTable | DalKind::AnalyzeTable => RouteEngineKind::DatabaseBroadcast,
            },
            Statement::Dcl(_) if tables.is_empty() => RouteEngineKind::InstanceBroadcast,
            Statement::Dcl(_) if self.any_sharded(tables) => RouteEngineKind::TableBroadcast,
            Statement::Dcl(_) => self.non_sharded_kind(tables),
            Statement::Select(_) | Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) => {
                let sharded = sharding.sharding_logic_tables(tables);
                if tables.is_empty() {
                    RouteEngineKind::Unicast
                } else if sharded.is_empty() {
                    if sharding.is_all_broadcast_tables(tables) {
                        if matches!(statement.statement, Statement::Select(_)) {
                            RouteEngineKind::Unicast
                        } else {
                            RouteEngineKind::DatabaseBroadcast
                        }
                    } else {
                        RouteEngineKind::DefaultDataSource
                    }
                } else if conditions.is_always_false() {
                    RouteEngineKind::Unicast
                } else if sharded.len() == 1 || sharding.is_all_binding_tables(&sharded) {
                    RouteEngineKind::Standard
                } else {
                    RouteEngineKind::Complex
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::bind;
    use crate::services::condition::{GeneratedKeyContext, ShardingConditionEngine};
    use crate::services::rule::tests::sample_model;
    use serde_json::json;

    fn route(sql: &str, params: &[Value], hint: &HintContext) -> Result<RouteContext, AppError> {
        let model = sample_model();
        let bound = bind(sql)?;
        let keys = GeneratedKeyContext::generate(&bound, &model.sharding);
        let conditions = ShardingConditionEngine::new(&model.sharding).extract(&bound, keys.as_ref());
        RouteEngine::new(&model).route(&bound, &conditions, params, hint)
    }

    fn data_sources(context: &RouteContext) -> Vec<&str> {
        context.route_units().iter().map(|unit| unit.logic_data_source()).collect()
    }

    #[test]
    fn test_precise_standard_route() {
        let context = route("SELECT * FROM t_order WHERE user_id = ?", &[json!(3)], &HintContext::default()).unwrap();
        assert_eq!(data_sources(&context), vec!["ds_1"]);
        // plain reads of a readwrite group go to the replica
        assert_eq!(context.route_units()[0].actual_data_source(), "ds_1_replica");
    }

    #[test]
    fn test_routing_is_repeatable() {
        let sql = "UPDATE t_order SET status = 'x' WHERE user_id = 2 AND order_id = 5";
        let first = route(sql, &[], &HintContext::default()).unwrap();
        let second = route(sql, &[], &HintContext::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.route_units()[0].actual_tables("t_order"), vec!["t_order_1"]);
    }

    #[test]
    fn test_hint_overrides_conditions() {
        let hint = HintContext::with_data_source("ds_1");
        let context = route("SELECT * FROM t_order WHERE user_id = 0", &[], &hint).unwrap();
        assert_eq!(data_sources(&context), vec!["ds_1"]);
        assert!(!context.contains_table_sharding());

        let missing = route("SELECT 1", &[], &HintContext::with_data_source("nope"));
        assert!(matches!(missing, Err(AppError::HintDataSourceNotFound(_))));
    }

    #[test]
    fn test_write_route_only_hint_uses_primary() {
        let hint = HintContext {
            data_source: None,
            write_route_only: true,
        };
        let context = route("SELECT * FROM t_order WHERE user_id = 1", &[], &hint).unwrap();
        assert_eq!(context.route_units()[0].actual_data_source(), "ds_1_primary");
    }

    #[test]
    fn test_alter_table_broadcasts_to_every_node() {
        let context = route("ALTER TABLE t_order ADD COLUMN x INT", &[], &HintContext::default()).unwrap();
        assert_eq!(data_sources(&context), vec!["ds_0", "ds_1"]);
        for unit in context.route_units() {
            assert_eq!(unit.actual_tables("t_order"), vec!["t_order_0", "t_order_1"]);
        }
    }

    #[test]
    fn test_drop_index_resolves_table_by_index_name() {
        let context = route("DROP INDEX idx_order_user", &[], &HintContext::default()).unwrap();
        assert_eq!(context.route_units().len(), 2);
        assert!(context.contains_table_sharding());
    }

    #[test]
    fn test_statement_scoped_engines() {
        let model = sample_model();
        let engine = RouteEngine::new(&model);
        let kind = |sql: &str| {
            let bound = bind(sql).unwrap();
            let tables = bound.table_names();
            engine.select_engine(&bound, &tables, &ResolvedConditions::default())
        };
        assert_eq!(kind("BEGIN"), RouteEngineKind::DatabaseBroadcast);
        assert_eq!(kind("SHOW DATABASES"), RouteEngineKind::Unicast);
        assert_eq!(kind("SET autocommit = 1"), RouteEngineKind::DatabaseBroadcast);
        assert_eq!(kind("CREATE TABLESPACE ts ADD DATAFILE 'f'"), RouteEngineKind::InstanceBroadcast);
        assert_eq!(kind("DROP PROCEDURE p"), RouteEngineKind::DatabaseBroadcast);
        assert_eq!(kind("CREATE USER bob"), RouteEngineKind::InstanceBroadcast);
        assert_eq!(kind("GRANT SELECT ON t_order TO bob"), RouteEngineKind::TableBroadcast);
        assert_eq!(kind("SELECT * FROM t_config"), RouteEngineKind::Unicast);
        assert_eq!(kind("DELETE FROM t_config"), RouteEngineKind::DatabaseBroadcast);
        assert_eq!(kind("SELECT * FROM t_misc"), RouteEngineKind::DefaultDataSource);
        assert_eq!(kind("SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id"), RouteEngineKind::Standard);
        assert_eq!(kind("SELECT * FROM t_order o JOIN t_user u ON o.user_id = u.user_id"), RouteEngineKind::Complex);
    }

    #[test]
    fn test_always_false_routes_to_one_target() {
        let context = route(
            "SELECT * FROM t_order WHERE order_id = 1 AND order_id = 2",
            &[],
            &HintContext::default(),
        )
        .unwrap();
        assert!(context.is_single_routing());
    }

    #[test]
    fn test_insert_records_row_nodes() {
        let context = route(
            "INSERT INTO t_order (order_id, user_id) VALUES (1, 1), (2, 2)",
            &[],
            &HintContext::default(),
        )
        .unwrap();
        assert_eq!(data_sources(&context), vec!["ds_1", "ds_0"]);
        let nodes = context.original_data_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0][0].to_string(), "ds_1.t_order_1");
        assert_eq!(nodes[1][0].to_string(), "ds_0.t_order_0");
    }
}
