// SQL Binder
//
// Turns SQL text into a BoundStatement: the statement tree with byte spans, the
// positional parameter markers, and any inline ROUTE_HINT comment.

pub mod lexer;
pub mod parser;

use crate::api::middleware::AppError;
use crate::models::statement::{BoundStatement, HintContext};

const HINT_PREFIX: &str = "ROUTE_HINT:";

/// Parse one MySQL statement
pub fn bind(sql: &str) -> Result<BoundStatement, AppError> {
    if sql.trim().is_empty() {
        return Err(AppError::Validation("SQL must not be empty".to_string()));
    }
    let output = lexer::tokenize(sql)?;
    let (statement, parameter_markers) = parser::Parser::new(sql, output.lexemes).parse()?;
    let inline_hint = parse_hint(&output.comments);
    tracing::debug!(
        "Bound {} statement with {} parameter(s)",
        statement.type_name(),
        parameter_markers.len()
    );
    Ok(BoundStatement {
        sql: sql.to_string(),
        statement,
        parameter_markers,
        inline_hint,
    })
}

/// `/* ROUTE_HINT: DATA_SOURCE_NAME=ds_1, WRITE_ROUTE_ONLY=true */`
fn parse_hint(comments: &[String]) -> HintContext {
    let mut hint = HintContext::default();
    for comment in comments {
        let upper = comment.to_ascii_uppercase();
        let Some(position) = upper.find(HINT_PREFIX) else {
            continue;
        };
        let body = &comment[position + HINT_PREFIX.len()..];
        for pair in body.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_uppercase().as_str() {
                "DATA_SOURCE_NAME" if !value.is_empty() => {
                    hint.data_source = Some(value.to_string());
                }
                "WRITE_ROUTE_ONLY" => {
                    hint.write_route_only = value.eq_ignore_ascii_case("true");
                }
                other => tracing::warn!("Ignoring unknown route hint key: {}", other),
            }
        }
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::statement::*;
    use serde_json::json;

    fn select(sql: &str) -> SelectStatement {
        match bind(sql).unwrap().statement {
            Statement::Select(select) => select,
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_select_segments_and_spans() {
        let sql = "SELECT o.order_id, COUNT(*) AS cnt FROM t_order o WHERE o.user_id = ? \
                   GROUP BY o.order_id ORDER BY o.order_id DESC LIMIT 10, 20";
        let select = select(sql);
        assert_eq!(select.projections.items.len(), 2);
        assert_eq!(select.from[0].logic_name(), "t_order");
        assert_eq!(select.from[0].alias.as_ref().unwrap().value, "o");
        assert_eq!(select.from[0].name.span.text(sql), "t_order");

        match &select.projections.items[1] {
            Projection::Aggregation {
                kind, inner, alias, ..
            } => {
                assert_eq!(*kind, AggregationKind::Count);
                assert_eq!(inner.text(sql), "*");
                assert_eq!(alias.as_ref().unwrap().value, "cnt");
            }
            other => panic!("unexpected projection {:?}", other),
        }

        let where_clause = select.where_clause.as_ref().unwrap();
        assert_eq!(where_clause.span.text(sql), "WHERE o.user_id = ?");

        let order_by = select.order_by.as_ref().unwrap();
        assert_eq!(order_by.items[0].direction, OrderDirection::Desc);
        assert!(select.group_by.is_some());

        let limit = select.limit.as_ref().unwrap();
        assert_eq!(limit.offset.as_ref().unwrap().operand, Operand::Literal(json!(10)));
        assert_eq!(limit.row_count.as_ref().unwrap().span.text(sql), "20");
    }

    #[test]
    fn test_parameter_markers_are_numbered_in_order() {
        let sql = "SELECT * FROM t_order WHERE user_id IN (?, ?) AND order_id BETWEEN ? AND ? LIMIT ?";
        let bound = bind(sql).unwrap();
        let indexes: Vec<usize> = bound.parameter_markers.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        assert_eq!(bound.parameter_markers[4].span.text(sql), "?");
    }

    #[test]
    fn test_joins_and_subqueries_contribute_tables() {
        let sql = "SELECT i.* FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id \
                   WHERE o.user_id IN (SELECT user_id FROM t_user WHERE status = 'A')";
        let bound = bind(sql).unwrap();
        assert_eq!(bound.table_names(), vec!["t_order", "t_order_item", "t_user"]);
        match &bound.statement {
            Statement::Select(select) => {
                assert_eq!(select.join_conditions.len(), 1);
                assert!(matches!(select.projections.items[0], Projection::Shorthand { owner: Some(_), .. }));
            }
            _ => panic!("expected SELECT"),
        }
    }

    #[test]
    fn test_insert_rows_and_columns() {
        let sql = "INSERT INTO t_order (user_id, status) VALUES (?, 'init'), (2, ?)";
        let bound = bind(sql).unwrap();
        let Statement::Insert(insert) = &bound.statement else {
            panic!("expected INSERT");
        };
        assert_eq!(insert.row_count(), 2);
        assert_eq!(insert.columns.as_ref().unwrap().span.text(sql), "(user_id, status)");
        assert_eq!(insert.values[1].span.text(sql), "(2, ?)");
        assert_eq!(insert.row_value(1, "USER_ID").unwrap().as_operand(), Some(Operand::Literal(json!(2))));
        assert_eq!(bound.parameter_markers.len(), 2);
    }

    #[test]
    fn test_insert_set_and_duplicate_key_update() {
        let sql = "INSERT INTO t_user SET user_id = 1, phone = '123' ON DUPLICATE KEY UPDATE phone = VALUES(phone)";
        let Statement::Insert(insert) = bind(sql).unwrap().statement else {
            panic!("expected INSERT");
        };
        assert_eq!(insert.row_count(), 1);
        assert!(insert.contains_column("phone"));
        assert_eq!(insert.on_duplicate_key_update.unwrap().assignments.len(), 1);
    }

    #[test]
    fn test_update_and_delete() {
        let Statement::Update(update) = bind("UPDATE t_order SET status = ? WHERE order_id = 1").unwrap().statement else {
            panic!("expected UPDATE");
        };
        assert_eq!(update.set.assignments[0].column.name.value, "status");
        assert!(update.where_clause.is_some());

        let Statement::Delete(delete) = bind("DELETE FROM t_order WHERE order_id = 1 LIMIT 1").unwrap().statement else {
            panic!("expected DELETE");
        };
        assert_eq!(delete.tables[0].logic_name(), "t_order");
        assert!(delete.limit.is_some());
    }

    #[test]
    fn test_ddl_dal_dcl_tcl() {
        let Statement::Ddl(ddl) = bind("CREATE INDEX idx_order_user ON t_order (user_id)").unwrap().statement else {
            panic!("expected DDL");
        };
        assert_eq!(ddl.kind, DdlKind::CreateIndex);
        assert_eq!(ddl.indexes[0].value, "idx_order_user");
        assert_eq!(ddl.tables[0].logic_name(), "t_order");

        let Statement::Ddl(drop) = bind("DROP TABLE IF EXISTS t_order, t_config").unwrap().statement else {
            panic!("expected DDL");
        };
        assert_eq!(drop.tables.len(), 2);

        let Statement::Dal(dal) = bind("SHOW COLUMNS FROM t_order").unwrap().statement else {
            panic!("expected DAL");
        };
        assert_eq!(dal.kind, DalKind::DescribeTable);

        let Statement::Dcl(dcl) = bind("GRANT SELECT ON db.t_order TO app_user").unwrap().statement else {
            panic!("expected DCL");
        };
        assert_eq!(dcl.tables[0].logic_name(), "t_order");

        let Statement::Dcl(global) = bind("GRANT ALL ON *.* TO app_user").unwrap().statement else {
            panic!("expected DCL");
        };
        assert!(global.tables.is_empty());

        assert_eq!(bind("START TRANSACTION;").unwrap().statement, Statement::Tcl(TclKind::Begin));
    }

    #[test]
    fn test_lock_clause_is_not_a_read_query() {
        assert!(bind("SELECT * FROM t_order").unwrap().is_read_query());
        assert!(!bind("SELECT * FROM t_order FOR UPDATE").unwrap().is_read_query());
    }

    #[test]
    fn test_inline_hint() {
        let bound = bind("/* ROUTE_HINT: DATA_SOURCE_NAME=ds_1, WRITE_ROUTE_ONLY=true */ SELECT 1").unwrap();
        assert_eq!(bound.inline_hint.data_source.as_deref(), Some("ds_1"));
        assert!(bound.inline_hint.write_route_only);
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(bind("   "), Err(AppError::Validation(_))));
        assert!(matches!(bind("SELECT FROM"), Err(AppError::InvalidSql(_))));
        assert!(matches!(
            bind("INSERT INTO t_order SELECT * FROM t_order"),
            Err(AppError::UnsupportedConstruct(_))
        ));
        assert!(matches!(
            bind("SELECT 1 FROM a UNION SELECT 2 FROM b"),
            Err(AppError::UnsupportedConstruct(_))
        ));
    }
}
