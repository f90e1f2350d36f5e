// Sharding token generators: table and index renames, derived columns for cross-shard
// merging, pagination, and INSERT rows/keys.

use serde_json::{json, Value};
use std::collections::HashSet;

use super::insert_value_rows;
use crate::api::middleware::AppError;
use crate::models::statement::{
    Identifier, OrderByKey, OrderBySegment, Operand, Projection, SelectStatement,
    Statement, TableSegment,
};
use crate::services::rewrite::token::{
    to_sql_literal, ColumnOwner, DerivedColumn, SqlToken, TokenKind, ValueItem,
};
use crate::services::rewrite::{RewriteContext, SqlTokenGenerator};

fn touches_sharding_table(context: &RewriteContext<'_>) -> bool {
    let tables = context.bound.table_names();
    !context.model.sharding.sharding_logic_tables(&tables).is_empty()
}

/// Unaliased sharded tables: their names double as column owners
fn owner_tables<'s>(context: &RewriteContext<'_>, tables: &[&'s TableSegment]) -> Vec<&'s TableSegment> {
    tables
        .iter()
        .filter(|table| table.alias.is_none() && context.model.sharding.is_sharding_table(table.logic_name()))
        .copied()
        .collect()
}

fn shorthand_owners<'a>(select: &'a SelectStatement, result: &mut Vec<&'a Identifier>) {
    for projection in &select.projections.items {
        if let Projection::Shorthand { owner: Some(owner), .. } = projection {
            result.push(owner);
        }
    }
    for derived in &select.derived {
        shorthand_owners(derived, result);
    }
    for query in select.subqueries() {
        shorthand_owners(query, result);
    }
}

/// Logical table names rendered as the actual table of each target
pub struct TableTokenGenerator;

impl SqlTokenGenerator for TableTokenGenerator {
    fn name(&self) -> &'static str {
        "TableTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        context.route_context.contains_table_sharding()
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let rule = &context.model.sharding;
        let tables = context.bound.tables();
        let mut seen: HashSet<usize> = HashSet::new();
        for table in &tables {
            if rule.is_sharding_table(table.logic_name()) && seen.insert(table.name.span.start) {
                tokens.push(table_token(&table.name, table.logic_name()));
            }
        }

        let owners = owner_tables(context, &tables);
        if owners.is_empty() {
            return Ok(());
        }
        let mut qualified: Vec<&Identifier> = Vec::new();
        context.bound.visit_columns(&mut |column| {
            if let Some(owner) = &column.owner {
                qualified.push(owner);
            }
        });
        if let Statement::Select(select) = &context.bound.statement {
            shorthand_owners(select, &mut qualified);
        }
        for owner in qualified {
            let Some(table) = owners.iter().find(|table| owner.eq_ignore_case(table.logic_name())) else {
                continue;
            };
            if seen.insert(owner.span.start) {
                tokens.push(table_token(owner, table.logic_name()));
            }
        }
        Ok(())
    }
}

fn table_token(identifier: &Identifier, logic_table: &str) -> SqlToken {
    SqlToken::replace(
        identifier.span,
        TokenKind::Table {
            logic_table: logic_table.to_string(),
            quote: identifier.quote,
        },
    )
}

/// `CREATE INDEX idx ...` / `DROP INDEX idx` become `idx_<actual table>`
pub struct IndexTokenGenerator;

impl SqlTokenGenerator for IndexTokenGenerator {
    fn name(&self) -> &'static str {
        "IndexTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(&context.bound.statement, Statement::Ddl(ddl) if !ddl.indexes.is_empty())
            && context.route_context.contains_table_sharding()
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let Statement::Ddl(ddl) = &context.bound.statement else {
            return Ok(());
        };
        let rule = &context.model.sharding;
        for index in &ddl.indexes {
            let logic_table = ddl
                .tables
                .first()
                .map(|table| table.logic_name())
                .or_else(|| rule.find_table_by_index(&index.value))
                .filter(|table| rule.is_sharding_table(table))
                .map(str::to_string);
            tokens.push(SqlToken::replace(
                index.span,
                TokenKind::Index {
                    logic_table,
                    index: index.clone(),
                },
            ));
        }
        Ok(())
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn owners_match(left: Option<&Identifier>, right: Option<&Identifier>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => left.eq_ignore_case(&right.value),
        _ => true,
    }
}

/// Whether the select list already yields the value of an ORDER BY / GROUP BY key
fn is_projected(select: &SelectStatement, key: &OrderByKey, sql: &str) -> bool {
    let items = &select.projections.items;
    match key {
        OrderByKey::Position(_) => true,
        OrderByKey::Column(column) => items.iter().any(|projection| match projection {
            Projection::Shorthand { owner, .. } => owners_match(owner.as_ref(), column.owner.as_ref()),
            Projection::Column {
                column: projected,
                alias,
                ..
            } => {
                (projected.name.eq_ignore_case(&column.name.value)
                    && owners_match(projected.owner.as_ref(), column.owner.as_ref()))
                    || (column.owner.is_none()
                        && alias.as_ref().is_some_and(|alias| alias.eq_ignore_case(&column.name.value)))
            }
            other => {
                column.owner.is_none()
                    && other.alias().is_some_and(|alias| alias.eq_ignore_case(&column.name.value))
            }
        }),
        OrderByKey::Expression(expr) => {
            let wanted = normalize(expr.span().text(sql));
            items.iter().any(|projection| match projection {
                Projection::Expression { expr: projected, .. } => normalize(projected.span().text(sql)) == wanted,
                Projection::Aggregation { span, inner, .. } => {
                    normalize(&sql[span.start..=inner.stop + 1]) == wanted
                }
                _ => false,
            })
        }
    }
}

/// Column key as a derived column, with the owner following table renames
fn derived_column(
    context: &RewriteContext<'_>,
    owners: &[&TableSegment],
    key: &OrderByKey,
    alias: Option<String>,
    fallback: &str,
) -> DerivedColumn {
    let sql = context.sql();
    match key {
        OrderByKey::Column(column) => DerivedColumn {
            owner: column.owner.as_ref().map(|owner| ColumnOwner {
                text: owner.span.text(sql).to_string(),
                logic_table: owners
                    .iter()
                    .find(|table| owner.eq_ignore_case(table.logic_name()))
                    .map(|table| table.logic_name().to_string()),
            }),
            expression: column.name.span.text(sql).to_string(),
            alias,
        },
        OrderByKey::Expression(expr) => DerivedColumn {
            owner: None,
            expression: expr.span().text(sql).to_string(),
            alias,
        },
        OrderByKey::Position(_) => DerivedColumn {
            owner: None,
            expression: fallback.to_string(),
            alias,
        },
    }
}

/// Projections a merge engine needs but the query does not select: ORDER BY and GROUP BY
/// keys, and COUNT/SUM companions of every AVG
pub struct ProjectionsTokenGenerator;

impl SqlTokenGenerator for ProjectionsTokenGenerator {
    fn name(&self) -> &'static str {
        "ProjectionsTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(context.bound.statement, Statement::Select(_)) && touches_sharding_table(context)
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let Statement::Select(select) = &context.bound.statement else {
            return Ok(());
        };
        let sql = context.sql();

        let mut avg_index = 0;
        for projection in &select.projections.items {
            if let Projection::Aggregation {
                kind: crate::models::statement::AggregationKind::Avg,
                distinct,
                inner,
                span,
                ..
            } = projection
            {
                let argument = format!(
                    "{}{}",
                    if *distinct { "DISTINCT " } else { "" },
                    inner.text(sql).trim()
                );
                tokens.push(SqlToken::insert(
                    span.stop + 1,
                    TokenKind::Text(format!(
                        ", COUNT({arg}) AS AVG_DERIVED_COUNT_{n}, SUM({arg}) AS AVG_DERIVED_SUM_{n}",
                        arg = argument,
                        n = avg_index
                    )),
                ));
                avg_index += 1;
            }
        }

        let tables: Vec<&TableSegment> = select.from.iter().collect();
        let owners = owner_tables(context, &tables);
        let mut items: Vec<DerivedColumn> = Vec::new();
        let mut derived_keys: Vec<String> = Vec::new();
        for (segment, prefix) in [(&select.order_by, "ORDER_BY"), (&select.group_by, "GROUP_BY")] {
            let Some(segment) = segment else {
                continue;
            };
            let mut n = 0;
            for item in &segment.items {
                if is_projected(select, &item.key, sql) {
                    continue;
                }
                let key_text = normalize(key_span_text(&item.key, sql).unwrap_or_default());
                if derived_keys.contains(&key_text) {
                    continue;
                }
                derived_keys.push(key_text);
                items.push(derived_column(
                    context,
                    &owners,
                    &item.key,
                    Some(format!("{}_DERIVED_{}", prefix, n)),
                    "",
                ));
                n += 1;
            }
        }
        if !items.is_empty() {
            tokens.push(SqlToken::insert(
                select.projections.span.stop + 1,
                TokenKind::DerivedColumns {
                    prefix: ", ".to_string(),
                    items,
                },
            ));
        }
        Ok(())
    }
}

fn key_span_text<'s>(key: &OrderByKey, sql: &'s str) -> Option<&'s str> {
    match key {
        OrderByKey::Column(column) => Some(column.span().text(sql)),
        OrderByKey::Expression(expr) => Some(expr.span().text(sql)),
        OrderByKey::Position(_) => None,
    }
}

/// Whether ORDER BY and GROUP BY name the same keys in the same order
fn same_group_and_order(group_by: &OrderBySegment, order_by: Option<&OrderBySegment>, sql: &str) -> bool {
    let Some(order_by) = order_by else {
        return true;
    };
    group_by.items.len() == order_by.items.len()
        && group_by.items.iter().zip(&order_by.items).all(|(group, order)| {
            match (key_span_text(&group.key, sql), key_span_text(&order.key, sql)) {
                (Some(group), Some(order)) => normalize(group) == normalize(order),
                _ => group.key == order.key,
            }
        })
}

/// GROUP BY without ORDER BY gets an explicit ORDER BY on the grouping keys so every
/// shard returns rows in merge order
pub struct OrderByTokenGenerator;

impl SqlTokenGenerator for OrderByTokenGenerator {
    fn name(&self) -> &'static str {
        "OrderByTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(&context.bound.statement, Statement::Select(select)
            if select.group_by.is_some() && select.order_by.is_none())
            && !context.route_context.is_single_routing()
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let Statement::Select(select) = &context.bound.statement else {
            return Ok(());
        };
        let Some(group_by) = &select.group_by else {
            return Ok(());
        };
        let sql = context.sql();
        let tables: Vec<&TableSegment> = select.from.iter().collect();
        let owners = owner_tables(context, &tables);
        let items = group_by
            .items
            .iter()
            .map(|item| derived_column(context, &owners, &item.key, None, item.span.text(sql)))
            .collect();
        let position = match &select.having {
            Some(having) => having.span.stop + 1,
            None => group_by.span.stop + 1,
        };
        tokens.push(SqlToken::insert(
            position,
            TokenKind::DerivedColumns {
                prefix: " ORDER BY ".to_string(),
                items,
            },
        ));
        Ok(())
    }
}

fn pagination_number(operand: &Operand, parameters: &[Value]) -> Result<i64, AppError> {
    let value = operand
        .resolve(parameters)
        .ok_or_else(|| AppError::Validation("Missing value for a LIMIT parameter".to_string()))?;
    let number = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    number
        .filter(|number| *number >= 0)
        .ok_or_else(|| AppError::Validation(format!("LIMIT value must be a non-negative integer, got {}", value)))
}

fn pagination_item(operand: &Operand, value: i64) -> ValueItem {
    match operand {
        Operand::Parameter(_) => ValueItem::Bound(json!(value)),
        Operand::Literal(_) => ValueItem::Literal(json!(value)),
    }
}

/// Multi-target LIMIT: every shard returns rows from 0 up to `offset + count`; grouped
/// queries sorted differently from their grouping return every row
pub struct PaginationTokenGenerator;

impl SqlTokenGenerator for PaginationTokenGenerator {
    fn name(&self) -> &'static str {
        "PaginationTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(&context.bound.statement, Statement::Select(select) if select.limit.is_some())
            && !context.route_context.is_single_routing()
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let Statement::Select(select) = &context.bound.statement else {
            return Ok(());
        };
        let Some(limit) = &select.limit else {
            return Ok(());
        };
        let offset = match &limit.offset {
            Some(offset) => pagination_number(&offset.operand, context.parameters)?,
            None => 0,
        };
        if let Some(value) = &limit.offset {
            tokens.push(SqlToken::replace(
                value.span,
                TokenKind::Value(pagination_item(&value.operand, 0)),
            ));
        }

        let Some(row_count) = &limit.row_count else {
            return Ok(());
        };
        let count = pagination_number(&row_count.operand, context.parameters)?;
        let max_rows = match &select.group_by {
            Some(group_by) => !same_group_and_order(group_by, select.order_by.as_ref(), context.sql()),
            None => select.has_aggregation(),
        };
        let rewritten = if max_rows {
            i32::MAX as i64
        } else {
            offset.saturating_add(count)
        };
        if rewritten != count {
            tokens.push(SqlToken::replace(
                row_count.span,
                TokenKind::Value(pagination_item(&row_count.operand, rewritten)),
            ));
        }
        Ok(())
    }
}

/// Multi-row INSERT: each target only receives the rows routed to it
pub struct ShardingInsertValuesTokenGenerator;

impl SqlTokenGenerator for ShardingInsertValuesTokenGenerator {
    fn name(&self) -> &'static str {
        "ShardingInsertValuesTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(&context.bound.statement, Statement::Insert(insert)
            if !insert.values.is_empty()
                && context.model.sharding.is_sharding_table(insert.table.logic_name()))
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let nodes = context.route_context.original_data_nodes();
        if let Some(rows) = insert_value_rows(context, tokens) {
            for (index, row) in rows.iter_mut().enumerate() {
                row.data_nodes = nodes.get(index).cloned().unwrap_or_default();
            }
        }
        Ok(())
    }
}

/// Appends the generated key column and one key per row
pub struct GeneratedKeyTokenGenerator;

impl SqlTokenGenerator for GeneratedKeyTokenGenerator {
    fn name(&self) -> &'static str {
        "GeneratedKeyTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        context.generated_keys.is_some() && matches!(context.bound.statement, Statement::Insert(_))
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let (Statement::Insert(insert), Some(keys)) = (&context.bound.statement, context.generated_keys) else {
            return Ok(());
        };

        if let Some(set) = &insert.set_assignments {
            let value = keys.value(0).cloned().unwrap_or(Value::Null);
            tokens.push(SqlToken::insert(
                set.span.stop + 1,
                TokenKind::Text(format!(", {} = {}", keys.column, to_sql_literal(&value))),
            ));
            return Ok(());
        }

        let Some(columns) = &insert.columns else {
            return Ok(());
        };
        let separator = if columns.columns.is_empty() { "" } else { ", " };
        tokens.push(SqlToken::insert(
            columns.span.stop,
            TokenKind::Text(format!("{}{}", separator, keys.column)),
        ));
        if let Some(rows) = insert_value_rows(context, tokens) {
            for (index, row) in rows.iter_mut().enumerate() {
                let value = keys.value(index).cloned().unwrap_or(Value::Null);
                row.items.push(ValueItem::Literal(value));
            }
        }
        Ok(())
    }
}
