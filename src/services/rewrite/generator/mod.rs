pub mod encrypt;
pub mod sharding;

use super::token::{InsertValueRow, SqlToken, TokenKind};
use super::{RewriteContext, SqlTokenGenerator};
use crate::models::statement::Statement;

/// Registration order is the tie-break order for tokens sharing a start index
pub fn builtin_generators() -> Vec<Box<dyn SqlTokenGenerator>> {
    vec![
        Box::new(sharding::TableTokenGenerator),
        Box::new(sharding::IndexTokenGenerator),
        Box::new(sharding::ProjectionsTokenGenerator),
        Box::new(sharding::OrderByTokenGenerator),
        Box::new(sharding::PaginationTokenGenerator),
        Box::new(sharding::ShardingInsertValuesTokenGenerator),
        Box::new(sharding::GeneratedKeyTokenGenerator),
        Box::new(encrypt::EncryptProjectionTokenGenerator),
        Box::new(encrypt::EncryptPredicateTokenGenerator),
        Box::new(encrypt::EncryptInsertTokenGenerator),
        Box::new(encrypt::EncryptAssignmentTokenGenerator),
    ]
}

/// Rows of the VALUES token, added on first use with every value kept as written
pub(crate) fn insert_value_rows<'t>(
    context: &RewriteContext<'_>,
    tokens: &'t mut Vec<SqlToken>,
) -> Option<&'t mut Vec<InsertValueRow>> {
    let Statement::Insert(insert) = &context.bound.statement else {
        return None;
    };
    let span = insert.values_span()?;
    let position = match tokens
        .iter()
        .position(|token| matches!(token.kind, TokenKind::InsertValues { .. }))
    {
        Some(position) => position,
        None => {
            let rows = insert
                .values
                .iter()
                .map(|row| InsertValueRow {
                    items: row.values.iter().map(|expr| context.original(expr)).collect(),
                    data_nodes: Vec::new(),
                })
                .collect();
            tokens.push(SqlToken::replace(
                span,
                TokenKind::InsertValues {
                    logic_table: insert.table.logic_name().to_string(),
                    rows,
                },
            ));
            tokens.len() - 1
        }
    };
    match &mut tokens[position].kind {
        TokenKind::InsertValues { rows, .. } => Some(rows),
        _ => None,
    }
}
