// Rewrite assembler: applies tokens to the logical SQL for one (route unit, table group).

use serde_json::Value;

use super::token::{RenderContext, SqlToken};
use crate::api::middleware::AppError;
use crate::models::route::{RouteMapper, RouteUnit};
use crate::models::statement::ParameterMarker;

/// Tokens sorted by start index, ties kept in registration order.
///
/// Panics when two tokens overlap: the generators produced inconsistent edits and the
/// resulting SQL could not be trusted.
pub fn sort_tokens(tokens: &mut [SqlToken]) {
    tokens.sort_by_key(|token| token.start_index);
    let mut cursor = 0usize;
    for token in tokens.iter() {
        assert!(
            token.start_index >= cursor,
            "overlapping SQL tokens at byte {} (previous token ends before byte {})",
            token.start_index,
            cursor
        );
        if let Some(stop) = token.stop_index {
            assert!(
                stop >= token.start_index,
                "SQL token stop {} before start {}",
                stop,
                token.start_index
            );
            cursor = stop + 1;
        }
    }
}

/// Render `sql` with sorted `tokens` against one target.
///
/// Untouched text is copied verbatim and its parameter markers keep their original values;
/// markers inside a token are replaced by whatever the token renders.
pub fn assemble(
    sql: &str,
    tokens: &[SqlToken],
    markers: &[ParameterMarker],
    parameters: &[Value],
    unit: &RouteUnit,
    group: &[RouteMapper],
) -> Result<(String, Vec<Value>), AppError> {
    let context = RenderContext {
        sql,
        unit,
        group,
        parameters,
    };
    let mut result = String::with_capacity(sql.len() + 16);
    let mut rebuilt = Vec::with_capacity(parameters.len());
    let mut cursor = 0usize;

    for token in tokens {
        copy_untouched(sql, cursor, token.start_index, markers, parameters, &mut result, &mut rebuilt)?;
        let rendered = token.render(&context)?;
        result.push_str(&rendered.text);
        rebuilt.extend(rendered.parameters);
        cursor = match token.stop_index {
            Some(stop) => stop + 1,
            None => token.start_index,
        };
    }
    copy_untouched(sql, cursor, sql.len(), markers, parameters, &mut result, &mut rebuilt)?;
    Ok((result, rebuilt))
}

fn copy_untouched(
    sql: &str,
    from: usize,
    to: usize,
    markers: &[ParameterMarker],
    parameters: &[Value],
    result: &mut String,
    rebuilt: &mut Vec<Value>,
) -> Result<(), AppError> {
    if from >= to {
        return Ok(());
    }
    result.push_str(&sql[from..to]);
    for marker in markers.iter().filter(|marker| marker.span.start >= from && marker.span.start < to) {
        let value = parameters.get(marker.index).cloned().ok_or_else(|| {
            AppError::Validation(format!(
                "Missing value for parameter {} ({} supplied)",
                marker.index + 1,
                parameters.len()
            ))
        })?;
        rebuilt.push(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::statement::Span;
    use crate::services::rewrite::token::TokenKind;
    use serde_json::json;

    fn table_token(start: usize, stop: usize) -> SqlToken {
        SqlToken::replace(
            Span::new(start, stop),
            TokenKind::Table {
                logic_table: "t_order".to_string(),
                quote: None,
            },
        )
    }

    #[test]
    fn test_table_rename_round_trip() {
        let sql = "SELECT * FROM t_order";
        let unit = RouteUnit::new(RouteMapper::identity("ds_1"));
        let group = vec![RouteMapper::new("t_order", "t_order_1")];
        let mut tokens = vec![table_token(14, 20)];
        sort_tokens(&mut tokens);
        let (rewritten, parameters) = assemble(sql, &tokens, &[], &[], &unit, &group).unwrap();
        assert_eq!(rewritten, "SELECT * FROM t_order_1");
        assert!(parameters.is_empty());
    }

    #[test]
    fn test_parameters_rebuilt_in_order() {
        let sql = "SELECT * FROM t_order WHERE a = ? AND b = ? LIMIT ?";
        let markers = vec![
            ParameterMarker {
                index: 0,
                span: Span::new(32, 32),
            },
            ParameterMarker {
                index: 1,
                span: Span::new(42, 42),
            },
            ParameterMarker {
                index: 2,
                span: Span::new(50, 50),
            },
        ];
        let parameters = vec![json!(1), json!(2), json!(10)];
        let unit = RouteUnit::new(RouteMapper::identity("ds_0"));
        let group = vec![RouteMapper::new("t_order", "t_order_0")];
        let mut tokens = vec![
            SqlToken::replace(
                Span::new(50, 50),
                TokenKind::Value(crate::services::rewrite::token::ValueItem::Bound(json!(15))),
            ),
            table_token(14, 20),
            SqlToken::insert(8, TokenKind::Text(", x".to_string())),
        ];
        sort_tokens(&mut tokens);
        let (rewritten, rebuilt) = assemble(sql, &tokens, &markers, &parameters, &unit, &group).unwrap();
        assert_eq!(
            rewritten,
            "SELECT *, x FROM t_order_0 WHERE a = ? AND b = ? LIMIT ?"
        );
        assert_eq!(rebuilt, vec![json!(1), json!(2), json!(15)]);
    }

    #[test]
    #[should_panic(expected = "overlapping SQL tokens")]
    fn test_overlapping_tokens_panic() {
        let mut tokens = vec![table_token(14, 20), table_token(18, 22)];
        sort_tokens(&mut tokens);
    }
}
