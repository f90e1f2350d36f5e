// SQL tokens: byte-range edit instructions rendered once per (route unit, table group).

use serde_json::Value;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::route::{find_actual_table, DataNode, RouteMapper, RouteUnit};
use crate::models::statement::{Identifier, Operand, Span};
use crate::services::algorithm::Encryptor;

/// Edit instruction over the original SQL.
///
/// A replacement token covers the closed range `[start_index, stop_index]`; an insertion
/// token has no stop index and puts its text before `start_index`.
#[derive(Debug, Clone)]
pub struct SqlToken {
    pub start_index: usize,
    pub stop_index: Option<usize>,
    pub kind: TokenKind,
}

impl SqlToken {
    pub fn replace(span: Span, kind: TokenKind) -> Self {
        Self {
            start_index: span.start,
            stop_index: Some(span.stop),
            kind,
        }
    }

    pub fn insert(start_index: usize, kind: TokenKind) -> Self {
        Self {
            start_index,
            stop_index: None,
            kind,
        }
    }

    pub fn render(&self, context: &RenderContext<'_>) -> Result<Rendered, AppError> {
        self.kind.render(context)
    }
}

/// Everything a token may look at while rendering
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub sql: &'a str,
    pub unit: &'a RouteUnit,
    pub group: &'a [RouteMapper],
    pub parameters: &'a [Value],
}

impl RenderContext<'_> {
    /// Actual name of `logic_table` for the group being rendered, the logical name when unmapped
    pub fn actual_table<'b>(&'b self, logic_table: &'b str) -> &'b str {
        find_actual_table(self.group, logic_table).unwrap_or(logic_table)
    }

    /// Whether `node` is the target currently being rendered
    fn is_current(&self, logic_table: &str, node: &DataNode) -> bool {
        node.data_source == self.unit.logic_data_source()
            && find_actual_table(self.group, logic_table) == Some(node.table.as_str())
    }
}

/// Rendered text plus the parameters for the markers it contains, left to right
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    pub text: String,
    pub parameters: Vec<Value>,
}

impl Rendered {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    fn push(&mut self, other: Rendered) {
        self.text.push_str(&other.text);
        self.parameters.extend(other.parameters);
    }
}

#[derive(Debug, Clone)]
pub enum TokenKind {
    /// Logical table name, rendered as the actual table of the current group
    Table {
        logic_table: String,
        quote: Option<char>,
    },
    /// Index name, suffixed with the actual table of the current group
    Index {
        logic_table: Option<String>,
        index: Identifier,
    },
    /// Fixed text, the same for every target
    Text(String),
    /// Single value, e.g. an encrypted predicate operand or a rewritten LIMIT value
    Value(ValueItem),
    /// Extra columns such as derived projections or an implicit ORDER BY clause
    DerivedColumns {
        prefix: String,
        items: Vec<DerivedColumn>,
    },
    /// Whole VALUES list; rows not routed to the current target are dropped
    InsertValues {
        logic_table: String,
        rows: Vec<InsertValueRow>,
    },
    /// `col = value, col2 = value2`
    Assignments(Vec<(String, ValueItem)>),
}

impl TokenKind {
    fn render(&self, context: &RenderContext<'_>) -> Result<Rendered, AppError> {
        match self {
            TokenKind::Table { logic_table, quote } => {
                Ok(Rendered::text(quoted(context.actual_table(logic_table), *quote)))
            }
            TokenKind::Index { logic_table, index } => {
                let name = match logic_table
                    .as_deref()
                    .and_then(|table| find_actual_table(context.group, table).filter(|actual| *actual != table))
                {
                    Some(actual) => format!("{}_{}", index.value, actual),
                    None => index.value.clone(),
                };
                Ok(Rendered::text(quoted(&name, index.quote)))
            }
            TokenKind::Text(text) => Ok(Rendered::text(text.clone())),
            TokenKind::Value(item) => item.render(context),
            TokenKind::DerivedColumns { prefix, items } => {
                let columns: Vec<String> = items.iter().map(|item| item.render(context)).collect();
                Ok(Rendered::text(format!("{}{}", prefix, columns.join(", "))))
            }
            TokenKind::InsertValues { logic_table, rows } => {
                let mut rendered = Rendered::default();
                let mut first = true;
                for row in rows {
                    if !row.data_nodes.is_empty()
                        && !row.data_nodes.iter().any(|node| context.is_current(logic_table, node))
                    {
                        continue;
                    }
                    if !first {
                        rendered.text.push_str(", ");
                    }
                    first = false;
                    rendered.text.push('(');
                    for (position, item) in row.items.iter().enumerate() {
                        if position > 0 {
                            rendered.text.push_str(", ");
                        }
                        rendered.push(item.render(context)?);
                    }
                    rendered.text.push(')');
                }
                Ok(rendered)
            }
            TokenKind::Assignments(items) => {
                let mut rendered = Rendered::default();
                for (position, (column, item)) in items.iter().enumerate() {
                    if position > 0 {
                        rendered.text.push_str(", ");
                    }
                    rendered.text.push_str(column);
                    rendered.text.push_str(" = ");
                    rendered.push(item.render(context)?);
                }
                Ok(rendered)
            }
        }
    }
}

/// One value slot inside a token
#[derive(Debug, Clone)]
pub enum ValueItem {
    /// Original expression text; markers inside it keep their original parameter values
    Original { span: Span, markers: Vec<usize> },
    /// Operand encrypted at render time
    Encrypted {
        operand: Operand,
        encryptor: Arc<dyn Encryptor>,
    },
    /// Inline SQL literal
    Literal(Value),
    /// `?` bound to a replacement value
    Bound(Value),
}

impl ValueItem {
    fn render(&self, context: &RenderContext<'_>) -> Result<Rendered, AppError> {
        match self {
            ValueItem::Original { span, markers } => {
                let mut parameters = Vec::with_capacity(markers.len());
                for index in markers {
                    parameters.push(parameter(context.parameters, *index)?);
                }
                Ok(Rendered {
                    text: span.text(context.sql).to_string(),
                    parameters,
                })
            }
            ValueItem::Encrypted { operand, encryptor } => match operand {
                Operand::Parameter(index) => {
                    let plain = parameter(context.parameters, *index)?;
                    Ok(Rendered {
                        text: "?".to_string(),
                        parameters: vec![encryptor.encrypt(&plain)?],
                    })
                }
                Operand::Literal(plain) => Ok(Rendered::text(to_sql_literal(&encryptor.encrypt(plain)?))),
            },
            ValueItem::Literal(value) => Ok(Rendered::text(to_sql_literal(value))),
            ValueItem::Bound(value) => Ok(Rendered {
                text: "?".to_string(),
                parameters: vec![value.clone()],
            }),
        }
    }
}

/// Derived column reference; the owner follows the table rename when it names a table
#[derive(Debug, Clone)]
pub struct DerivedColumn {
    pub owner: Option<ColumnOwner>,
    pub expression: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ColumnOwner {
    pub text: String,
    /// Set when the owner is an unaliased table name
    pub logic_table: Option<String>,
}

impl DerivedColumn {
    fn render(&self, context: &RenderContext<'_>) -> String {
        let mut text = String::new();
        if let Some(owner) = &self.owner {
            match &owner.logic_table {
                Some(table) => text.push_str(context.actual_table(table)),
                None => text.push_str(&owner.text),
            }
            text.push('.');
        }
        text.push_str(&self.expression);
        if let Some(alias) = &self.alias {
            text.push_str(" AS ");
            text.push_str(alias);
        }
        text
    }
}

#[derive(Debug, Clone)]
pub struct InsertValueRow {
    pub items: Vec<ValueItem>,
    /// Targets this row was routed to; empty means every target
    pub data_nodes: Vec<DataNode>,
}

fn parameter(parameters: &[Value], index: usize) -> Result<Value, AppError> {
    parameters.get(index).cloned().ok_or_else(|| {
        AppError::Validation(format!(
            "Missing value for parameter {} ({} supplied)",
            index + 1,
            parameters.len()
        ))
    })
}

pub fn quoted(name: &str, quote: Option<char>) -> String {
    match quote {
        Some('[') => format!("[{}]", name),
        Some(quote) => format!("{}{}{}", quote, name, quote),
        None => name.to_string(),
    }
}

/// MySQL literal text for a JSON value
pub fn to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => quote_string(text),
        other => quote_string(&other.to_string()),
    }
}

fn quote_string(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 2);
    result.push('\'');
    for ch in text.chars() {
        match ch {
            '\'' => result.push_str("''"),
            '\\' => result.push_str("\\\\"),
            other => result.push(other),
        }
    }
    result.push('\'');
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit() -> RouteUnit {
        RouteUnit::new(RouteMapper::identity("ds_1"))
    }

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(to_sql_literal(&json!(null)), "NULL");
        assert_eq!(to_sql_literal(&json!(42)), "42");
        assert_eq!(to_sql_literal(&json!(true)), "TRUE");
        assert_eq!(to_sql_literal(&json!("it's")), "'it''s'");
        assert_eq!(to_sql_literal(&json!("a\\b")), "'a\\\\b'");
    }

    #[test]
    fn test_table_and_index_render_per_group() {
        let unit = unit();
        let group = vec![RouteMapper::new("t_order", "t_order_1")];
        let context = RenderContext {
            sql: "",
            unit: &unit,
            group: &group,
            parameters: &[],
        };
        let table = TokenKind::Table {
            logic_table: "t_order".to_string(),
            quote: Some('`'),
        };
        assert_eq!(table.render(&context).unwrap().text, "`t_order_1`");

        let index = TokenKind::Index {
            logic_table: Some("t_order".to_string()),
            index: Identifier {
                value: "idx_user".to_string(),
                quote: None,
                span: Span::new(0, 7),
            },
        };
        assert_eq!(index.render(&context).unwrap().text, "idx_user_t_order_1");

        let unknown = TokenKind::Table {
            logic_table: "t_config".to_string(),
            quote: None,
        };
        assert_eq!(unknown.render(&context).unwrap().text, "t_config");
    }

    #[test]
    fn test_insert_values_keep_only_current_rows() {
        let sql = "(?, 1), (?, 2)";
        let unit = unit();
        let group = vec![RouteMapper::new("t_order", "t_order_1")];
        let rows = vec![
            InsertValueRow {
                items: vec![
                    ValueItem::Original {
                        span: Span::new(1, 1),
                        markers: vec![0],
                    },
                    ValueItem::Original {
                        span: Span::new(4, 4),
                        markers: vec![],
                    },
                ],
                data_nodes: vec![DataNode::new("ds_0", "t_order_0")],
            },
            InsertValueRow {
                items: vec![
                    ValueItem::Original {
                        span: Span::new(9, 9),
                        markers: vec![1],
                    },
                    ValueItem::Literal(json!(7)),
                ],
                data_nodes: vec![DataNode::new("ds_1", "t_order_1")],
            },
        ];
        let token = TokenKind::InsertValues {
            logic_table: "t_order".to_string(),
            rows,
        };
        let parameters = vec![json!("a"), json!("b")];
        let context = RenderContext {
            sql,
            unit: &unit,
            group: &group,
            parameters: &parameters,
        };
        let rendered = token.render(&context).unwrap();
        assert_eq!(rendered.text, "(?, 7)");
        assert_eq!(rendered.parameters, vec![json!("b")]);
    }

    #[test]
    fn test_derived_owner_follows_table_rename() {
        let unit = unit();
        let group = vec![RouteMapper::new("t_order", "t_order_0")];
        let context = RenderContext {
            sql: "",
            unit: &unit,
            group: &group,
            parameters: &[],
        };
        let token = TokenKind::DerivedColumns {
            prefix: ", ".to_string(),
            items: vec![DerivedColumn {
                owner: Some(ColumnOwner {
                    text: "t_order".to_string(),
                    logic_table: Some("t_order".to_string()),
                }),
                expression: "status".to_string(),
                alias: Some("ORDER_BY_DERIVED_0".to_string()),
            }],
        };
        assert_eq!(
            token.render(&context).unwrap().text,
            ", t_order_0.status AS ORDER_BY_DERIVED_0"
        );
    }
}
