// Statement Parser
//
// Recursive descent over the lexeme stream. Only the segments routing and rewriting
// need are modelled; the tail of DDL/DAL statements is skipped, since those statements
// are rewritten through their table and index names alone.

use serde_json::{Number, Value};

use super::lexer::{LexKind, Lexeme};
use crate::api::middleware::AppError;
use crate::models::statement::*;

/// Words that never start an alias or a column reference
const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CROSS", "DELETE", "DESC", "DISTINCT",
    "DIV", "ELSE", "END", "EXISTS", "FALSE", "FOR", "FORCE", "FROM", "FULL", "GROUP", "HAVING",
    "IGNORE", "IN", "INNER", "INSERT", "INTO", "IS", "JOIN", "LEFT", "LIKE", "LIMIT", "LOCK",
    "MOD", "NATURAL", "NOT", "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "REGEXP", "RIGHT",
    "RLIKE", "SELECT", "SET", "STRAIGHT_JOIN", "THEN", "TRUE", "UNION", "UPDATE", "USE", "USING",
    "VALUES", "WHEN", "WHERE", "WINDOW", "XOR",
];

/// Reserved words that are still callable as functions
const RESERVED_FUNCTIONS: &[&str] = &["MOD", "LEFT", "RIGHT", "INSERT", "VALUES"];

const AGGREGATIONS: &[&str] = &["COUNT", "SUM", "AVG", "MAX", "MIN"];

pub struct Parser<'a> {
    sql: &'a str,
    lexemes: Vec<Lexeme>,
    pos: usize,
    parameters: Vec<ParameterMarker>,
}

impl<'a> Parser<'a> {
    pub fn new(sql: &'a str, lexemes: Vec<Lexeme>) -> Self {
        Self {
            sql,
            lexemes,
            pos: 0,
            parameters: Vec::new(),
        }
    }

    /// Parse exactly one statement, optionally followed by `;`
    pub fn parse(mut self) -> Result<(Statement, Vec<ParameterMarker>), AppError> {
        let statement = self.parse_statement()?;
        self.consume(&LexKind::SemiColon);
        if let Some(extra) = self.peek() {
            return Err(self.error_at(extra.span.start, "Unexpected trailing input"));
        }
        Ok((statement, self.parameters))
    }

    // Cursor helpers

    fn peek(&self) -> Option<&Lexeme> {
        self.lexemes.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Lexeme> {
        self.lexemes.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Lexeme> {
        let lexeme = self.lexemes.get(self.pos).cloned();
        if lexeme.is_some() {
            self.pos += 1;
        }
        lexeme
    }

    fn last_stop(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|index| self.lexemes.get(index))
            .map(|lexeme| lexeme.span.stop)
            .unwrap_or(0)
    }

    fn current_offset(&self) -> usize {
        self.peek()
            .map(|lexeme| lexeme.span.start)
            .unwrap_or(self.sql.len())
    }

    fn error_at(&self, offset: usize, message: &str) -> AppError {
        AppError::InvalidSql(format!("{} at offset {}", message, offset))
    }

    fn error(&self, message: &str) -> AppError {
        self.error_at(self.current_offset(), message)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|lexeme| lexeme.is_keyword(keyword))
    }

    fn is_keyword_at(&self, offset: usize, keyword: &str) -> bool {
        self.peek_at(offset).is_some_and(|lexeme| lexeme.is_keyword(keyword))
    }

    fn parse_keyword(&mut self, keyword: &str) -> Option<Span> {
        if self.is_keyword(keyword) {
            self.advance().map(|lexeme| lexeme.span)
        } else {
            None
        }
    }

    /// Consume the whole keyword sequence or nothing
    fn parse_keywords(&mut self, keywords: &[&str]) -> Option<Span> {
        let matched = keywords
            .iter()
            .enumerate()
            .all(|(offset, keyword)| self.is_keyword_at(offset, keyword));
        if !matched {
            return None;
        }
        let start = self.current_offset();
        self.pos += keywords.len();
        Some(Span::new(start, self.last_stop()))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<Span, AppError> {
        self.parse_keyword(keyword)
            .ok_or_else(|| self.error(&format!("Expected {}", keyword)))
    }

    fn check(&self, kind: &LexKind) -> bool {
        self.peek().is_some_and(|lexeme| &lexeme.kind == kind)
    }

    fn consume(&mut self, kind: &LexKind) -> Option<Span> {
        if self.check(kind) {
            self.advance().map(|lexeme| lexeme.span)
        } else {
            None
        }
    }

    fn expect(&mut self, kind: &LexKind, what: &str) -> Result<Span, AppError> {
        self.consume(kind)
            .ok_or_else(|| self.error(&format!("Expected {}", what)))
    }

    fn skip_rest(&mut self) {
        while let Some(lexeme) = self.peek() {
            if lexeme.kind == LexKind::SemiColon {
                break;
            }
            self.pos += 1;
        }
    }

    /// Skip a parenthesised group starting at the current `(`
    fn skip_parenthesized(&mut self) -> Result<Span, AppError> {
        let start = self.expect(&LexKind::LParen, "`(`")?.start;
        let mut depth = 1usize;
        while depth > 0 {
            match self.advance() {
                Some(Lexeme {
                    kind: LexKind::LParen,
                    ..
                }) => depth += 1,
                Some(Lexeme {
                    kind: LexKind::RParen,
                    ..
                }) => depth -= 1,
                Some(_) => {}
                None => return Err(self.error("Unbalanced parentheses")),
            }
        }
        Ok(Span::new(start, self.last_stop()))
    }

    fn is_reserved(lexeme: &Lexeme) -> bool {
        match &lexeme.kind {
            LexKind::Word { value, quote: None } => RESERVED
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(value)),
            _ => false,
        }
    }

    /// Quoted word, or unquoted word that is not reserved
    fn at_identifier(&self) -> bool {
        self.peek().is_some_and(|lexeme| {
            matches!(lexeme.kind, LexKind::Word { .. }) && !Self::is_reserved(lexeme)
        })
    }

    fn parse_identifier(&mut self) -> Result<Identifier, AppError> {
        if !self.at_identifier() {
            return Err(self.error("Expected identifier"));
        }
        match self.advance() {
            Some(Lexeme {
                kind: LexKind::Word { value, quote },
                span,
            }) => Ok(Identifier { value, quote, span }),
            _ => Err(self.error("Expected identifier")),
        }
    }

    fn parse_optional_alias(&mut self) -> Result<Option<Identifier>, AppError> {
        if self.parse_keyword("AS").is_some() {
            if let Some(Lexeme {
                kind: LexKind::String(text),
                span,
            }) = self.peek().cloned()
            {
                self.pos += 1;
                return Ok(Some(Identifier {
                    value: text,
                    quote: Some('\''),
                    span,
                }));
            }
            return self.parse_identifier().map(Some);
        }
        if self.at_identifier() {
            return self.parse_identifier().map(Some);
        }
        Ok(None)
    }

    // Statements

    fn parse_statement(&mut self) -> Result<Statement, AppError> {
        let Some(first) = self.peek() else {
            return Err(AppError::Validation("SQL must not be empty".to_string()));
        };
        let keyword = match &first.kind {
            LexKind::Word { value, quote: None } => value.to_ascii_uppercase(),
            _ => return Err(self.error("Expected a statement keyword")),
        };
        match keyword.as_str() {
            "SELECT" => Ok(Statement::Select(self.parse_select()?)),
            "INSERT" | "REPLACE" => Ok(Statement::Insert(self.parse_insert()?)),
            "UPDATE" => Ok(Statement::Update(self.parse_update()?)),
            "DELETE" => Ok(Statement::Delete(self.parse_delete()?)),
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => self.parse_ddl(),
            "SHOW" | "DESC" | "DESCRIBE" | "EXPLAIN" | "USE" | "SET" | "OPTIMIZE" | "ANALYZE" => {
                Ok(Statement::Dal(self.parse_dal()?))
            }
            "GRANT" | "REVOKE" => Ok(Statement::Dcl(self.parse_grant()?)),
            "RENAME" if self.is_keyword_at(1, "USER") => {
                self.skip_rest();
                Ok(Statement::Dcl(DclStatement {
                    kind: DclKind::User,
                    tables: Vec::new(),
                }))
            }
            "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                Ok(Statement::Tcl(self.parse_tcl()?))
            }
            other => Err(AppError::UnsupportedConstruct(format!(
                "Statement type `{}` is not supported",
                other
            ))),
        }
    }

    pub(crate) fn parse_select(&mut self) -> Result<SelectStatement, AppError> {
        let start = self.expect_keyword("SELECT")?.start;
        let distinct =
            self.parse_keyword("DISTINCT").is_some() || self.parse_keyword("DISTINCTROW").is_some();
        if !distinct {
            self.parse_keyword("ALL");
        }
        let projections = self.parse_projections(distinct)?;

        let mut from = Vec::new();
        let mut derived = Vec::new();
        let mut join_conditions = Vec::new();
        if self.parse_keyword("FROM").is_some() {
            self.parse_table_references(&mut from, &mut derived, &mut join_conditions)?;
        }

        let where_clause = self.parse_where()?;

        let group_by = match self.parse_keywords(&["GROUP", "BY"]) {
            Some(keyword) => {
                let items = self.parse_order_items()?;
                self.parse_keywords(&["WITH", "ROLLUP"]);
                Some(OrderBySegment {
                    items,
                    span: Span::new(keyword.start, self.last_stop()),
                })
            }
            None => None,
        };

        let having = match self.parse_keyword("HAVING") {
            Some(keyword) => {
                let expr = self.parse_expr()?;
                Some(WhereSegment {
                    expr,
                    span: Span::new(keyword.start, self.last_stop()),
                })
            }
            None => None,
        };

        let order_by = self.parse_order_by()?;
        let limit = self.parse_limit()?;

        let lock = if self.parse_keywords(&["FOR", "UPDATE"]).is_some() {
            true
        } else {
            self.parse_keywords(&["LOCK", "IN", "SHARE", "MODE"]).is_some()
                || self.parse_keywords(&["FOR", "SHARE"]).is_some()
        };
        if lock {
            self.parse_keyword("NOWAIT");
            self.parse_keywords(&["SKIP", "LOCKED"]);
        }

        if self.is_keyword("UNION") {
            return Err(AppError::UnsupportedConstruct(
                "UNION across sharded queries is not supported".to_string(),
            ));
        }

        Ok(SelectStatement {
            projections,
            from,
            derived,
            join_conditions,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
            lock,
            span: Span::new(start, self.last_stop()),
        })
    }

    fn parse_projections(&mut self, distinct: bool) -> Result<ProjectionsSegment, AppError> {
        let mut items = Vec::new();
        loop {
            items.push(self.parse_projection()?);
            if self.consume(&LexKind::Comma).is_none() {
                break;
            }
        }
        let span = match (items.first(), items.last()) {
            (Some(first), Some(last)) => first.span().merge(last.span()),
            _ => return Err(self.error("Expected projection")),
        };
        Ok(ProjectionsSegment {
            distinct,
            items,
            span,
        })
    }

    fn parse_projection(&mut self) -> Result<Projection, AppError> {
        if let Some(span) = self.consume(&LexKind::Star) {
            return Ok(Projection::Shorthand { owner: None, span });
        }
        let qualified_star = self.at_identifier()
            && self.peek_at(1).is_some_and(|l| l.kind == LexKind::Period)
            && self.peek_at(2).is_some_and(|l| l.kind == LexKind::Star);
        if qualified_star {
            let owner = self.parse_identifier()?;
            self.pos += 2;
            let span = Span::new(owner.span.start, self.last_stop());
            return Ok(Projection::Shorthand {
                owner: Some(owner),
                span,
            });
        }

        let expr = self.parse_expr()?;
        let alias = self.parse_optional_alias()?;
        let span = Span::new(expr.span().start, self.last_stop());
        Ok(match expr {
            Expr::Column(column) => Projection::Column {
                column,
                alias,
                span,
            },
            Expr::Function {
                name,
                args,
                distinct,
                span: function_span,
            } if AGGREGATIONS.iter().any(|a| a.eq_ignore_ascii_case(&name)) => {
                let text = function_span.text(self.sql);
                let open = text.find('(').unwrap_or(0);
                let inner_start = function_span.start + open + 1;
                let inner = if inner_start < function_span.stop {
                    trim_span(self.sql, Span::new(inner_start, function_span.stop - 1))
                } else {
                    Span::new(function_span.stop, function_span.stop)
                };
                Projection::Aggregation {
                    kind: AggregationKind::from_name(&name).unwrap_or(AggregationKind::Count),
                    distinct,
                    inner,
                    args,
                    alias,
                    span,
                }
            }
            expr => Projection::Expression { expr, alias, span },
        })
    }

    fn parse_table_references(
        &mut self,
        tables: &mut Vec<TableSegment>,
        derived: &mut Vec<SelectStatement>,
        join_conditions: &mut Vec<Expr>,
    ) -> Result<(), AppError> {
        loop {
            self.parse_table_factor(tables, derived, join_conditions)?;
            while self.parse_join_keyword() {
                self.parse_table_factor(tables, derived, join_conditions)?;
                if self.parse_keyword("ON").is_some() {
                    join_conditions.push(self.parse_expr()?);
                } else if self.parse_keyword("USING").is_some() {
                    self.skip_parenthesized()?;
                }
            }
            if self.consume(&LexKind::Comma).is_none() {
                return Ok(());
            }
        }
    }

    fn parse_join_keyword(&mut self) -> bool {
        let sequences: &[&[&str]] = &[
            &["JOIN"],
            &["INNER", "JOIN"],
            &["CROSS", "JOIN"],
            &["STRAIGHT_JOIN"],
            &["LEFT", "JOIN"],
            &["LEFT", "OUTER", "JOIN"],
            &["RIGHT", "JOIN"],
            &["RIGHT", "OUTER", "JOIN"],
            &["NATURAL", "JOIN"],
            &["NATURAL", "LEFT", "JOIN"],
            &["NATURAL", "LEFT", "OUTER", "JOIN"],
            &["NATURAL", "RIGHT", "JOIN"],
            &["NATURAL", "RIGHT", "OUTER", "JOIN"],
        ];
        sequences
            .iter()
            .any(|keywords| self.parse_keywords(keywords).is_some())
    }

    fn parse_table_factor(
        &mut self,
        tables: &mut Vec<TableSegment>,
        derived: &mut Vec<SelectStatement>,
        join_conditions: &mut Vec<Expr>,
    ) -> Result<(), AppError> {
        if self.check(&LexKind::LParen) {
            if self.is_keyword_at(1, "SELECT") {
                self.pos += 1;
                let query = self.parse_select()?;
                self.expect(&LexKind::RParen, "`)`")?;
                self.parse_optional_alias()?;
                derived.push(query);
            } else {
                self.pos += 1;
                self.parse_table_references(tables, derived, join_conditions)?;
                self.expect(&LexKind::RParen, "`)`")?;
            }
            return Ok(());
        }
        let mut table = self.parse_table_name()?;
        table.alias = self.parse_optional_alias()?;
        self.skip_index_hints()?;
        tables.push(table);
        Ok(())
    }

    /// `USE INDEX (...)`, `FORCE KEY FOR JOIN (...)` and friends
    fn skip_index_hints(&mut self) -> Result<(), AppError> {
        while ["USE", "FORCE", "IGNORE"].iter().any(|k| self.is_keyword(k))
            && (self.is_keyword_at(1, "INDEX") || self.is_keyword_at(1, "KEY"))
        {
            self.pos += 2;
            if self.parse_keyword("FOR").is_some() {
                self.parse_keyword("JOIN");
                self.parse_keywords(&["ORDER", "BY"]);
                self.parse_keywords(&["GROUP", "BY"]);
            }
            self.skip_parenthesized()?;
        }
        Ok(())
    }

    fn parse_table_name(&mut self) -> Result<TableSegment, AppError> {
        let first = self.parse_identifier()?;
        if self.check(&LexKind::Period) {
            self.pos += 1;
            let name = self.parse_identifier()?;
            return Ok(TableSegment {
                owner: Some(first),
                name,
                alias: None,
            });
        }
        Ok(TableSegment {
            owner: None,
            name: first,
            alias: None,
        })
    }

    fn parse_table_name_list(&mut self) -> Result<Vec<TableSegment>, AppError> {
        let mut tables = vec![self.parse_table_name()?];
        while self.consume(&LexKind::Comma).is_some() {
            tables.push(self.parse_table_name()?);
        }
        Ok(tables)
    }

    fn parse_where(&mut self) -> Result<Option<WhereSegment>, AppError> {
        match self.parse_keyword("WHERE") {
            Some(keyword) => {
                let expr = self.parse_expr()?;
                Ok(Some(WhereSegment {
                    expr,
                    span: Span::new(keyword.start, self.last_stop()),
                }))
            }
            None => Ok(None),
        }
    }

    fn parse_order_by(&mut self) -> Result<Option<OrderBySegment>, AppError> {
        match self.parse_keywords(&["ORDER", "BY"]) {
            Some(keyword) => {
                let items = self.parse_order_items()?;
                Ok(Some(OrderBySegment {
                    items,
                    span: Span::new(keyword.start, self.last_stop()),
                }))
            }
            None => Ok(None),
        }
    }

    fn parse_order_items(&mut self) -> Result<Vec<OrderByItem>, AppError> {
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let start = expr.span().start;
            let key = match expr {
                Expr::Column(column) => OrderByKey::Column(column),
                Expr::Literal {
                    value: Value::Number(ref number),
                    ..
                } if number.as_u64().is_some() => {
                    OrderByKey::Position(number.as_u64().unwrap_or_default() as usize)
                }
                other => OrderByKey::Expression(other),
            };
            let direction = if self.parse_keyword("DESC").is_some() {
                OrderDirection::Desc
            } else {
                self.parse_keyword("ASC");
                OrderDirection::Asc
            };
            items.push(OrderByItem {
                key,
                direction,
                span: Span::new(start, self.last_stop()),
            });
            if self.consume(&LexKind::Comma).is_none() {
                return Ok(items);
            }
        }
    }

    fn parse_limit(&mut self) -> Result<Option<LimitSegment>, AppError> {
        let Some(keyword) = self.parse_keyword("LIMIT") else {
            return Ok(None);
        };
        let first = self.parse_pagination_value()?;
        let (offset, row_count) = if self.consume(&LexKind::Comma).is_some() {
            (Some(first), Some(self.parse_pagination_value()?))
        } else if self.parse_keyword("OFFSET").is_some() {
            (Some(self.parse_pagination_value()?), Some(first))
        } else {
            (None, Some(first))
        };
        Ok(Some(LimitSegment {
            offset,
            row_count,
            span: Span::new(keyword.start, self.last_stop()),
        }))
    }

    fn parse_pagination_value(&mut self) -> Result<PaginationValue, AppError> {
        match self.advance() {
            Some(Lexeme {
                kind: LexKind::Number(text),
                span,
            }) => {
                let value = text
                    .parse::<u64>()
                    .map_err(|_| self.error_at(span.start, "Expected a non-negative integer"))?;
                Ok(PaginationValue {
                    operand: Operand::Literal(Value::from(value)),
                    span,
                })
            }
            Some(Lexeme {
                kind: LexKind::Placeholder,
                span,
            }) => Ok(PaginationValue {
                operand: Operand::Parameter(self.add_parameter(span)),
                span,
            }),
            _ => Err(self.error("Expected LIMIT value")),
        }
    }

    fn add_parameter(&mut self, span: Span) -> usize {
        let index = self.parameters.len();
        self.parameters.push(ParameterMarker { index, span });
        index
    }

    fn parse_insert(&mut self) -> Result<InsertStatement, AppError> {
        let replace = self.parse_keyword("REPLACE").is_some();
        if !replace {
            self.expect_keyword("INSERT")?;
        }
        for modifier in ["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE"] {
            self.parse_keyword(modifier);
        }
        self.parse_keyword("INTO");
        let table = self.parse_table_name()?;

        let mut columns = None;
        if self.check(&LexKind::LParen) && !self.is_keyword_at(1, "SELECT") {
            let start = self.current_offset();
            self.pos += 1;
            let mut names = Vec::new();
            if !self.check(&LexKind::RParen) {
                loop {
                    let mut column = self.parse_identifier()?;
                    if self.consume(&LexKind::Period).is_some() {
                        column = self.parse_identifier()?;
                    }
                    names.push(column);
                    if self.consume(&LexKind::Comma).is_none() {
                        break;
                    }
                }
            }
            let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
            columns = Some(InsertColumnsSegment {
                columns: names,
                span: Span::new(start, stop),
            });
        }

        let mut values = Vec::new();
        let mut set_assignments = None;
        if self.parse_keyword("VALUES").is_some() || self.parse_keyword("VALUE").is_some() {
            loop {
                let start = self.expect(&LexKind::LParen, "`(`")?.start;
                let mut row = Vec::new();
                if !self.check(&LexKind::RParen) {
                    loop {
                        row.push(self.parse_expr()?);
                        if self.consume(&LexKind::Comma).is_none() {
                            break;
                        }
                    }
                }
                let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
                values.push(InsertValuesSegment {
                    values: row,
                    span: Span::new(start, stop),
                });
                if self.consume(&LexKind::Comma).is_none() {
                    break;
                }
            }
        } else if self.is_keyword("SET") {
            set_assignments = Some(self.parse_set_clause()?);
        } else if self.is_keyword("SELECT") || self.check(&LexKind::LParen) {
            return Err(AppError::UnsupportedConstruct(
                "INSERT ... SELECT is not supported".to_string(),
            ));
        } else {
            return Err(self.error("Expected VALUES or SET"));
        }

        let on_duplicate_key_update =
            if self.parse_keywords(&["ON", "DUPLICATE", "KEY", "UPDATE"]).is_some() {
                Some(self.parse_assignments()?)
            } else {
                None
            };

        Ok(InsertStatement {
            table,
            columns,
            values,
            set_assignments,
            on_duplicate_key_update,
            replace,
        })
    }

    /// `SET a = 1, b = ?`; the segment spans the assignments only
    fn parse_set_clause(&mut self) -> Result<SetAssignmentSegment, AppError> {
        self.expect_keyword("SET")?;
        self.parse_assignments()
    }

    fn parse_assignments(&mut self) -> Result<SetAssignmentSegment, AppError> {
        let mut assignments = Vec::new();
        loop {
            let column = self.parse_column_ref()?;
            self.expect(&LexKind::Eq, "`=`")?;
            let value = if let Some(span) = self.parse_keyword("DEFAULT") {
                Expr::Other { span }
            } else {
                self.parse_expr()?
            };
            let span = Span::new(column.span().start, self.last_stop());
            assignments.push(Assignment {
                column,
                value,
                span,
            });
            if self.consume(&LexKind::Comma).is_none() {
                break;
            }
        }
        let span = match (assignments.first(), assignments.last()) {
            (Some(first), Some(last)) => first.span.merge(last.span),
            _ => return Err(self.error("Expected assignment")),
        };
        Ok(SetAssignmentSegment { assignments, span })
    }

    fn parse_update(&mut self) -> Result<UpdateStatement, AppError> {
        self.expect_keyword("UPDATE")?;
        self.parse_keyword("LOW_PRIORITY");
        self.parse_keyword("IGNORE");
        let mut tables = Vec::new();
        let mut derived = Vec::new();
        let mut join_conditions = Vec::new();
        self.parse_table_references(&mut tables, &mut derived, &mut join_conditions)?;
        if !derived.is_empty() {
            return Err(AppError::UnsupportedConstruct(
                "UPDATE over a derived table is not supported".to_string(),
            ));
        }
        let set = self.parse_set_clause()?;
        let where_clause = self.parse_where()?;
        let order_by = self.parse_order_by()?;
        let limit = self.parse_limit()?;
        Ok(UpdateStatement {
            tables,
            set,
            where_clause,
            order_by,
            limit,
        })
    }

    fn parse_delete(&mut self) -> Result<DeleteStatement, AppError> {
        self.expect_keyword("DELETE")?;
        for modifier in ["LOW_PRIORITY", "QUICK", "IGNORE"] {
            self.parse_keyword(modifier);
        }
        if self.parse_keyword("FROM").is_none() {
            return Err(AppError::UnsupportedConstruct(
                "Multi-table DELETE is not supported".to_string(),
            ));
        }
        let mut table = self.parse_table_name()?;
        table.alias = self.parse_optional_alias()?;
        if self.is_keyword("USING") || self.check(&LexKind::Comma) {
            return Err(AppError::UnsupportedConstruct(
                "Multi-table DELETE is not supported".to_string(),
            ));
        }
        let where_clause = self.parse_where()?;
        let order_by = self.parse_order_by()?;
        let limit = self.parse_limit()?;
        Ok(DeleteStatement {
            tables: vec![table],
            where_clause,
            order_by,
            limit,
        })
    }

    fn parse_ddl(&mut self) -> Result<Statement, AppError> {
        let verb = match self.advance() {
            Some(Lexeme {
                kind: LexKind::Word { value, .. },
                ..
            }) => value.to_ascii_uppercase(),
            _ => return Err(self.error("Expected DDL keyword")),
        };

        if verb == "TRUNCATE" {
            self.parse_keyword("TABLE");
            let tables = vec![self.parse_table_name()?];
            return Ok(ddl(DdlKind::TruncateTable, tables, Vec::new()));
        }

        self.parse_keywords(&["OR", "REPLACE"]);
        self.parse_keyword("TEMPORARY");
        for modifier in ["UNIQUE", "FULLTEXT", "SPATIAL", "ONLINE", "OFFLINE"] {
            self.parse_keyword(modifier);
        }
        if self.parse_keyword("DEFINER").is_some() {
            while self.peek().is_some()
                && !self.is_keyword("FUNCTION")
                && !self.is_keyword("PROCEDURE")
            {
                self.pos += 1;
            }
        }

        let object = match self.advance() {
            Some(Lexeme {
                kind: LexKind::Word { value, .. },
                ..
            }) => value.to_ascii_uppercase(),
            _ => return Err(self.error("Expected object type")),
        };
        let statement = match (verb.as_str(), object.as_str()) {
            (_, "TABLE") => {
                let kind = match verb.as_str() {
                    "CREATE" => DdlKind::CreateTable,
                    "ALTER" => DdlKind::AlterTable,
                    _ => DdlKind::DropTable,
                };
                self.parse_keywords(&["IF", "NOT", "EXISTS"]);
                self.parse_keywords(&["IF", "EXISTS"]);
                let tables = if kind == DdlKind::DropTable {
                    self.parse_table_name_list()?
                } else {
                    vec![self.parse_table_name()?]
                };
                ddl(kind, tables, Vec::new())
            }
            ("CREATE", "INDEX") | ("DROP", "INDEX") => {
                let index = self.parse_identifier()?;
                let tables = if self.parse_keyword("USING").is_some() {
                    self.advance();
                    self.expect_keyword("ON")?;
                    vec![self.parse_table_name()?]
                } else if self.parse_keyword("ON").is_some() {
                    vec![self.parse_table_name()?]
                } else {
                    Vec::new()
                };
                let kind = if verb == "CREATE" {
                    DdlKind::CreateIndex
                } else {
                    DdlKind::DropIndex
                };
                ddl(kind, tables, vec![index])
            }
            (_, "TABLESPACE") => ddl(DdlKind::Tablespace, Vec::new(), Vec::new()),
            (_, "FUNCTION") | (_, "PROCEDURE") => ddl(DdlKind::Routine, Vec::new(), Vec::new()),
            (_, "USER") => Statement::Dcl(DclStatement {
                kind: DclKind::User,
                tables: Vec::new(),
            }),
            (verb, object) => {
                return Err(AppError::UnsupportedConstruct(format!(
                    "{} {} is not supported",
                    verb, object
                )))
            }
        };
        self.skip_rest();
        Ok(statement)
    }

    fn parse_dal(&mut self) -> Result<DalStatement, AppError> {
        let verb = match self.advance() {
            Some(Lexeme {
                kind: LexKind::Word { value, .. },
                ..
            }) => value.to_ascii_uppercase(),
            _ => return Err(self.error("Expected DAL keyword")),
        };
        let statement = match verb.as_str() {
            "SHOW" => self.parse_show()?,
            "DESC" | "DESCRIBE" | "EXPLAIN" => {
                if ["SELECT", "INSERT", "UPDATE", "DELETE", "REPLACE", "FORMAT", "ANALYZE"]
                    .iter()
                    .any(|keyword| self.is_keyword(keyword))
                {
                    return Err(AppError::UnsupportedConstruct(
                        "EXPLAIN of a statement is not supported".to_string(),
                    ));
                }
                dal(DalKind::DescribeTable, vec![self.parse_table_name()?])
            }
            "USE" => {
                self.parse_identifier()?;
                dal(DalKind::Use, Vec::new())
            }
            "SET" => dal(DalKind::Set, Vec::new()),
            "OPTIMIZE" | "ANALYZE" => {
                self.parse_keyword("NO_WRITE_TO_BINLOG");
                self.parse_keyword("LOCAL");
                self.expect_keyword("TABLE")?;
                let kind = if verb == "OPTIMIZE" {
                    DalKind::OptimizeTable
                } else {
                    DalKind::AnalyzeTable
                };
                dal(kind, self.parse_table_name_list()?)
            }
            other => {
                return Err(AppError::UnsupportedConstruct(format!(
                    "{} is not supported",
                    other
                )))
            }
        };
        self.skip_rest();
        Ok(statement)
    }

    fn parse_show(&mut self) -> Result<DalStatement, AppError> {
        self.parse_keyword("FULL");
        self.parse_keyword("EXTENDED");
        if self.parse_keyword("DATABASES").is_some() || self.parse_keyword("SCHEMAS").is_some() {
            return Ok(dal(DalKind::ShowDatabases, Vec::new()));
        }
        let describes = ["COLUMNS", "FIELDS", "INDEX", "INDEXES", "KEYS"]
            .iter()
            .any(|keyword| self.parse_keyword(keyword).is_some());
        if describes {
            if self.parse_keyword("FROM").is_none() {
                self.expect_keyword("IN")?;
            }
            return Ok(dal(DalKind::DescribeTable, vec![self.parse_table_name()?]));
        }
        if self.parse_keywords(&["CREATE", "TABLE"]).is_some() {
            return Ok(dal(DalKind::DescribeTable, vec![self.parse_table_name()?]));
        }
        Ok(dal(DalKind::Show, Vec::new()))
    }

    fn parse_grant(&mut self) -> Result<DclStatement, AppError> {
        let kind = if self.parse_keyword("GRANT").is_some() {
            DclKind::Grant
        } else {
            self.expect_keyword("REVOKE")?;
            DclKind::Revoke
        };
        while self.peek().is_some() && !self.is_keyword("ON") {
            self.pos += 1;
        }
        let mut tables = Vec::new();
        if self.parse_keyword("ON").is_some() {
            self.parse_keyword("TABLE");
            if self.consume(&LexKind::Star).is_none() {
                let first = self.parse_identifier()?;
                if self.consume(&LexKind::Period).is_some() {
                    if self.consume(&LexKind::Star).is_none() {
                        let name = self.parse_identifier()?;
                        tables.push(TableSegment {
                            owner: Some(first),
                            name,
                            alias: None,
                        });
                    }
                } else {
                    tables.push(TableSegment {
                        owner: None,
                        name: first,
                        alias: None,
                    });
                }
            }
        }
        self.skip_rest();
        Ok(DclStatement { kind, tables })
    }

    fn parse_tcl(&mut self) -> Result<TclKind, AppError> {
        let kind = if self.parse_keyword("BEGIN").is_some() {
            TclKind::Begin
        } else if self.parse_keywords(&["START", "TRANSACTION"]).is_some() {
            TclKind::Begin
        } else if self.parse_keyword("COMMIT").is_some() {
            TclKind::Commit
        } else if self.parse_keyword("ROLLBACK").is_some() {
            TclKind::Rollback
        } else if self.parse_keyword("SAVEPOINT").is_some()
            || self.parse_keywords(&["RELEASE", "SAVEPOINT"]).is_some()
        {
            TclKind::Savepoint
        } else {
            return Err(self.error("Expected transaction statement"));
        };
        self.skip_rest();
        Ok(kind)
    }

    // Expressions

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, AppError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_and()?;
        while self.parse_keyword("OR").is_some() || self.parse_keyword("XOR").is_some() {
            let right = self.parse_and()?;
            left = binary(left, BinaryOperator::Or, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_not()?;
        while self.parse_keyword("AND").is_some() {
            let right = self.parse_not()?;
            left = binary(left, BinaryOperator::And, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, AppError> {
        if let Some(keyword) = self.parse_keyword("NOT") {
            let expr = self.parse_not()?;
            let span = Span::new(keyword.start, expr.span().stop);
            return Ok(Expr::Not {
                expr: Box::new(expr),
                span,
            });
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek().map(|lexeme| &lexeme.kind) {
                Some(LexKind::Eq) => Some(BinaryOperator::Eq),
                Some(LexKind::NotEq) => Some(BinaryOperator::NotEq),
                Some(LexKind::Lt) => Some(BinaryOperator::Lt),
                Some(LexKind::LtEq) => Some(BinaryOperator::LtEq),
                Some(LexKind::Gt) => Some(BinaryOperator::Gt),
                Some(LexKind::GtEq) => Some(BinaryOperator::GtEq),
                Some(LexKind::Spaceship) => Some(BinaryOperator::NullSafeEq),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 1;
                let right = self.parse_additive()?;
                left = binary(left, op, right);
                continue;
            }
            break;
        }

        let start = left.span().start;
        if self.parse_keyword("IS").is_some() {
            let negated = self.parse_keyword("NOT").is_some();
            if self.parse_keyword("NULL").is_some() {
                return Ok(Expr::IsNull {
                    expr: Box::new(left),
                    negated,
                    span: Span::new(start, self.last_stop()),
                });
            }
            if self.parse_keyword("TRUE").is_some()
                || self.parse_keyword("FALSE").is_some()
                || self.parse_keyword("UNKNOWN").is_some()
            {
                return Ok(Expr::Other {
                    span: Span::new(start, self.last_stop()),
                });
            }
            return Err(self.error("Expected NULL, TRUE or FALSE after IS"));
        }

        let negated = self.is_keyword("NOT")
            && ["IN", "BETWEEN", "LIKE", "REGEXP", "RLIKE"]
                .iter()
                .any(|keyword| self.is_keyword_at(1, keyword));
        if negated {
            self.pos += 1;
        }

        if self.parse_keyword("IN").is_some() {
            self.expect(&LexKind::LParen, "`(`")?;
            if self.is_keyword("SELECT") {
                let query = self.parse_select()?;
                self.expect(&LexKind::RParen, "`)`")?;
                return Ok(Expr::InSubquery {
                    expr: Box::new(left),
                    query: Box::new(query),
                    negated,
                    span: Span::new(start, self.last_stop()),
                });
            }
            let mut list = Vec::new();
            loop {
                list.push(self.parse_expr()?);
                if self.consume(&LexKind::Comma).is_none() {
                    break;
                }
            }
            self.expect(&LexKind::RParen, "`)`")?;
            return Ok(Expr::In {
                expr: Box::new(left),
                list,
                negated,
                span: Span::new(start, self.last_stop()),
            });
        }
        if self.parse_keyword("BETWEEN").is_some() {
            let low = self.parse_additive()?;
            self.expect_keyword("AND")?;
            let high = self.parse_additive()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
                span: Span::new(start, self.last_stop()),
            });
        }
        if self.parse_keyword("LIKE").is_some() {
            let pattern = self.parse_additive()?;
            if self.parse_keyword("ESCAPE").is_some() {
                self.parse_primary()?;
            }
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
                span: Span::new(start, self.last_stop()),
            });
        }
        if self.parse_keyword("REGEXP").is_some() || self.parse_keyword("RLIKE").is_some() {
            let pattern = self.parse_additive()?;
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
                span: Span::new(start, self.last_stop()),
            });
        }
        if negated {
            return Err(self.error("Expected IN, BETWEEN or LIKE after NOT"));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|lexeme| &lexeme.kind) {
                Some(LexKind::Plus) => BinaryOperator::Plus,
                Some(LexKind::Minus) => BinaryOperator::Minus,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = binary(left, op, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, AppError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|lexeme| &lexeme.kind) {
                Some(LexKind::Star) => BinaryOperator::Multiply,
                Some(LexKind::Div) => BinaryOperator::Divide,
                Some(LexKind::Mod) => BinaryOperator::Modulo,
                _ if self.is_keyword("DIV") => BinaryOperator::Divide,
                _ if self.is_keyword("MOD") => BinaryOperator::Modulo,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = binary(left, op, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, AppError> {
        if let Some(minus) = self.consume(&LexKind::Minus) {
            let operand = self.parse_unary()?;
            let span = Span::new(minus.start, operand.span().stop);
            return Ok(match operand {
                Expr::Literal {
                    value: Value::Number(number),
                    ..
                } => Expr::Literal {
                    value: negate(&number),
                    span,
                },
                other => Expr::Binary {
                    left: Box::new(Expr::Literal {
                        value: Value::from(0),
                        span: minus,
                    }),
                    op: BinaryOperator::Minus,
                    right: Box::new(other),
                    span,
                },
            });
        }
        if self.consume(&LexKind::Plus).is_some() {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, AppError> {
        let Some(lexeme) = self.peek().cloned() else {
            return Err(self.error("Unexpected end of SQL"));
        };
        match lexeme.kind {
            LexKind::Placeholder => {
                self.pos += 1;
                let index = self.add_parameter(lexeme.span);
                Ok(Expr::Parameter {
                    index,
                    span: lexeme.span,
                })
            }
            LexKind::Number(text) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: parse_number(&text),
                    span: lexeme.span,
                })
            }
            LexKind::String(text) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Value::String(text),
                    span: lexeme.span,
                })
            }
            LexKind::LParen => {
                self.pos += 1;
                if self.is_keyword("SELECT") {
                    let query = self.parse_select()?;
                    let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
                    return Ok(Expr::Subquery {
                        query: Box::new(query),
                        span: Span::new(lexeme.span.start, stop),
                    });
                }
                let inner = self.parse_expr()?;
                if self.check(&LexKind::Comma) {
                    // Row constructor
                    while self.consume(&LexKind::Comma).is_some() {
                        self.parse_expr()?;
                    }
                    let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
                    return Ok(Expr::Other {
                        span: Span::new(lexeme.span.start, stop),
                    });
                }
                let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
                Ok(Expr::Nested {
                    expr: Box::new(inner),
                    span: Span::new(lexeme.span.start, stop),
                })
            }
            LexKind::Word { ref value, quote } => {
                let upper = value.to_ascii_uppercase();
                if quote.is_none() {
                    match upper.as_str() {
                        "NULL" | "TRUE" | "FALSE" => {
                            self.pos += 1;
                            let value = match upper.as_str() {
                                "TRUE" => Value::Bool(true),
                                "FALSE" => Value::Bool(false),
                                _ => Value::Null,
                            };
                            return Ok(Expr::Literal {
                                value,
                                span: lexeme.span,
                            });
                        }
                        "EXISTS" => {
                            self.pos += 1;
                            self.expect(&LexKind::LParen, "`(`")?;
                            let query = self.parse_select()?;
                            let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
                            return Ok(Expr::Exists {
                                query: Box::new(query),
                                span: Span::new(lexeme.span.start, stop),
                            });
                        }
                        "CASE" => return self.skip_case(),
                        "INTERVAL" => {
                            self.pos += 1;
                            self.parse_additive()?;
                            self.advance();
                            return Ok(Expr::Other {
                                span: Span::new(lexeme.span.start, self.last_stop()),
                            });
                        }
                        "DATE" | "TIME" | "TIMESTAMP"
                            if matches!(
                                self.peek_at(1).map(|l| &l.kind),
                                Some(LexKind::String(_))
                            ) =>
                        {
                            self.pos += 1;
                            if let Some(Lexeme {
                                kind: LexKind::String(text),
                                span,
                            }) = self.advance()
                            {
                                return Ok(Expr::Literal {
                                    value: Value::String(text),
                                    span: Span::new(lexeme.span.start, span.stop),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                if self.peek_at(1).is_some_and(|l| l.kind == LexKind::LParen)
                    && (!Self::is_reserved(&lexeme) || RESERVED_FUNCTIONS.contains(&upper.as_str()))
                {
                    return self.parse_function();
                }
                if Self::is_reserved(&lexeme) {
                    return Err(self.error(&format!("Unexpected keyword `{}`", value)));
                }
                Ok(Expr::Column(self.parse_column_ref()?))
            }
            _ => Err(self.error("Unexpected token in expression")),
        }
    }

    fn skip_case(&mut self) -> Result<Expr, AppError> {
        let start = self.expect_keyword("CASE")?.start;
        let mut depth = 1usize;
        while depth > 0 {
            if self.is_keyword("CASE") {
                depth += 1;
            } else if self.is_keyword("END") {
                depth -= 1;
            } else if self.check(&LexKind::Placeholder) {
                if let Some(span) = self.peek().map(|l| l.span) {
                    self.add_parameter(span);
                }
            }
            if self.advance().is_none() {
                return Err(self.error("CASE without END"));
            }
        }
        Ok(Expr::Other {
            span: Span::new(start, self.last_stop()),
        })
    }

    fn parse_function(&mut self) -> Result<Expr, AppError> {
        let name = match self.advance() {
            Some(Lexeme {
                kind: LexKind::Word { value, .. },
                span,
            }) => (value, span),
            _ => return Err(self.error("Expected function name")),
        };
        self.expect(&LexKind::LParen, "`(`")?;
        let distinct = self.parse_keyword("DISTINCT").is_some();
        let mut args = Vec::new();
        if let Some(span) = self.consume(&LexKind::Star) {
            args.push(Expr::Other { span });
        } else if !self.check(&LexKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.consume(&LexKind::Comma).is_none() {
                    break;
                }
            }
        }
        // CAST(x AS t), CONVERT(x USING c), and other keyword-separated arguments
        let mut depth = 0usize;
        while !(depth == 0 && self.check(&LexKind::RParen)) {
            match self.advance() {
                Some(Lexeme {
                    kind: LexKind::LParen,
                    ..
                }) => depth += 1,
                Some(Lexeme {
                    kind: LexKind::RParen,
                    ..
                }) => depth -= 1,
                Some(Lexeme {
                    kind: LexKind::Placeholder,
                    span,
                }) => {
                    self.add_parameter(span);
                }
                Some(_) => {}
                None => return Err(self.error("Unclosed function call")),
            }
        }
        let stop = self.expect(&LexKind::RParen, "`)`")?.stop;
        Ok(Expr::Function {
            name: name.0,
            args,
            distinct,
            span: Span::new(name.1.start, stop),
        })
    }

    fn parse_column_ref(&mut self) -> Result<ColumnSegment, AppError> {
        let mut parts = vec![self.parse_identifier()?];
        while self.check(&LexKind::Period) && parts.len() < 3 {
            self.pos += 1;
            parts.push(self.parse_identifier()?);
        }
        let name = parts.pop().ok_or_else(|| self.error("Expected column"))?;
        let owner = parts.pop();
        Ok(ColumnSegment { owner, name })
    }
}

fn ddl(kind: DdlKind, tables: Vec<TableSegment>, indexes: Vec<Identifier>) -> Statement {
    Statement::Ddl(DdlStatement {
        kind,
        tables,
        indexes,
    })
}

fn dal(kind: DalKind, tables: Vec<TableSegment>) -> DalStatement {
    DalStatement { kind, tables }
}

fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
    let span = left.span().merge(right.span());
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
        span,
    }
}

fn parse_number(text: &str) -> Value {
    if let Ok(value) = text.parse::<i64>() {
        return Value::from(value);
    }
    if let Ok(value) = text.parse::<u64>() {
        return Value::from(value);
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

fn negate(number: &Number) -> Value {
    if let Some(value) = number.as_i64() {
        return Value::from(-value);
    }
    number
        .as_f64()
        .and_then(|value| Number::from_f64(-value))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Shrink a span to exclude surrounding whitespace
fn trim_span(sql: &str, span: Span) -> Span {
    let text = span.text(sql);
    let leading = text.len() - text.trim_start().len();
    let trailing = text.len() - text.trim_end().len();
    if leading + trailing >= text.len() {
        return span;
    }
    Span::new(span.start + leading, span.stop - trailing)
}
