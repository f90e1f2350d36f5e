// Encrypt token generators: logical columns become cipher/assisted/plain columns and the
// values compared or written are encrypted at render time.

use super::insert_value_rows;
use crate::api::middleware::AppError;
use crate::models::statement::{
    BinaryOperator, ColumnSegment, Expr, Identifier, Projection, SelectStatement,
    SetAssignmentSegment, Span, Statement, TableResolver, TableSegment,
};
use crate::services::rewrite::token::{quoted, SqlToken, TokenKind, ValueItem};
use crate::services::rewrite::{RewriteContext, SqlTokenGenerator};
use crate::services::rule::{EncryptColumnRule, EncryptTableRule};

fn touches_encrypt_table(context: &RewriteContext<'_>) -> bool {
    !context.model.encrypt.is_empty() && context.model.encrypt.contains_any(&context.bound.table_names())
}

/// Encrypt rule of the first candidate table that encrypts this column
fn find_encrypt_column<'m>(
    context: &RewriteContext<'m>,
    resolver: &TableResolver,
    column: &ColumnSegment,
) -> Option<(&'m EncryptTableRule, &'m EncryptColumnRule)> {
    resolver.candidates(column).into_iter().find_map(|table| {
        let table_rule = context.model.encrypt.find_table(table)?;
        let column_rule = table_rule.find_column(&column.name.value)?;
        Some((table_rule, column_rule))
    })
}

fn rename(identifier: &Identifier, name: &str) -> SqlToken {
    SqlToken::replace(identifier.span, TokenKind::Text(quoted(name, identifier.quote)))
}

fn operand_of(expr: &Expr, column: &str) -> Result<crate::models::statement::Operand, AppError> {
    expr.as_operand().ok_or_else(|| {
        AppError::UnsupportedConstruct(format!(
            "Encrypted column `{}` only accepts literal or parameter values",
            column
        ))
    })
}

/// Select items on encrypted columns read the cipher column (or the plain column when
/// configured) and keep the logical name as alias
pub struct EncryptProjectionTokenGenerator;

impl EncryptProjectionTokenGenerator {
    fn visit(&self, context: &RewriteContext<'_>, select: &SelectStatement, tokens: &mut Vec<SqlToken>) {
        let resolver = TableResolver::new(&select.from);
        for projection in &select.projections.items {
            let Projection::Column { column, alias, .. } = projection else {
                continue;
            };
            let Some((table_rule, column_rule)) = find_encrypt_column(context, &resolver, column) else {
                continue;
            };
            let physical = match &column_rule.plain_column {
                Some(plain) if table_rule.uses_plain_column(column_rule) => plain.as_str(),
                _ => column_rule.cipher_column.as_str(),
            };
            let text = match alias {
                Some(_) => quoted(physical, column.name.quote),
                None => format!(
                    "{} AS {}",
                    quoted(physical, column.name.quote),
                    column.name.span.text(context.sql())
                ),
            };
            tokens.push(SqlToken::replace(column.name.span, TokenKind::Text(text)));
        }
        for derived in &select.derived {
            self.visit(context, derived, tokens);
        }
    }
}

impl SqlTokenGenerator for EncryptProjectionTokenGenerator {
    fn name(&self) -> &'static str {
        "EncryptProjectionTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(context.bound.statement, Statement::Select(_)) && touches_encrypt_table(context)
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        if let Statement::Select(select) = &context.bound.statement {
            self.visit(context, select, tokens);
        }
        Ok(())
    }
}

/// Predicates on encrypted columns: equality and IN compare the assisted query column (or
/// the cipher column) against encrypted values; other operators are only possible on a
/// plain column
pub struct EncryptPredicateTokenGenerator;

struct PredicateVisitor<'c, 'm> {
    context: &'c RewriteContext<'m>,
    tokens: Vec<SqlToken>,
}

impl PredicateVisitor<'_, '_> {
    fn visit_select(&mut self, select: &SelectStatement) -> Result<(), AppError> {
        let resolver = TableResolver::new(&select.from);
        for condition in &select.join_conditions {
            self.visit(&resolver, condition)?;
        }
        if let Some(where_clause) = &select.where_clause {
            self.visit(&resolver, &where_clause.expr)?;
        }
        for derived in &select.derived {
            self.visit_select(derived)?;
        }
        Ok(())
    }

    fn visit(&mut self, resolver: &TableResolver, expr: &Expr) -> Result<(), AppError> {
        match expr {
            Expr::Binary { left, op, right, .. } if op.is_comparison() => {
                if let Some(column) = left.as_column() {
                    if self.on_column(resolver, column, Some(*op), &[right.as_ref()])? {
                        return Ok(());
                    }
                }
                if let Some(column) = right.as_column() {
                    if self.on_column(resolver, column, Some(*op), &[left.as_ref()])? {
                        return Ok(());
                    }
                }
                self.visit(resolver, left)?;
                self.visit(resolver, right)
            }
            Expr::Binary { left, right, .. } => {
                self.visit(resolver, left)?;
                self.visit(resolver, right)
            }
            Expr::In { expr, list, .. } => {
                if let Some(column) = expr.as_column() {
                    let values: Vec<&Expr> = list.iter().collect();
                    if self.on_column(resolver, column, Some(BinaryOperator::Eq), &values)? {
                        return Ok(());
                    }
                }
                list.iter().try_for_each(|item| self.visit(resolver, item))
            }
            Expr::Between { expr, low, high, .. } => {
                if let Some(column) = expr.as_column() {
                    if self.on_column(resolver, column, None, &[low.as_ref(), high.as_ref()])? {
                        return Ok(());
                    }
                }
                self.visit(resolver, low)?;
                self.visit(resolver, high)
            }
            Expr::Like { expr, pattern, .. } => {
                if let Some(column) = expr.as_column() {
                    if self.on_column(resolver, column, None, &[pattern.as_ref()])? {
                        return Ok(());
                    }
                }
                self.visit(resolver, pattern)
            }
            Expr::IsNull { expr, .. } => match expr.as_column() {
                Some(column) => self.on_null_check(resolver, column),
                None => self.visit(resolver, expr),
            },
            Expr::Not { expr, .. } | Expr::Nested { expr, .. } => self.visit(resolver, expr),
            Expr::InSubquery { expr, query, .. } => {
                self.visit(resolver, expr)?;
                self.visit_select(query)
            }
            Expr::Subquery { query, .. } | Expr::Exists { query, .. } => self.visit_select(query),
            Expr::Function { args, .. } => args.iter().try_for_each(|arg| self.visit(resolver, arg)),
            Expr::Column(_) | Expr::Literal { .. } | Expr::Parameter { .. } | Expr::Other { .. } => Ok(()),
        }
    }

    /// Rewrite a predicate on `column`; `op` is `None` for operators without an encrypted
    /// form. Returns false when the column is not encrypted.
    fn on_column(
        &mut self,
        resolver: &TableResolver,
        column: &ColumnSegment,
        op: Option<BinaryOperator>,
        values: &[&Expr],
    ) -> Result<bool, AppError> {
        let Some((table_rule, column_rule)) = find_encrypt_column(self.context, resolver, column) else {
            return Ok(false);
        };
        if let Some(plain) = column_rule.plain_column.as_deref() {
            if table_rule.uses_plain_column(column_rule) {
                self.tokens.push(rename(&column.name, plain));
                return Ok(true);
            }
        }
        match op {
            Some(BinaryOperator::Eq | BinaryOperator::NotEq | BinaryOperator::NullSafeEq) => {}
            Some(other) => {
                return Err(AppError::UnsupportedConstruct(format!(
                    "Operator `{}` is not supported on encrypted column `{}`",
                    other.symbol(),
                    column_rule.logic_column
                )))
            }
            None => {
                return Err(AppError::UnsupportedConstruct(format!(
                    "Only =, <>, <=> and IN are supported on encrypted column `{}`",
                    column_rule.logic_column
                )))
            }
        }
        let (query_column, encryptor) = column_rule.query_column();
        self.tokens.push(rename(&column.name, query_column));
        for value in values {
            if value.as_column().is_some() {
                return Err(AppError::UnsupportedConstruct(format!(
                    "Encrypted column `{}` cannot be compared with another column",
                    column_rule.logic_column
                )));
            }
            let operand = operand_of(value, &column_rule.logic_column)?;
            self.tokens.push(SqlToken::replace(
                value.span(),
                TokenKind::Value(ValueItem::Encrypted {
                    operand,
                    encryptor: encryptor.clone(),
                }),
            ));
        }
        Ok(true)
    }

    fn on_null_check(&mut self, resolver: &TableResolver, column: &ColumnSegment) -> Result<(), AppError> {
        if let Some((table_rule, column_rule)) = find_encrypt_column(self.context, resolver, column) {
            let physical = match &column_rule.plain_column {
                Some(plain) if table_rule.uses_plain_column(column_rule) => plain.as_str(),
                _ => column_rule.cipher_column.as_str(),
            };
            self.tokens.push(rename(&column.name, physical));
        }
        Ok(())
    }
}

impl SqlTokenGenerator for EncryptPredicateTokenGenerator {
    fn name(&self) -> &'static str {
        "EncryptPredicateTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(
            context.bound.statement,
            Statement::Select(_) | Statement::Update(_) | Statement::Delete(_)
        ) && touches_encrypt_table(context)
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let mut visitor = PredicateVisitor {
            context,
            tokens: Vec::new(),
        };
        match &context.bound.statement {
            Statement::Select(select) => visitor.visit_select(select)?,
            Statement::Update(update) => {
                if let Some(where_clause) = &update.where_clause {
                    visitor.visit(&TableResolver::new(&update.tables), &where_clause.expr)?;
                }
            }
            Statement::Delete(delete) => {
                if let Some(where_clause) = &delete.where_clause {
                    visitor.visit(&TableResolver::new(&delete.tables), &where_clause.expr)?;
                }
            }
            _ => {}
        }
        tokens.extend(visitor.tokens);
        Ok(())
    }
}

/// INSERT ... VALUES on an encrypted table: each encrypted column expands to its physical
/// columns and each row supplies the matching encrypted values
pub struct EncryptInsertTokenGenerator;

impl SqlTokenGenerator for EncryptInsertTokenGenerator {
    fn name(&self) -> &'static str {
        "EncryptInsertTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        matches!(&context.bound.statement, Statement::Insert(insert)
            if !insert.values.is_empty()
                && context.model.encrypt.find_table(insert.table.logic_name()).is_some())
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        let Statement::Insert(insert) = &context.bound.statement else {
            return Ok(());
        };
        let Some(table_rule) = context.model.encrypt.find_table(insert.table.logic_name()) else {
            return Ok(());
        };
        let columns = insert.columns.as_ref().ok_or_else(|| {
            AppError::UnsupportedConstruct(format!(
                "INSERT into encrypted table `{}` must name its columns",
                table_rule.table
            ))
        })?;

        let mut encrypted: Vec<(usize, &EncryptColumnRule)> = Vec::new();
        for (position, column) in columns.columns.iter().enumerate() {
            if let Some(column_rule) = table_rule.find_column(&column.value) {
                tokens.push(SqlToken::replace(
                    column.span,
                    TokenKind::Text(
                        column_rule
                            .write_columns()
                            .into_iter()
                            .map(|name| quoted(name, column.quote))
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
                ));
                encrypted.push((position, column_rule));
            }
        }
        if encrypted.is_empty() {
            return Ok(());
        }

        let mut expanded: Vec<Vec<(usize, Vec<ValueItem>)>> = Vec::with_capacity(insert.values.len());
        for row in &insert.values {
            let mut replacements = Vec::with_capacity(encrypted.len());
            for (position, column_rule) in &encrypted {
                let expr = row.values.get(*position).ok_or_else(|| {
                    AppError::InvalidSql(format!(
                        "Column count doesn't match value count for `{}`",
                        column_rule.logic_column
                    ))
                })?;
                replacements.push((*position, write_items(context, column_rule, expr)?));
            }
            expanded.push(replacements);
        }

        let rows = insert_value_rows(context, tokens)
            .ok_or_else(|| AppError::Internal("INSERT without VALUES rows".to_string()))?;
        for (row, replacements) in rows.iter_mut().zip(expanded) {
            for (position, items) in replacements.into_iter().rev() {
                if position < row.items.len() {
                    row.items.splice(position..=position, items);
                }
            }
        }
        Ok(())
    }
}

/// Values written for one logical column, in `write_columns` order
fn write_items(
    context: &RewriteContext<'_>,
    column_rule: &EncryptColumnRule,
    expr: &Expr,
) -> Result<Vec<ValueItem>, AppError> {
    let operand = operand_of(expr, &column_rule.logic_column)?;
    let mut items = vec![ValueItem::Encrypted {
        operand: operand.clone(),
        encryptor: column_rule.encryptor.clone(),
    }];
    if column_rule.assisted_query_column.is_some() {
        let (_, encryptor) = column_rule.query_column();
        items.push(ValueItem::Encrypted {
            operand,
            encryptor: encryptor.clone(),
        });
    }
    if column_rule.plain_column.is_some() {
        items.push(context.original(expr));
    }
    Ok(items)
}

/// `SET enc = v` in UPDATE, INSERT ... SET and ON DUPLICATE KEY UPDATE
pub struct EncryptAssignmentTokenGenerator;

impl EncryptAssignmentTokenGenerator {
    fn rewrite_segment(
        context: &RewriteContext<'_>,
        tables: &[TableSegment],
        segment: &SetAssignmentSegment,
        tokens: &mut Vec<SqlToken>,
    ) -> Result<(), AppError> {
        let resolver = TableResolver::new(tables);
        for assignment in &segment.assignments {
            let Some((_, column_rule)) = find_encrypt_column(context, &resolver, &assignment.column) else {
                continue;
            };
            let items = write_items(context, column_rule, &assignment.value)?;
            let assignments = column_rule
                .write_columns()
                .into_iter()
                .map(|name| quoted(name, assignment.column.name.quote))
                .zip(items)
                .collect();
            tokens.push(SqlToken::replace(
                Span::new(assignment.column.name.span.start, assignment.value.span().stop),
                TokenKind::Assignments(assignments),
            ));
        }
        Ok(())
    }
}

impl SqlTokenGenerator for EncryptAssignmentTokenGenerator {
    fn name(&self) -> &'static str {
        "EncryptAssignmentTokenGenerator"
    }

    fn is_applicable(&self, context: &RewriteContext<'_>) -> bool {
        let has_assignments = match &context.bound.statement {
            Statement::Update(_) => true,
            Statement::Insert(insert) => {
                insert.set_assignments.is_some() || insert.on_duplicate_key_update.is_some()
            }
            _ => false,
        };
        has_assignments && touches_encrypt_table(context)
    }

    fn generate(&self, context: &RewriteContext<'_>, tokens: &mut Vec<SqlToken>) -> Result<(), AppError> {
        match &context.bound.statement {
            Statement::Update(update) => Self::rewrite_segment(context, &update.tables, &update.set, tokens),
            Statement::Insert(insert) => {
                let tables = std::slice::from_ref(&insert.table);
                for segment in [&insert.set_assignments, &insert.on_duplicate_key_update]
                    .into_iter()
                    .flatten()
                {
                    Self::rewrite_segment(context, tables, segment, tokens)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::middleware::AppError;
    use crate::services::algorithm::Sha256Encryptor;
    use crate::services::rewrite::tests::{rewrite, rewrite_with};
    use crate::services::rule::tests::sample_configuration;
    use crate::services::rule::{RuleModel, RuleModelBuilder};
    use serde_json::json;

    /// Sample rules with `t_user` queried through its plain column
    fn plain_query_model() -> RuleModel {
        let mut config = sample_configuration();
        if let Some(table) = config.encrypt.tables.get_mut("t_user") {
            table.query_with_cipher_column = Some(false);
        }
        RuleModelBuilder::new(0).build(&config).unwrap()
    }

    fn digest(value: &str) -> serde_json::Value {
        let mut props = crate::services::algorithm::Properties::new();
        props.insert("salt".to_string(), "s".to_string());
        Sha256Encryptor::create(&props).unwrap().encrypt(&json!(value)).unwrap()
    }

    #[test]
    fn test_projection_reads_cipher_column() {
        let units = rewrite("SELECT u.phone, u.name FROM t_user u WHERE u.user_id = 1", &[]).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].sql,
            "SELECT u.phone_cipher AS phone, u.name FROM t_user u WHERE u.user_id = 1"
        );
    }

    #[test]
    fn test_equality_predicate_uses_assisted_column() {
        let units = rewrite(
            "SELECT name FROM t_user WHERE user_id = 1 AND phone = ?",
            &[json!("13800000000")],
        )
        .unwrap();
        assert_eq!(
            units[0].sql,
            "SELECT name FROM t_user WHERE user_id = 1 AND phone_assisted = ?"
        );
        assert_eq!(units[0].parameters, vec![digest("13800000000")]);
    }

    #[test]
    fn test_range_predicate_is_rejected() {
        let result = rewrite("SELECT name FROM t_user WHERE user_id = 1 AND phone > '1'", &[]);
        assert!(matches!(result, Err(AppError::UnsupportedConstruct(_))));
    }

    #[test]
    fn test_insert_expands_encrypted_column() {
        let units = rewrite(
            "INSERT INTO t_user (user_id, phone) VALUES (?, ?)",
            &[json!(1), json!("138")],
        )
        .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].sql,
            "INSERT INTO t_user (user_id, phone_cipher, phone_assisted, phone_plain) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(
            units[0].parameters,
            vec![json!(1), digest("138"), digest("138"), json!("138")]
        );
    }

    #[test]
    fn test_insert_without_columns_is_rejected() {
        let result = rewrite("INSERT INTO t_user VALUES (1, '138')", &[]);
        assert!(matches!(result, Err(AppError::UnsupportedConstruct(_))));
    }

    #[test]
    fn test_update_assignment_expands() {
        let units = rewrite("UPDATE t_user SET phone = '138' WHERE user_id = 2", &[]).unwrap();
        let cipher = digest("138");
        let literal = format!("'{}'", cipher.as_str().unwrap());
        assert_eq!(
            units[0].sql,
            format!(
                "UPDATE t_user SET phone_cipher = {lit}, phone_assisted = {lit}, phone_plain = '138' WHERE user_id = 2",
                lit = literal
            )
        );
    }

    #[test]
    fn test_plain_query_reads_and_filters_plain_column() {
        let units = rewrite_with(
            &plain_query_model(),
            "SELECT u.phone FROM t_user u WHERE u.user_id = 1 AND u.phone = ?",
            &[json!("138")],
        )
        .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].sql,
            "SELECT u.phone_plain AS phone FROM t_user u WHERE u.user_id = 1 AND u.phone_plain = ?"
        );
        assert_eq!(units[0].parameters, vec![json!("138")]);
    }

    #[test]
    fn test_plain_query_allows_range_predicate() {
        let units = rewrite_with(
            &plain_query_model(),
            "SELECT name FROM t_user WHERE user_id = 1 AND phone > '1'",
            &[],
        )
        .unwrap();
        assert_eq!(units[0].sql, "SELECT name FROM t_user WHERE user_id = 1 AND phone_plain > '1'");
    }

    #[test]
    fn test_plain_query_insert_still_writes_cipher() {
        let units = rewrite_with(
            &plain_query_model(),
            "INSERT INTO t_user (user_id, phone) VALUES (?, ?)",
            &[json!(1), json!("138")],
        )
        .unwrap();
        assert_eq!(
            units[0].sql,
            "INSERT INTO t_user (user_id, phone_cipher, phone_assisted, phone_plain) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(
            units[0].parameters,
            vec![json!(1), digest("138"), digest("138"), json!("138")]
        );
    }
}
