// Bound statement model
//
// A bound statement is the parsed logical SQL plus the byte ranges of every segment the
// router and the rewriter care about. All offsets are 0-based byte offsets into the
// original SQL text, and every `Span` is a closed range `[start, stop]`.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Closed byte range `[start, stop]` in the original SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Span {
    pub start: usize,
    pub stop: usize,
}

impl Span {
    pub fn new(start: usize, stop: usize) -> Self {
        debug_assert!(start <= stop, "span start {} after stop {}", start, stop);
        Self { start, stop }
    }

    /// Smallest span covering both
    pub fn merge(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.stop.max(other.stop))
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset <= self.stop
    }

    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.start..=self.stop]
    }
}

/// Literal value or `?` parameter marker (numbered left to right from 0)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operand {
    Literal(Value),
    Parameter(usize),
}

impl Operand {
    /// Resolve against the statement's parameter list
    pub fn resolve<'a>(&'a self, parameters: &'a [Value]) -> Option<&'a Value> {
        match self {
            Operand::Literal(value) => Some(value),
            Operand::Parameter(index) => parameters.get(*index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identifier {
    pub value: String,
    pub quote: Option<char>,
    pub span: Span,
}

impl Identifier {
    pub fn eq_ignore_case(&self, other: &str) -> bool {
        self.value.eq_ignore_ascii_case(other)
    }
}

/// Table reference, e.g. `db.t_order AS o`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSegment {
    pub owner: Option<Identifier>,
    pub name: Identifier,
    pub alias: Option<Identifier>,
}

impl TableSegment {
    pub fn logic_name(&self) -> &str {
        &self.name.value
    }

    /// Name used by column owners to refer to this table
    pub fn reference_name(&self) -> &str {
        self.alias
            .as_ref()
            .map(|alias| alias.value.as_str())
            .unwrap_or(&self.name.value)
    }
}

/// Column reference, e.g. `o.user_id`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSegment {
    pub owner: Option<Identifier>,
    pub name: Identifier,
}

impl ColumnSegment {
    pub fn span(&self) -> Span {
        match &self.owner {
            Some(owner) => owner.span.merge(self.name.span),
            None => self.name.span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryOperator {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    NullSafeEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
                | BinaryOperator::NullSafeEq
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::NullSafeEq => "<=>",
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Column(ColumnSegment),
    Literal {
        value: Value,
        span: Span,
    },
    Parameter {
        index: usize,
        span: Span,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
        span: Span,
    },
    Not {
        expr: Box<Expr>,
        span: Span,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
        span: Span,
    },
    InSubquery {
        expr: Box<Expr>,
        query: Box<SelectStatement>,
        negated: bool,
        span: Span,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
        span: Span,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
        span: Span,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
        span: Span,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
        span: Span,
    },
    Nested {
        expr: Box<Expr>,
        span: Span,
    },
    Subquery {
        query: Box<SelectStatement>,
        span: Span,
    },
    Exists {
        query: Box<SelectStatement>,
        span: Span,
    },
    /// Anything the router never inspects (CASE, `*` argument, intervals, ...)
    Other {
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Column(column) => column.span(),
            Expr::Literal { span, .. }
            | Expr::Parameter { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Not { span, .. }
            | Expr::In { span, .. }
            | Expr::InSubquery { span, .. }
            | Expr::Between { span, .. }
            | Expr::Like { span, .. }
            | Expr::IsNull { span, .. }
            | Expr::Function { span, .. }
            | Expr::Nested { span, .. }
            | Expr::Subquery { span, .. }
            | Expr::Exists { span, .. }
            | Expr::Other { span } => *span,
        }
    }

    /// Literal or parameter marker as an operand
    pub fn as_operand(&self) -> Option<Operand> {
        match self {
            Expr::Literal { value, .. } => Some(Operand::Literal(value.clone())),
            Expr::Parameter { index, .. } => Some(Operand::Parameter(*index)),
            Expr::Nested { expr, .. } => expr.as_operand(),
            _ => None,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnSegment> {
        match self {
            Expr::Column(column) => Some(column),
            Expr::Nested { expr, .. } => expr.as_column(),
            _ => None,
        }
    }

    /// Split a predicate on its top-level AND connectives
    pub fn and_predicates(&self) -> Vec<&Expr> {
        let mut predicates = Vec::new();
        collect_and_predicates(self, &mut predicates);
        predicates
    }

    /// Visit every column reference, descending into sub-queries
    pub fn visit_columns<'a>(&'a self, visitor: &mut dyn FnMut(&'a ColumnSegment)) {
        match self {
            Expr::Column(column) => visitor(column),
            Expr::Literal { .. } | Expr::Parameter { .. } | Expr::Other { .. } => {}
            Expr::Binary { left, right, .. } => {
                left.visit_columns(visitor);
                right.visit_columns(visitor);
            }
            Expr::Not { expr, .. } | Expr::Nested { expr, .. } | Expr::IsNull { expr, .. } => {
                expr.visit_columns(visitor)
            }
            Expr::In { expr, list, .. } => {
                expr.visit_columns(visitor);
                list.iter().for_each(|item| item.visit_columns(visitor));
            }
            Expr::InSubquery { expr, query, .. } => {
                expr.visit_columns(visitor);
                query.visit_columns(visitor);
            }
            Expr::Between { expr, low, high, .. } => {
                expr.visit_columns(visitor);
                low.visit_columns(visitor);
                high.visit_columns(visitor);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit_columns(visitor);
                pattern.visit_columns(visitor);
            }
            Expr::Function { args, .. } => args.iter().for_each(|arg| arg.visit_columns(visitor)),
            Expr::Subquery { query, .. } | Expr::Exists { query, .. } => query.visit_columns(visitor),
        }
    }

    /// Sub-queries nested anywhere inside this expression
    pub fn subqueries(&self) -> Vec<&SelectStatement> {
        let mut result = Vec::new();
        collect_subqueries(self, &mut result);
        result
    }
}

fn collect_and_predicates<'a>(expr: &'a Expr, predicates: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOperator::And,
            right,
            ..
        } => {
            collect_and_predicates(left, predicates);
            collect_and_predicates(right, predicates);
        }
        Expr::Nested { expr: inner, .. }
            if matches!(
                inner.as_ref(),
                Expr::Binary {
                    op: BinaryOperator::And,
                    ..
                }
            ) =>
        {
            collect_and_predicates(inner, predicates)
        }
        other => predicates.push(other),
    }
}

fn collect_subqueries<'a>(expr: &'a Expr, result: &mut Vec<&'a SelectStatement>) {
    match expr {
        Expr::Subquery { query, .. } | Expr::Exists { query, .. } => result.push(query),
        Expr::InSubquery { expr, query, .. } => {
            collect_subqueries(expr, result);
            result.push(query);
        }
        Expr::Binary { left, right, .. } => {
            collect_subqueries(left, result);
            collect_subqueries(right, result);
        }
        Expr::Not { expr, .. } | Expr::Nested { expr, .. } | Expr::IsNull { expr, .. } => {
            collect_subqueries(expr, result)
        }
        Expr::In { expr, list, .. } => {
            collect_subqueries(expr, result);
            list.iter().for_each(|item| collect_subqueries(item, result));
        }
        Expr::Between { expr, low, high, .. } => {
            collect_subqueries(expr, result);
            collect_subqueries(low, result);
            collect_subqueries(high, result);
        }
        Expr::Like { expr, pattern, .. } => {
            collect_subqueries(expr, result);
            collect_subqueries(pattern, result);
        }
        Expr::Function { args, .. } => args.iter().for_each(|arg| collect_subqueries(arg, result)),
        Expr::Column(_) | Expr::Literal { .. } | Expr::Parameter { .. } | Expr::Other { .. } => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregationKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregationKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregationKind::Count),
            "SUM" => Some(AggregationKind::Sum),
            "AVG" => Some(AggregationKind::Avg),
            "MAX" => Some(AggregationKind::Max),
            "MIN" => Some(AggregationKind::Min),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Projection {
    /// `*` or `t.*`
    Shorthand {
        owner: Option<Identifier>,
        span: Span,
    },
    Column {
        column: ColumnSegment,
        alias: Option<Identifier>,
        span: Span,
    },
    Aggregation {
        kind: AggregationKind,
        distinct: bool,
        /// Text between the parentheses
        inner: Span,
        args: Vec<Expr>,
        alias: Option<Identifier>,
        span: Span,
    },
    Expression {
        expr: Expr,
        alias: Option<Identifier>,
        span: Span,
    },
}

impl Projection {
    pub fn span(&self) -> Span {
        match self {
            Projection::Shorthand { span, .. }
            | Projection::Column { span, .. }
            | Projection::Aggregation { span, .. }
            | Projection::Expression { span, .. } => *span,
        }
    }

    pub fn alias(&self) -> Option<&Identifier> {
        match self {
            Projection::Shorthand { .. } => None,
            Projection::Column { alias, .. }
            | Projection::Aggregation { alias, .. }
            | Projection::Expression { alias, .. } => alias.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionsSegment {
    pub distinct: bool,
    pub items: Vec<Projection>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OrderByKey {
    Column(ColumnSegment),
    /// `ORDER BY 2`
    Position(usize),
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderByItem {
    pub key: OrderByKey,
    pub direction: OrderDirection,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBySegment {
    pub items: Vec<OrderByItem>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaginationValue {
    pub operand: Operand,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitSegment {
    pub offset: Option<PaginationValue>,
    pub row_count: Option<PaginationValue>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WhereSegment {
    pub expr: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectStatement {
    pub projections: ProjectionsSegment,
    /// Physical tables in FROM/JOIN, textual order
    pub from: Vec<TableSegment>,
    /// Derived tables, `FROM (SELECT ...) x`
    pub derived: Vec<SelectStatement>,
    pub join_conditions: Vec<Expr>,
    pub where_clause: Option<WhereSegment>,
    pub group_by: Option<OrderBySegment>,
    pub having: Option<WhereSegment>,
    pub order_by: Option<OrderBySegment>,
    pub limit: Option<LimitSegment>,
    pub lock: bool,
    pub span: Span,
}

impl SelectStatement {
    /// Tables of this query and every nested query
    pub fn all_tables(&self) -> Vec<&TableSegment> {
        let mut result: Vec<&TableSegment> = self.from.iter().collect();
        for derived in &self.derived {
            result.extend(derived.all_tables());
        }
        for query in self.subqueries() {
            result.extend(query.all_tables());
        }
        result
    }

    /// Sub-queries found in projections, join conditions, WHERE and HAVING
    pub fn subqueries(&self) -> Vec<&SelectStatement> {
        let mut result = Vec::new();
        for projection in &self.projections.items {
            if let Projection::Expression { expr, .. } = projection {
                result.extend(expr.subqueries());
            }
        }
        for condition in &self.join_conditions {
            result.extend(condition.subqueries());
        }
        if let Some(where_clause) = &self.where_clause {
            result.extend(where_clause.expr.subqueries());
        }
        if let Some(having) = &self.having {
            result.extend(having.expr.subqueries());
        }
        result
    }

    pub fn visit_columns<'a>(&'a self, visitor: &mut dyn FnMut(&'a ColumnSegment)) {
        for projection in &self.projections.items {
            match projection {
                Projection::Column { column, .. } => visitor(column),
                Projection::Aggregation { args, .. } => {
                    args.iter().for_each(|arg| arg.visit_columns(visitor))
                }
                Projection::Expression { expr, .. } => expr.visit_columns(visitor),
                Projection::Shorthand { .. } => {}
            }
        }
        for derived in &self.derived {
            derived.visit_columns(visitor);
        }
        for condition in &self.join_conditions {
            condition.visit_columns(visitor);
        }
        if let Some(where_clause) = &self.where_clause {
            where_clause.expr.visit_columns(visitor);
        }
        for segment in [&self.group_by, &self.order_by].into_iter().flatten() {
            for item in &segment.items {
                match &item.key {
                    OrderByKey::Column(column) => visitor(column),
                    OrderByKey::Expression(expr) => expr.visit_columns(visitor),
                    OrderByKey::Position(_) => {}
                }
            }
        }
        if let Some(having) = &self.having {
            having.expr.visit_columns(visitor);
        }
    }

    pub fn has_aggregation(&self) -> bool {
        self.projections
            .items
            .iter()
            .any(|projection| matches!(projection, Projection::Aggregation { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub column: ColumnSegment,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetAssignmentSegment {
    pub assignments: Vec<Assignment>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertColumnsSegment {
    pub columns: Vec<Identifier>,
    /// Includes the parentheses
    pub span: Span,
}

impl InsertColumnsSegment {
    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|each| each.eq_ignore_case(column))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertValuesSegment {
    pub values: Vec<Expr>,
    /// Includes the parentheses
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertStatement {
    pub table: TableSegment,
    pub columns: Option<InsertColumnsSegment>,
    pub values: Vec<InsertValuesSegment>,
    pub set_assignments: Option<SetAssignmentSegment>,
    pub on_duplicate_key_update: Option<SetAssignmentSegment>,
    pub replace: bool,
}

impl InsertStatement {
    /// Number of rows the statement inserts
    pub fn row_count(&self) -> usize {
        if self.set_assignments.is_some() {
            1
        } else {
            self.values.len()
        }
    }

    /// Expression supplied for `column` in row `row`
    pub fn row_value(&self, row: usize, column: &str) -> Option<&Expr> {
        if let Some(set) = &self.set_assignments {
            return set
                .assignments
                .iter()
                .find(|assignment| assignment.column.name.eq_ignore_case(column))
                .map(|assignment| &assignment.value);
        }
        let position = self.columns.as_ref()?.position(column)?;
        self.values.get(row)?.values.get(position)
    }

    /// Whether the column list (or SET list) names `column`
    pub fn contains_column(&self, column: &str) -> bool {
        if let Some(set) = &self.set_assignments {
            return set
                .assignments
                .iter()
                .any(|assignment| assignment.column.name.eq_ignore_case(column));
        }
        self.columns
            .as_ref()
            .map(|columns| columns.position(column).is_some())
            .unwrap_or(false)
    }

    /// Span from the first row's `(` to the last row's `)`
    pub fn values_span(&self) -> Option<Span> {
        let first = self.values.first()?;
        let last = self.values.last()?;
        Some(first.span.merge(last.span))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateStatement {
    pub tables: Vec<TableSegment>,
    pub set: SetAssignmentSegment,
    pub where_clause: Option<WhereSegment>,
    pub order_by: Option<OrderBySegment>,
    pub limit: Option<LimitSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteStatement {
    pub tables: Vec<TableSegment>,
    pub where_clause: Option<WhereSegment>,
    pub order_by: Option<OrderBySegment>,
    pub limit: Option<LimitSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DdlKind {
    CreateTable,
    AlterTable,
    DropTable,
    TruncateTable,
    CreateIndex,
    DropIndex,
    /// CREATE/ALTER/DROP TABLESPACE
    Tablespace,
    /// CREATE/ALTER/DROP FUNCTION or PROCEDURE
    Routine,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DdlStatement {
    pub kind: DdlKind,
    pub tables: Vec<TableSegment>,
    pub indexes: Vec<Identifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DalKind {
    ShowDatabases,
    /// SHOW TABLES, SHOW STATUS, SHOW VARIABLES and other instance-invariant SHOWs
    Show,
    /// DESCRIBE t, SHOW COLUMNS FROM t, SHOW INDEX FROM t, SHOW CREATE TABLE t
    DescribeTable,
    Use,
    Set,
    OptimizeTable,
    AnalyzeTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DalStatement {
    pub kind: DalKind,
    pub tables: Vec<TableSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DclKind {
    Grant,
    Revoke,
    /// CREATE/ALTER/DROP/RENAME USER
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DclStatement {
    pub kind: DclKind,
    /// Empty for `ON *.*` and user statements
    pub tables: Vec<TableSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TclKind {
    Begin,
    Commit,
    Rollback,
    Savepoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Ddl(DdlStatement),
    Dal(DalStatement),
    Dcl(DclStatement),
    Tcl(TclKind),
}

impl Statement {
    pub fn type_name(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
            Statement::Ddl(_) => "DDL",
            Statement::Dal(_) => "DAL",
            Statement::Dcl(_) => "DCL",
            Statement::Tcl(_) => "TCL",
        }
    }

    /// SELECT, INSERT, UPDATE or DELETE
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            Statement::Select(_) | Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterMarker {
    pub index: usize,
    pub span: Span,
}

/// Forced routing supplied by the session API or an inline `ROUTE_HINT` comment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct HintContext {
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub write_route_only: bool,
}

impl HintContext {
    pub fn with_data_source(name: impl Into<String>) -> Self {
        Self {
            data_source: Some(name.into()),
            write_route_only: false,
        }
    }

    /// Session values win over inline comment values
    pub fn merge(&self, inline: &HintContext) -> HintContext {
        HintContext {
            data_source: self.data_source.clone().or_else(|| inline.data_source.clone()),
            write_route_only: self.write_route_only || inline.write_route_only,
        }
    }
}

/// Parsed statement plus the original text and its parameter markers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundStatement {
    pub sql: String,
    pub statement: Statement,
    pub parameter_markers: Vec<ParameterMarker>,
    pub inline_hint: HintContext,
}

impl BoundStatement {
    /// Every table reference, including those inside sub-queries
    pub fn tables(&self) -> Vec<&TableSegment> {
        match &self.statement {
            Statement::Select(select) => select.all_tables(),
            Statement::Insert(insert) => vec![&insert.table],
            Statement::Update(update) => {
                let mut result: Vec<&TableSegment> = update.tables.iter().collect();
                if let Some(where_clause) = &update.where_clause {
                    for query in where_clause.expr.subqueries() {
                        result.extend(query.all_tables());
                    }
                }
                result
            }
            Statement::Delete(delete) => {
                let mut result: Vec<&TableSegment> = delete.tables.iter().collect();
                if let Some(where_clause) = &delete.where_clause {
                    for query in where_clause.expr.subqueries() {
                        result.extend(query.all_tables());
                    }
                }
                result
            }
            Statement::Ddl(ddl) => ddl.tables.iter().collect(),
            Statement::Dal(dal) => dal.tables.iter().collect(),
            Statement::Dcl(dcl) => dcl.tables.iter().collect(),
            Statement::Tcl(_) => Vec::new(),
        }
    }

    /// Distinct logical table names in first-seen order, lower-cased
    pub fn table_names(&self) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        for table in self.tables() {
            let name = table.logic_name().to_ascii_lowercase();
            if !result.contains(&name) {
                result.push(name);
            }
        }
        result
    }

    /// Plain reads eligible for replica routing
    pub fn is_read_query(&self) -> bool {
        matches!(&self.statement, Statement::Select(select) if !select.lock)
    }

    pub fn where_clause(&self) -> Option<&WhereSegment> {
        match &self.statement {
            Statement::Select(select) => select.where_clause.as_ref(),
            Statement::Update(update) => update.where_clause.as_ref(),
            Statement::Delete(delete) => delete.where_clause.as_ref(),
            _ => None,
        }
    }

    /// Visit every column reference in the statement
    pub fn visit_columns<'a>(&'a self, visitor: &mut dyn FnMut(&'a ColumnSegment)) {
        match &self.statement {
            Statement::Select(select) => select.visit_columns(visitor),
            Statement::Insert(insert) => {
                for segment in [&insert.set_assignments, &insert.on_duplicate_key_update]
                    .into_iter()
                    .flatten()
                {
                    for assignment in &segment.assignments {
                        visitor(&assignment.column);
                        assignment.value.visit_columns(visitor);
                    }
                }
            }
            Statement::Update(update) => {
                for assignment in &update.set.assignments {
                    visitor(&assignment.column);
                    assignment.value.visit_columns(visitor);
                }
                if let Some(where_clause) = &update.where_clause {
                    where_clause.expr.visit_columns(visitor);
                }
            }
            Statement::Delete(delete) => {
                if let Some(where_clause) = &delete.where_clause {
                    where_clause.expr.visit_columns(visitor);
                }
            }
            Statement::Ddl(_) | Statement::Dal(_) | Statement::Dcl(_) | Statement::Tcl(_) => {}
        }
    }
}

/// Resolves column owners and unqualified columns to logical table names
#[derive(Debug, Default)]
pub struct TableResolver {
    by_reference: HashMap<String, String>,
    tables: Vec<String>,
}

impl TableResolver {
    pub fn new<'a>(tables: impl IntoIterator<Item = &'a TableSegment>) -> Self {
        let mut resolver = TableResolver::default();
        for table in tables {
            let logic = table.logic_name().to_ascii_lowercase();
            resolver
                .by_reference
                .insert(table.reference_name().to_ascii_lowercase(), logic.clone());
            resolver
                .by_reference
                .entry(logic.clone())
                .or_insert_with(|| logic.clone());
            if !resolver.tables.contains(&logic) {
                resolver.tables.push(logic);
            }
        }
        resolver
    }

    /// Logical table for an owner-qualified column, or the only table for an unqualified one
    pub fn resolve(&self, column: &ColumnSegment) -> Option<&str> {
        match &column.owner {
            Some(owner) => self
                .by_reference
                .get(&owner.value.to_ascii_lowercase())
                .map(String::as_str),
            None if self.tables.len() == 1 => self.tables.first().map(String::as_str),
            None => None,
        }
    }

    /// Candidate tables for a column: the resolved one, or every table when ambiguous
    pub fn candidates(&self, column: &ColumnSegment) -> Vec<&str> {
        match (&column.owner, self.resolve(column)) {
            (_, Some(table)) => vec![table],
            (Some(_), None) => Vec::new(),
            (None, None) => self.tables.iter().map(String::as_str).collect(),
        }
    }

    pub fn table_names(&self) -> &[String] {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(value: &str, start: usize) -> Identifier {
        Identifier {
            value: value.to_string(),
            quote: None,
            span: Span::new(start, start + value.len() - 1),
        }
    }

    #[test]
    fn test_span_text_and_merge() {
        let sql = "SELECT * FROM t_order";
        let span = Span::new(14, 20);
        assert_eq!(span.text(sql), "t_order");
        assert_eq!(Span::new(0, 5).merge(span), Span::new(0, 20));
        assert!(span.contains(20));
        assert!(!span.contains(21));
    }

    #[test]
    fn test_table_resolver_with_alias() {
        let order = TableSegment {
            owner: None,
            name: ident("t_order", 14),
            alias: Some(ident("o", 22)),
        };
        let item = TableSegment {
            owner: None,
            name: ident("t_order_item", 29),
            alias: None,
        };
        let resolver = TableResolver::new([&order, &item]);

        let qualified = ColumnSegment {
            owner: Some(ident("o", 0)),
            name: ident("user_id", 2),
        };
        assert_eq!(resolver.resolve(&qualified), Some("t_order"));

        let by_name = ColumnSegment {
            owner: Some(ident("T_ORDER_ITEM", 0)),
            name: ident("order_id", 13),
        };
        assert_eq!(resolver.resolve(&by_name), Some("t_order_item"));

        let unqualified = ColumnSegment {
            owner: None,
            name: ident("user_id", 0),
        };
        assert_eq!(resolver.resolve(&unqualified), None);
        assert_eq!(resolver.candidates(&unqualified).len(), 2);
    }

    #[test]
    fn test_and_predicates_stop_at_or() {
        let column = |name: &str| {
            Expr::Column(ColumnSegment {
                owner: None,
                name: ident(name, 0),
            })
        };
        let eq = |name: &str| Expr::Binary {
            left: Box::new(column(name)),
            op: BinaryOperator::Eq,
            right: Box::new(Expr::Parameter {
                index: 0,
                span: Span::new(0, 0),
            }),
            span: Span::new(0, 1),
        };
        let or = Expr::Binary {
            left: Box::new(eq("a")),
            op: BinaryOperator::Or,
            right: Box::new(eq("b")),
            span: Span::new(0, 1),
        };
        let and = Expr::Binary {
            left: Box::new(eq("c")),
            op: BinaryOperator::And,
            right: Box::new(or),
            span: Span::new(0, 1),
        };
        let predicates = and.and_predicates();
        assert_eq!(predicates.len(), 2);
        assert!(matches!(predicates[1], Expr::Binary { op: BinaryOperator::Or, .. }));
    }

    #[test]
    fn test_hint_merge_prefers_session_value() {
        let session = HintContext::with_data_source("ds_1");
        let inline = HintContext {
            data_source: Some("ds_0".to_string()),
            write_route_only: true,
        };
        let merged = session.merge(&inline);
        assert_eq!(merged.data_source.as_deref(), Some("ds_1"));
        assert!(merged.write_route_only);
    }
}
