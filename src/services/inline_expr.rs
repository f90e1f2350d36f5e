// Inline Expression Service
//
// Parses `ds_${0..1}.t_order_${['a', 'b']}` style expressions used by data node
// declarations and by the INLINE sharding algorithm (`ds_${user_id % 2}`).
// Parsed expressions are memoized by their source text.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::api::middleware::AppError;

/// One `${...}` placeholder
#[derive(Debug, Clone, PartialEq)]
enum Placeholder {
    /// Enumerated values: `0..3` or `['a', 'b']`
    Values(Vec<String>),
    /// Arithmetic over sharding column variables
    Expr(ArithExpr),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq)]
enum ArithExpr {
    Int(i64),
    Var(String),
    Neg(Box<ArithExpr>),
    Binary(Box<ArithExpr>, char, Box<ArithExpr>),
}

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Int(i64),
    Text(String),
}

impl EvalValue {
    fn as_int(&self) -> Result<i64, AppError> {
        match self {
            EvalValue::Int(value) => Ok(*value),
            EvalValue::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                AppError::UnsupportedConstruct(format!(
                    "Inline expression arithmetic on non-numeric value `{}`",
                    text
                ))
            }),
        }
    }

    fn render(self) -> String {
        match self {
            EvalValue::Int(value) => value.to_string(),
            EvalValue::Text(text) => text,
        }
    }
}

/// A single parsed inline expression (no top-level commas)
#[derive(Debug, Clone, PartialEq)]
pub struct InlineExpression {
    source: String,
    segments: Vec<Segment>,
}

impl InlineExpression {
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while !rest.is_empty() {
            let opener = if rest.starts_with("${") {
                Some(2)
            } else if rest.starts_with("$->{") {
                Some(4)
            } else {
                None
            };
            match opener {
                Some(width) => {
                    let body_start = width;
                    let close = find_closing_brace(&rest[body_start..]).ok_or_else(|| {
                        AppError::Configuration(format!(
                            "Unclosed placeholder in inline expression `{}`",
                            text
                        ))
                    })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut literal)));
                    }
                    let body = &rest[body_start..body_start + close];
                    segments.push(Segment::Placeholder(parse_placeholder(body, text)?));
                    rest = &rest[body_start + close + 1..];
                }
                None => {
                    let mut chars = rest.chars();
                    if let Some(ch) = chars.next() {
                        literal.push(ch);
                    }
                    rest = chars.as_str();
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Text(literal));
        }

        Ok(Self {
            source: text.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variables referenced by arithmetic placeholders, first-seen order
    pub fn variables(&self) -> Vec<String> {
        let mut result = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(Placeholder::Expr(expr)) = segment {
                collect_variables(expr, &mut result);
            }
        }
        result
    }

    /// Cartesian product of every enumerated placeholder, in declaration order
    pub fn expand(&self) -> Result<Vec<String>, AppError> {
        let mut results = vec![String::new()];
        for segment in &self.segments {
            let choices: Vec<String> = match segment {
                Segment::Text(text) => vec![text.clone()],
                Segment::Placeholder(Placeholder::Values(values)) => values.clone(),
                Segment::Placeholder(Placeholder::Expr(expr)) => {
                    vec![evaluate(expr, &HashMap::new(), &self.source)?.render()]
                }
            };
            results = results
                .iter()
                .flat_map(|prefix| choices.iter().map(move |choice| format!("{}{}", prefix, choice)))
                .collect();
        }
        Ok(results)
    }

    /// Evaluate against column values; enumerated placeholders are rejected
    pub fn evaluate(&self, variables: &HashMap<String, Value>) -> Result<String, AppError> {
        let mut result = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => result.push_str(text),
                Segment::Placeholder(Placeholder::Expr(expr)) => {
                    result.push_str(&evaluate(expr, variables, &self.source)?.render())
                }
                Segment::Placeholder(Placeholder::Values(_)) => {
                    return Err(AppError::Configuration(format!(
                        "Inline expression `{}` enumerates values and cannot be evaluated",
                        self.source
                    )))
                }
            }
        }
        Ok(result)
    }
}

static SHARED_PARSER: LazyLock<InlineExpressionParser> = LazyLock::new(InlineExpressionParser::new);

/// Memoizing parser shared by everything that reads inline expressions
#[derive(Debug, Default)]
pub struct InlineExpressionParser {
    cache: RwLock<HashMap<String, Arc<Vec<InlineExpression>>>>,
}

impl InlineExpressionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide parser used by rule building and the INLINE algorithm
    pub fn shared() -> &'static InlineExpressionParser {
        &SHARED_PARSER
    }

    /// Parse text that must hold exactly one expression
    pub fn parse_single(&self, text: &str) -> Result<InlineExpression, AppError> {
        match self.parse(text)?.as_slice() {
            [expression] => Ok(expression.clone()),
            _ => Err(AppError::Configuration(format!(
                "Expected a single inline expression, found `{}`",
                text
            ))),
        }
    }

    /// Parse a comma separated list of inline expressions
    pub fn parse(&self, text: &str) -> Result<Arc<Vec<InlineExpression>>, AppError> {
        if let Some(parsed) = self.cache.read().get(text) {
            return Ok(parsed.clone());
        }

        let mut expressions = Vec::new();
        for part in split_top_level(text) {
            let part = part.trim();
            if !part.is_empty() {
                expressions.push(InlineExpression::parse(part)?);
            }
        }
        let parsed = Arc::new(expressions);
        // Racing inserts compute the same value from the same text
        self.cache.write().insert(text.to_string(), parsed.clone());
        tracing::debug!("Cached inline expression: {}", text);
        Ok(parsed)
    }

    /// Expand every comma separated part, preserving declaration order
    pub fn split_and_expand(&self, text: &str) -> Result<Vec<String>, AppError> {
        let mut result = Vec::new();
        for expression in self.parse(text)?.iter() {
            result.extend(expression.expand()?);
        }
        Ok(result)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_cached(&self, text: &str) -> bool {
        self.cache.read().contains_key(text)
    }
}

fn find_closing_brace(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (index, ch) in body.char_indices() {
        match (quote, ch) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, '}') => return Some(index),
            _ => {}
        }
    }
    None
}

/// Split on commas that are outside placeholders
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, ch) in text.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_placeholder(body: &str, source: &str) -> Result<Placeholder, AppError> {
    let trimmed = body.trim();
    if let Some((low, high)) = trimmed.split_once("..") {
        if let (Ok(low), Ok(high)) = (low.trim().parse::<i64>(), high.trim().parse::<i64>()) {
            if low > high {
                return Err(AppError::Configuration(format!(
                    "Descending range `{}` in inline expression `{}`",
                    trimmed, source
                )));
            }
            return Ok(Placeholder::Values((low..=high).map(|value| value.to_string()).collect()));
        }
    }
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let values = inner
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
            .filter(|item| !item.is_empty())
            .collect();
        return Ok(Placeholder::Values(values));
    }
    let mut parser = ArithParser::new(trimmed, source);
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(Placeholder::Expr(expr))
}

struct ArithParser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> ArithParser<'a> {
    fn new(body: &str, source: &'a str) -> Self {
        Self {
            chars: body.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn error(&self, message: &str) -> AppError {
        AppError::Configuration(format!(
            "{} at position {} in inline expression `{}`",
            message, self.pos, self.source
        ))
    }

    fn skip_whitespace(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.chars.get(self.pos).copied()
    }

    fn expect_end(&mut self) -> Result<(), AppError> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.error("Unexpected trailing input")),
        }
    }

    fn parse_expr(&mut self) -> Result<ArithExpr, AppError> {
        let mut left = self.parse_term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let right = self.parse_term()?;
            left = ArithExpr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<ArithExpr, AppError> {
        let mut left = self.parse_unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek() {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = ArithExpr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<ArithExpr, AppError> {
        if self.peek() == Some('-') {
            self.pos += 1;
            return Ok(ArithExpr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ArithExpr, AppError> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                if self.peek() != Some(')') {
                    return Err(self.error("Expected `)`"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                digits
                    .parse::<i64>()
                    .map(ArithExpr::Int)
                    .map_err(|_| self.error("Integer literal out of range"))
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                let start = self.pos;
                while self
                    .chars
                    .get(self.pos)
                    .is_some_and(|c| c.is_alphanumeric() || *c == '_')
                {
                    self.pos += 1;
                }
                Ok(ArithExpr::Var(self.chars[start..self.pos].iter().collect()))
            }
            _ => Err(self.error("Expected number, variable or `(`")),
        }
    }
}

fn collect_variables(expr: &ArithExpr, result: &mut Vec<String>) {
    match expr {
        ArithExpr::Int(_) => {}
        ArithExpr::Var(name) => {
            if !result.contains(name) {
                result.push(name.clone());
            }
        }
        ArithExpr::Neg(inner) => collect_variables(inner, result),
        ArithExpr::Binary(left, _, right) => {
            collect_variables(left, result);
            collect_variables(right, result);
        }
    }
}

fn lookup<'v>(variables: &'v HashMap<String, Value>, name: &str) -> Option<&'v Value> {
    variables.get(name).or_else(|| {
        variables
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn evaluate(
    expr: &ArithExpr,
    variables: &HashMap<String, Value>,
    source: &str,
) -> Result<EvalValue, AppError> {
    match expr {
        ArithExpr::Int(value) => Ok(EvalValue::Int(*value)),
        ArithExpr::Var(name) => match lookup(variables, name) {
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(EvalValue::Int)
                .ok_or_else(|| {
                    AppError::UnsupportedConstruct(format!(
                        "Non-integral sharding value `{}` for `{}`",
                        number, name
                    ))
                }),
            Some(Value::String(text)) => Ok(EvalValue::Text(text.clone())),
            Some(other) => Err(AppError::UnsupportedConstruct(format!(
                "Unsupported sharding value type `{}` for `{}`",
                other, name
            ))),
            None => Err(AppError::Configuration(format!(
                "Variable `{}` is not bound in inline expression `{}`",
                name, source
            ))),
        },
        ArithExpr::Neg(inner) => Ok(EvalValue::Int(-evaluate(inner, variables, source)?.as_int()?)),
        ArithExpr::Binary(left, op, right) => {
            let left = evaluate(left, variables, source)?.as_int()?;
            let right = evaluate(right, variables, source)?.as_int()?;
            let value = match op {
                '+' => left.checked_add(right),
                '-' => left.checked_sub(right),
                '*' => left.checked_mul(right),
                '/' => left.checked_div(right),
                '%' => left.checked_rem(right),
                _ => None,
            };
            value.map(EvalValue::Int).ok_or_else(|| {
                AppError::UnsupportedConstruct(format!(
                    "Arithmetic overflow or division by zero evaluating `{}`",
                    source
                ))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_data_nodes() {
        let parser = InlineExpressionParser::new();
        let nodes = parser.split_and_expand("ds_${0..1}.t_order_${0..1}").unwrap();
        assert_eq!(
            nodes,
            vec![
                "ds_0.t_order_0",
                "ds_0.t_order_1",
                "ds_1.t_order_0",
                "ds_1.t_order_1"
            ]
        );
    }

    #[test]
    fn test_expand_lists_and_commas() {
        let parser = InlineExpressionParser::new();
        let nodes = parser
            .split_and_expand("ds_$->{['a', 'b']}.t_user, ds_c.t_user_${1..2}")
            .unwrap();
        assert_eq!(
            nodes,
            vec!["ds_a.t_user", "ds_b.t_user", "ds_c.t_user_1", "ds_c.t_user_2"]
        );
    }

    #[test]
    fn test_evaluate_arithmetic() {
        let expression = InlineExpression::parse("t_order_${(order_id + 1) % 4}").unwrap();
        assert_eq!(expression.variables(), vec!["order_id".to_string()]);

        let mut variables = HashMap::new();
        variables.insert("order_id".to_string(), json!(10));
        assert_eq!(expression.evaluate(&variables).unwrap(), "t_order_3");

        variables.insert("order_id".to_string(), json!("7"));
        assert_eq!(expression.evaluate(&variables).unwrap(), "t_order_0");
    }

    #[test]
    fn test_evaluate_errors() {
        let expression = InlineExpression::parse("ds_${user_id % 2}").unwrap();
        let mut variables = HashMap::new();
        variables.insert("user_id".to_string(), json!(true));
        assert!(matches!(
            expression.evaluate(&variables),
            Err(AppError::UnsupportedConstruct(_))
        ));

        assert!(matches!(
            expression.evaluate(&HashMap::new()),
            Err(AppError::Configuration(_))
        ));
        assert!(InlineExpression::parse("ds_${0..1").is_err());
        assert!(InlineExpression::parse("ds_${3..1}").is_err());
    }

    #[test]
    fn test_parser_cache() {
        let parser = InlineExpressionParser::new();
        let first = parser.parse("ds_${0..1}").unwrap();
        let second = parser.parse("ds_${0..1}").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(parser.cached_len(), 1);
    }

    #[test]
    fn test_parse_single() {
        let parser = InlineExpressionParser::new();
        assert_eq!(parser.parse_single("t_${0..1}").unwrap().source(), "t_${0..1}");
        assert!(matches!(
            parser.parse_single("t_a, t_b"),
            Err(AppError::Configuration(_))
        ));
    }
}
