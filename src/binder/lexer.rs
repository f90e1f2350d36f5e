// SQL Lexer
//
// Wraps the sqlparser MySQL tokenizer and converts its line/column locations into
// 0-based byte offsets, dropping whitespace but keeping comments for hint parsing.

use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, Whitespace};

use crate::api::middleware::AppError;
use crate::models::statement::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum LexKind {
    Word { value: String, quote: Option<char> },
    Number(String),
    String(String),
    Placeholder,
    Comma,
    LParen,
    RParen,
    Period,
    Star,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Spaceship,
    Plus,
    Minus,
    Div,
    Mod,
    SemiColon,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub kind: LexKind,
    pub span: Span,
}

impl Lexeme {
    /// Unquoted word matching `keyword` case-insensitively
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, LexKind::Word { value, quote: None } if value.eq_ignore_ascii_case(keyword))
    }
}

/// Lexemes plus the text of every comment, in source order
#[derive(Debug, Default)]
pub struct LexOutput {
    pub lexemes: Vec<Lexeme>,
    pub comments: Vec<String>,
}

/// Maps tokenizer locations (1-based line and character column) to byte offsets
struct OffsetMap<'a> {
    sql: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> OffsetMap<'a> {
    fn new(sql: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(sql.match_indices('\n').map(|(index, _)| index + 1));
        Self { sql, line_starts }
    }

    fn offset(&self, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&line_start) = self.line_starts.get(line) else {
            return self.sql.len();
        };
        let column = (location.column as usize).saturating_sub(1);
        self.sql[line_start..]
            .char_indices()
            .nth(column)
            .map(|(index, _)| line_start + index)
            .unwrap_or(self.sql.len())
    }
}

pub fn tokenize(sql: &str) -> Result<LexOutput, AppError> {
    let dialect = MySqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize_with_location()?;
    let offsets = OffsetMap::new(sql);
    let mut output = LexOutput::default();

    for token in tokens {
        let start = offsets.offset(token.span.start);
        let end = offsets.offset(token.span.end);
        if end <= start {
            continue;
        }
        let span = Span::new(start, end - 1);
        let kind = match token.token {
            Token::EOF => continue,
            Token::Whitespace(Whitespace::SingleLineComment { comment, .. }) => {
                output.comments.push(comment);
                continue;
            }
            Token::Whitespace(Whitespace::MultiLineComment(comment)) => {
                output.comments.push(comment);
                continue;
            }
            Token::Whitespace(_) => continue,
            Token::Word(word) => LexKind::Word {
                value: word.value,
                quote: word.quote_style,
            },
            Token::Number(number, _) => LexKind::Number(number),
            Token::SingleQuotedString(text) | Token::DoubleQuotedString(text) => LexKind::String(text),
            Token::Placeholder(text) if text == "?" => LexKind::Placeholder,
            Token::Comma => LexKind::Comma,
            Token::LParen => LexKind::LParen,
            Token::RParen => LexKind::RParen,
            Token::Period => LexKind::Period,
            Token::Mul => LexKind::Star,
            Token::Eq | Token::DoubleEq => LexKind::Eq,
            Token::Neq => LexKind::NotEq,
            Token::Lt => LexKind::Lt,
            Token::LtEq => LexKind::LtEq,
            Token::Gt => LexKind::Gt,
            Token::GtEq => LexKind::GtEq,
            Token::Spaceship => LexKind::Spaceship,
            Token::Plus => LexKind::Plus,
            Token::Minus => LexKind::Minus,
            Token::Div => LexKind::Div,
            Token::Mod => LexKind::Mod,
            Token::SemiColon => LexKind::SemiColon,
            other => LexKind::Other(other.to_string()),
        };
        output.lexemes.push(Lexeme { kind, span });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offsets() {
        let sql = "SELECT * FROM t_order WHERE id = ?";
        let output = tokenize(sql).unwrap();
        let table = &output.lexemes[3];
        assert_eq!(table.span.text(sql), "t_order");
        assert_eq!(table.span, Span::new(14, 20));
        assert_eq!(output.lexemes.last().unwrap().kind, LexKind::Placeholder);
        assert_eq!(output.lexemes.last().unwrap().span, Span::new(33, 33));
    }

    #[test]
    fn test_offsets_across_lines_and_multibyte_text() {
        let sql = "SELECT 'é'\nFROM `t_user`";
        let output = tokenize(sql).unwrap();
        let literal = &output.lexemes[1];
        assert_eq!(literal.kind, LexKind::String("é".to_string()));
        assert_eq!(literal.span.text(sql), "'é'");
        let table = &output.lexemes[3];
        assert_eq!(table.span.text(sql), "`t_user`");
        assert_eq!(
            table.kind,
            LexKind::Word {
                value: "t_user".to_string(),
                quote: Some('`')
            }
        );
    }

    #[test]
    fn test_comments_are_collected() {
        let sql = "/* ROUTE_HINT: DATA_SOURCE_NAME=ds_1 */ SELECT 1";
        let output = tokenize(sql).unwrap();
        assert_eq!(output.comments.len(), 1);
        assert!(output.comments[0].contains("ROUTE_HINT"));
        assert!(output.lexemes[0].is_keyword("select"));
    }
}
