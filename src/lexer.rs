//! Tokenizer - single pass over template text
//!
//! Alternates between literal text runs and the inside of `{{ }}` / `{% %}`
//! delimiters. Comments `{# #}` never produce tokens.

use crate::ast::Span;
use crate::parser::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    ExprStart, // {{
    ExprEnd,   // }}
    TagStart,  // {%
    TagEnd,    // %}

    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),

    Dot,
    Comma,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Text(_) => "text".to_string(),
            Token::ExprStart => "`{{`".to_string(),
            Token::ExprEnd => "`}}`".to_string(),
            Token::TagStart => "`{%`".to_string(),
            Token::TagEnd => "`%}`".to_string(),
            Token::Ident(s) => format!("`{}`", s),
            Token::Str(s) => format!("string {:?}", s),
            Token::Int(i) => format!("number {}", i),
            Token::Float(f) => format!("number {}", f),
            other => format!("{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Expr,
    Tag,
    /// Standalone expression text with no closing delimiter.
    Bare,
}

/// A token with its position and byte range in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub span: Span,
    pub start: usize,
    pub end: usize,
}

#[derive(Clone)]
pub struct Tokenizer<'a> {
    input: &'a str,
    cursor: usize,
    token_start: usize,
    line: u32,
    column: u32,
    mode: Mode,
    open_span: Span,
    trim_blocks: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            cursor: 0,
            token_start: 0,
            line: 1,
            column: 1,
            mode: Mode::Text,
            open_span: Span::default(),
            trim_blocks: true,
        }
    }

    /// Tokenize `input` as the inside of an expression.
    pub fn expression(input: &'a str) -> Self {
        Self {
            mode: Mode::Bare,
            ..Self::new(input)
        }
    }

    pub fn span(&self) -> Span {
        Span {
            line: self.line,
            column: self.column,
        }
    }

    pub fn source(&self) -> &'a str {
        self.input
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        for c in self.input[self.cursor..self.cursor + n].chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.cursor += n;
    }

    fn error(&self, span: Span, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at(self.input, span, message)
    }

    pub fn next_token(&mut self) -> Result<Option<Lexeme>, SyntaxError> {
        Ok(self.next_raw()?.map(|(token, span)| Lexeme {
            token,
            span,
            start: self.token_start,
            end: self.cursor,
        }))
    }

    fn next_raw(&mut self) -> Result<Option<(Token, Span)>, SyntaxError> {
        loop {
            self.token_start = self.cursor;
            let span = self.span();
            let rest = self.remaining();

            if self.mode == Mode::Text {
                if rest.is_empty() {
                    return Ok(None);
                }
                let next_tag = ["{{", "{%", "{#"]
                    .iter()
                    .filter_map(|d| rest.find(d))
                    .min();
                match next_tag {
                    Some(0) => {
                        if rest.starts_with("{#") {
                            match rest.find("#}") {
                                Some(end) => {
                                    self.advance(end + 2);
                                    continue;
                                }
                                None => return Err(self.error(span, "unterminated comment")),
                            }
                        }
                        self.open_span = span;
                        self.advance(2);
                        if rest.starts_with("{%") {
                            self.mode = Mode::Tag;
                            return Ok(Some((Token::TagStart, span)));
                        }
                        self.mode = Mode::Expr;
                        return Ok(Some((Token::ExprStart, span)));
                    }
                    Some(idx) => {
                        let text = rest[..idx].to_string();
                        self.advance(idx);
                        return Ok(Some((Token::Text(text), span)));
                    }
                    None => {
                        let text = rest.to_string();
                        self.advance(rest.len());
                        return Ok(Some((Token::Text(text), span)));
                    }
                }
            }

            let trimmed = rest.trim_start();
            if trimmed.len() != rest.len() {
                self.advance(rest.len() - trimmed.len());
                continue;
            }
            if rest.is_empty() {
                return match self.mode {
                    Mode::Bare => Ok(None),
                    Mode::Expr => Err(self.error(self.open_span, "unterminated expression, expected `}}`")),
                    _ => Err(self.error(self.open_span, "unterminated directive, expected `%}`")),
                };
            }

            if self.mode == Mode::Tag && rest.starts_with("%}") {
                self.advance(2);
                self.mode = Mode::Text;
                if self.trim_blocks {
                    let after = self.remaining();
                    if after.starts_with('\n') {
                        self.advance(1);
                    } else if after.starts_with("\r\n") {
                        self.advance(2);
                    }
                }
                return Ok(Some((Token::TagEnd, span)));
            }
            if self.mode == Mode::Expr && rest.starts_with("}}") {
                self.advance(2);
                self.mode = Mode::Text;
                return Ok(Some((Token::ExprEnd, span)));
            }
            if rest.starts_with("{{") || rest.starts_with("{%") {
                let what = if self.mode == Mode::Expr { "expression" } else { "directive" };
                return Err(self.error(self.open_span, format!("unterminated {}", what)));
            }

            return self.lex_in_tag(rest, span).map(|t| Some((t, span)));
        }
    }

    fn lex_in_tag(&mut self, rest: &'a str, span: Span) -> Result<Token, SyntaxError> {
        let double = match rest.get(..2) {
            Some("==") => Some(Token::EqEq),
            Some("!=") => Some(Token::NotEq),
            Some("<=") => Some(Token::Le),
            Some(">=") => Some(Token::Ge),
            _ => None,
        };
        if let Some(tok) = double {
            self.advance(2);
            return Ok(tok);
        }

        let first = rest.chars().next().unwrap_or(' ');
        let single = match first {
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            '|' => Some(Token::Pipe),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '=' => Some(Token::Assign),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            _ => None,
        };
        if let Some(tok) = single {
            self.advance(1);
            return Ok(tok);
        }

        if first == '\'' || first == '"' {
            return self.lex_string(rest, first, span);
        }

        if first.is_ascii_digit() {
            let digits: usize = rest
                .char_indices()
                .take_while(|(i, c)| {
                    c.is_ascii_digit()
                        || (*c == '.'
                            && rest[i + 1..].starts_with(|n: char| n.is_ascii_digit()))
                })
                .map(|(_, c)| c.len_utf8())
                .sum();
            let text = &rest[..digits];
            self.advance(digits);
            if text.contains('.') {
                return text
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| self.error(span, format!("invalid number `{}`", text)));
            }
            return text
                .parse::<i64>()
                .map(Token::Int)
                .map_err(|_| self.error(span, format!("integer `{}` out of range", text)));
        }

        if first.is_alphabetic() || first == '_' {
            let len: usize = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .map(char::len_utf8)
                .sum();
            let ident = rest[..len].to_string();
            self.advance(len);
            return Ok(Token::Ident(ident));
        }

        Err(self.error(span, format!("unexpected character `{}`", first)))
    }

    fn lex_string(&mut self, rest: &'a str, quote: char, span: Span) -> Result<Token, SyntaxError> {
        let mut s = String::new();
        let mut chars = rest.char_indices().skip(1);
        while let Some((i, c)) = chars.next() {
            if c == quote {
                self.advance(i + c.len_utf8());
                return Ok(Token::Str(s));
            }
            if c == '\\' {
                match chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, 'r')) => s.push('\r'),
                    Some((_, '0')) => s.push('\0'),
                    Some((_, 'u')) => {
                        if !matches!(chars.next(), Some((_, '{'))) {
                            return Err(self.error(span, "invalid unicode escape, expected `\\u{...}`"));
                        }
                        let hex: String = chars.by_ref().map(|(_, h)| h).take_while(|h| *h != '}').collect();
                        match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                            Some(ch) => s.push(ch),
                            None => return Err(self.error(span, format!("invalid unicode escape `\\u{{{}}}`", hex))),
                        }
                    }
                    Some((_, esc)) => s.push(esc),
                    None => break,
                }
            } else {
                s.push(c);
            }
        }
        Err(self.error(span, "unterminated string literal"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut t = Tokenizer::new(src);
        let mut out = vec![];
        while let Some(lexeme) = t.next_token().unwrap() {
            out.push(lexeme.token);
        }
        out
    }

    #[test]
    fn test_text_and_expression() {
        assert_eq!(
            tokens("Hello {{ name }}!"),
            vec![
                Token::Text("Hello ".into()),
                Token::ExprStart,
                Token::Ident("name".into()),
                Token::ExprEnd,
                Token::Text("!".into()),
            ]
        );
    }

    #[test]
    fn test_comments_are_dropped() {
        assert_eq!(tokens("a{# note #}b"), vec![Token::Text("a".into()), Token::Text("b".into())]);
    }

    #[test]
    fn test_operators_and_numbers() {
        assert_eq!(
            tokens("{% if age >= 18.5 %}"),
            vec![
                Token::TagStart,
                Token::Ident("if".into()),
                Token::Ident("age".into()),
                Token::Ge,
                Token::Float(18.5),
                Token::TagEnd,
            ]
        );
    }

    #[test]
    fn test_trim_block_newline() {
        assert_eq!(
            tokens("{% set x = 1 %}\nrest"),
            vec![
                Token::TagStart,
                Token::Ident("set".into()),
                Token::Ident("x".into()),
                Token::Assign,
                Token::Int(1),
                Token::TagEnd,
                Token::Text("rest".into()),
            ]
        );
    }

    #[test]
    fn test_unterminated_expression_reports_position() {
        let mut t = Tokenizer::new("line one\n  {{ name");
        let mut err = None;
        loop {
            match t.next_token() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        let err = err.expect("expected syntax error");
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 3);
        assert!(err.message.contains("unterminated expression"));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#"{{ "a\"b\n" }}"#),
            vec![Token::ExprStart, Token::Str("a\"b\n".into()), Token::ExprEnd]
        );
        assert_eq!(
            tokens(r#"{{ "\r\0\u{1}\u{e9}" }}"#),
            vec![Token::ExprStart, Token::Str("\r\0\u{1}é".into()), Token::ExprEnd]
        );

        let mut t = Tokenizer::new(r#"{{ "\u{zz}" }}"#);
        let err = loop {
            match t.next_token() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected an invalid escape error"),
                Err(e) => break e,
            }
        };
        assert!(err.message.contains("unicode escape"));
    }
}
