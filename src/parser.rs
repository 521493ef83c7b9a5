//! Parser - template text to AST in one pass
//!
//! Control constructs are matched with an explicit stack of open blocks, so
//! an unmatched `end` or an unclosed `if` is reported with the position of
//! the offending directive. Referenced variables and partials are collected
//! while parsing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

use crate::ast::{Ast, BinaryOp, Expr, Node, RootNode, Span, UnaryOp};
use crate::lexer::{Lexeme, Token, Tokenizer};
use crate::value::Value;

const MAX_EXPR_NESTING: usize = 128;
const MAX_BLOCK_NESTING: usize = 256;
const SNIPPET_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("syntax error at {line}:{column}: {message} | {snippet}")]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub snippet: String,
}

impl SyntaxError {
    pub fn at(source: &str, span: Span, message: impl Into<String>) -> Self {
        let line_text = source
            .lines()
            .nth(span.line.saturating_sub(1) as usize)
            .unwrap_or("")
            .trim_end();
        Self {
            message: message.into(),
            line: span.line,
            column: span.column,
            snippet: line_text.chars().take(SNIPPET_WIDTH).collect(),
        }
    }
}

/// Parse a whole template.
pub fn parse(source: &str) -> Result<Ast, SyntaxError> {
    Parser::new(source).parse()
}

/// Parse host-supplied expression text such as `user.name | upper`.
pub fn parse_expression(text: &str) -> Result<Expr, SyntaxError> {
    let mut parser = Parser {
        lexer: Tokenizer::expression(text),
        ..Parser::new(text)
    };
    let expr = parser.parse_expr()?;
    match parser.consume()? {
        None => Ok(expr),
        Some(lx) => Err(parser.error(lx.span, format!("unexpected {} after expression", lx.token.describe()))),
    }
}

enum OpenKind {
    If {
        arms: Vec<(Expr, Vec<Node>)>,
        pending: Option<Expr>,
    },
    For {
        item: String,
        collection: Expr,
    },
    Block {
        name: String,
        required: bool,
        overridable: bool,
    },
}

impl OpenKind {
    fn keyword(&self) -> &'static str {
        match self {
            OpenKind::If { .. } => "if",
            OpenKind::For { .. } => "for",
            OpenKind::Block { .. } => "block",
        }
    }
}

struct OpenBlock {
    kind: OpenKind,
    span: Span,
    children: Vec<Node>,
}

pub struct Parser<'a> {
    source: &'a str,
    lexer: Tokenizer<'a>,
    buffer: VecDeque<Lexeme>,
    last_span: Span,
    stack: Vec<OpenBlock>,
    root: Vec<Node>,
    locals: Vec<String>,
    variables: BTreeSet<String>,
    partials: BTreeSet<String>,
    blocks: BTreeSet<String>,
    seen_extends: bool,
    nesting: usize,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            lexer: Tokenizer::new(source),
            buffer: VecDeque::new(),
            last_span: Span { line: 1, column: 1 },
            stack: Vec::new(),
            root: Vec::new(),
            locals: Vec::new(),
            variables: BTreeSet::new(),
            partials: BTreeSet::new(),
            blocks: BTreeSet::new(),
            seen_extends: false,
            nesting: 0,
        }
    }

    fn error(&self, span: Span, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at(self.source, span, message)
    }

    /// Each `elif` arm becomes one more nested conditional.
    fn check_block_depth(&self, span: Span) -> Result<(), SyntaxError> {
        let depth: usize = self
            .stack
            .iter()
            .map(|open| match &open.kind {
                OpenKind::If { arms, .. } => 1 + arms.len(),
                _ => 1,
            })
            .sum();
        if depth >= MAX_BLOCK_NESTING {
            return Err(self.error(span, "blocks nested too deeply"));
        }
        Ok(())
    }

    /// Count one level of expression depth against the nesting limit.
    fn deepen(&mut self) -> Result<(), SyntaxError> {
        self.nesting += 1;
        if self.nesting > MAX_EXPR_NESTING {
            return Err(self.error(self.last_span, "expression nested too deeply"));
        }
        Ok(())
    }

    fn peek(&mut self) -> Result<Option<&Token>, SyntaxError> {
        if self.buffer.is_empty() {
            if let Some(lx) = self.lexer.next_token()? {
                self.buffer.push_back(lx);
            }
        }
        Ok(self.buffer.front().map(|lx| &lx.token))
    }

    fn consume(&mut self) -> Result<Option<Lexeme>, SyntaxError> {
        let next = match self.buffer.pop_front() {
            Some(lx) => Some(lx),
            None => self.lexer.next_token()?,
        };
        if let Some(lx) = &next {
            self.last_span = lx.span;
        }
        Ok(next)
    }

    fn expect(&mut self, token: Token) -> Result<Lexeme, SyntaxError> {
        match self.consume()? {
            Some(lx) if lx.token == token => Ok(lx),
            Some(lx) => Err(self.error(
                lx.span,
                format!("expected {}, found {}", token.describe(), lx.token.describe()),
            )),
            None => Err(self.error(self.last_span, format!("expected {}, found end of input", token.describe()))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Span), SyntaxError> {
        match self.consume()? {
            Some(Lexeme { token: Token::Ident(s), span, .. }) => Ok((s, span)),
            Some(lx) => Err(self.error(lx.span, format!("expected {}, found {}", what, lx.token.describe()))),
            None => Err(self.error(self.last_span, format!("expected {}, found end of input", what))),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String, SyntaxError> {
        match self.consume()? {
            Some(Lexeme { token: Token::Str(s), .. }) if !s.is_empty() => Ok(s),
            Some(lx) => Err(self.error(lx.span, format!("expected quoted {}, found {}", what, lx.token.describe()))),
            None => Err(self.error(self.last_span, format!("expected quoted {}, found end of input", what))),
        }
    }

    fn push_node(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(open) => open.children.push(node),
            None => self.root.push(node),
        }
    }

    fn collect_variables(&mut self, expr: &Expr) {
        for name in expr.variables() {
            if !self.locals.contains(&name) {
                self.variables.insert(name);
            }
        }
    }

    pub fn parse(mut self) -> Result<Ast, SyntaxError> {
        while let Some(lx) = self.consume()? {
            match lx.token {
                Token::Text(s) => self.push_node(Node::Text(s)),
                Token::ExprStart => {
                    let expr = self.parse_expr()?;
                    let end = self.expect(Token::ExprEnd)?;
                    let raw = self.source[lx.end..end.start].trim().to_string();
                    self.collect_variables(&expr);
                    self.push_node(Node::Expression {
                        raw,
                        expr,
                        span: lx.span,
                    });
                }
                Token::TagStart => self.parse_directive(lx.span)?,
                other => {
                    return Err(self.error(lx.span, format!("unexpected {}", other.describe())));
                }
            }
        }

        if let Some(open) = self.stack.last() {
            return Err(self.error(
                open.span,
                format!("unclosed `{}` block, expected `{{% end %}}`", open.kind.keyword()),
            ));
        }

        Ok(Ast {
            root: RootNode { children: self.root },
            variables: self.variables,
            partials: self.partials,
        })
    }

    fn parse_directive(&mut self, span: Span) -> Result<(), SyntaxError> {
        let (keyword, kw_span) = self.expect_ident("directive name")?;
        match keyword.as_str() {
            "if" => {
                self.check_block_depth(span)?;
                let condition = self.parse_expr()?;
                self.expect(Token::TagEnd)?;
                self.collect_variables(&condition);
                self.stack.push(OpenBlock {
                    kind: OpenKind::If {
                        arms: Vec::new(),
                        pending: Some(condition),
                    },
                    span,
                    children: Vec::new(),
                });
            }
            "elif" | "else" => {
                let condition = if keyword == "elif" {
                    self.check_block_depth(span)?;
                    let c = self.parse_expr()?;
                    self.collect_variables(&c);
                    Some(c)
                } else {
                    None
                };
                self.expect(Token::TagEnd)?;
                let open = match self.stack.last_mut() {
                    Some(open) => open,
                    None => return Err(self.error(span, format!("`{}` outside of an `if` block", keyword))),
                };
                match &mut open.kind {
                    OpenKind::If { arms, pending } => match pending.take() {
                        Some(cond) => {
                            arms.push((cond, std::mem::take(&mut open.children)));
                            *pending = condition;
                        }
                        None => {
                            return Err(SyntaxError::at(
                                self.source,
                                span,
                                format!("`{}` after `else` in the same `if` block", keyword),
                            ))
                        }
                    },
                    other => {
                        let kw = other.keyword();
                        return Err(SyntaxError::at(
                            self.source,
                            span,
                            format!("`{}` inside a `{}` block", keyword, kw),
                        ));
                    }
                }
            }
            "end" | "endif" | "endfor" | "endblock" => {
                self.expect(Token::TagEnd)?;
                let open = match self.stack.pop() {
                    Some(open) => open,
                    None => return Err(self.error(span, format!("`{}` without an open block", keyword))),
                };
                let expected = match keyword.as_str() {
                    "endif" => Some("if"),
                    "endfor" => Some("for"),
                    "endblock" => Some("block"),
                    _ => None,
                };
                if let Some(expected) = expected {
                    if open.kind.keyword() != expected {
                        return Err(self.error(
                            span,
                            format!(
                                "`{}` closes a `{}` block opened at line {}",
                                keyword,
                                open.kind.keyword(),
                                open.span.line
                            ),
                        ));
                    }
                }
                let node = self.close_block(open);
                self.push_node(node);
            }
            "for" => {
                self.check_block_depth(span)?;
                let (item, _) = self.expect_ident("loop variable")?;
                match self.expect_ident("`in`")? {
                    (kw, _) if kw == "in" => {}
                    (other, s) => return Err(self.error(s, format!("expected `in`, found `{}`", other))),
                }
                let collection = self.parse_expr()?;
                self.expect(Token::TagEnd)?;
                self.collect_variables(&collection);
                self.locals.push(item.clone());
                self.locals.push("loop".to_string());
                self.stack.push(OpenBlock {
                    kind: OpenKind::For { item, collection },
                    span,
                    children: Vec::new(),
                });
            }
            "include" | "partial" => {
                let name = self.expect_string("partial name")?;
                self.expect(Token::TagEnd)?;
                self.partials.insert(name.clone());
                self.push_node(Node::Partial { name, span });
            }
            "block" => {
                self.check_block_depth(span)?;
                let (name, name_span) = self.expect_ident("block name")?;
                let mut required = false;
                let mut overridable = true;
                loop {
                    match self.consume()? {
                        Some(Lexeme { token: Token::TagEnd, .. }) => break,
                        Some(Lexeme { token: Token::Ident(flag), span: s, .. }) => match flag.as_str() {
                            "required" => required = true,
                            "final" => overridable = false,
                            other => return Err(self.error(s, format!("unknown block flag `{}`", other))),
                        },
                        Some(lx) => return Err(self.error(lx.span, format!("unexpected {} in block directive", lx.token.describe()))),
                        None => return Err(self.error(span, "unterminated directive, expected `%}`")),
                    }
                }
                if !self.blocks.insert(name.clone()) {
                    return Err(self.error(name_span, format!("duplicate block `{}`", name)));
                }
                self.stack.push(OpenBlock {
                    kind: OpenKind::Block {
                        name,
                        required,
                        overridable,
                    },
                    span,
                    children: Vec::new(),
                });
            }
            "extends" => {
                let layout = self.expect_string("layout name")?;
                self.expect(Token::TagEnd)?;
                if !self.stack.is_empty() {
                    return Err(self.error(span, "`extends` must appear at the top level"));
                }
                if self.seen_extends {
                    return Err(self.error(span, "a template may only `extends` one layout"));
                }
                self.seen_extends = true;
                self.push_node(Node::Extends { layout, span });
            }
            "set" => {
                let (name, _) = self.expect_ident("variable name")?;
                self.expect(Token::Assign)?;
                let value = self.parse_expr()?;
                self.expect(Token::TagEnd)?;
                self.collect_variables(&value);
                self.push_node(Node::Set { name, value, span });
            }
            "super" => {
                self.expect(Token::TagEnd)?;
                let in_block = self
                    .stack
                    .iter()
                    .any(|o| matches!(o.kind, OpenKind::Block { .. }));
                if !in_block {
                    return Err(self.error(span, "`super` outside of a `block`"));
                }
                self.push_node(Node::Super { span });
            }
            other => {
                return Err(self.error(kw_span, format!("unknown directive `{}`", other)));
            }
        }
        Ok(())
    }

    fn close_block(&mut self, open: OpenBlock) -> Node {
        let OpenBlock { kind, span, children } = open;
        match kind {
            OpenKind::If { mut arms, pending } => {
                let mut else_branch = match pending {
                    Some(cond) => {
                        arms.push((cond, children));
                        None
                    }
                    None => Some(children),
                };
                let mut node = None;
                for (condition, then_branch) in arms.into_iter().rev() {
                    let n = Node::Conditional {
                        condition,
                        then_branch,
                        else_branch: else_branch.take(),
                        span,
                    };
                    else_branch = Some(vec![n.clone()]);
                    node = Some(n);
                }
                node.unwrap_or(Node::Text(String::new()))
            }
            OpenKind::For { item, collection } => {
                self.locals.truncate(self.locals.len().saturating_sub(2));
                Node::Loop {
                    item,
                    collection,
                    body: children,
                    hoisted: Vec::new(),
                    span,
                }
            }
            OpenKind::Block {
                name,
                required,
                overridable,
            } => Node::Block {
                name,
                content: children.clone(),
                overridable,
                required,
                default_content: children,
                span,
            },
        }
    }

    // --- Expressions ---

    fn peek_keyword(&mut self, kw: &str) -> Result<bool, SyntaxError> {
        Ok(matches!(self.peek()?, Some(Token::Ident(s)) if s == kw))
    }

    /// Every level the resulting tree grows, whether by recursion or by a
    /// left fold, counts against `MAX_EXPR_NESTING`. On error the parser is
    /// abandoned, so the counter is only restored on success.
    pub fn parse_expr(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        self.deepen()?;
        let expr = self.parse_or()?;
        self.nesting = depth;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or")? {
            self.consume()?;
            self.deepen()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(Box::new(lhs), BinaryOp::Or, Box::new(rhs));
        }
        self.nesting = depth;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and")? {
            self.consume()?;
            self.deepen()?;
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(Box::new(lhs), BinaryOp::And, Box::new(rhs));
        }
        self.nesting = depth;
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.peek_keyword("not")? {
            self.consume()?;
            let depth = self.nesting;
            self.deepen()?;
            let operand = self.parse_not()?;
            self.nesting = depth;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek()? {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::Ident(s)) if s == "in" => BinaryOp::In,
                _ => break,
            };
            self.consume()?;
            self.deepen()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        self.nesting = depth;
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek()? {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume()?;
            self.deepen()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        self.nesting = depth;
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek()? {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.consume()?;
            self.deepen()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        self.nesting = depth;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        if let Some(Token::Minus) = self.peek()? {
            self.consume()?;
            let depth = self.nesting;
            self.deepen()?;
            let operand = self.parse_unary()?;
            self.nesting = depth;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek()? {
            self.consume()?;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.consume()? {
                Some(Lexeme { token: Token::Comma, .. }) => continue,
                Some(Lexeme { token: Token::RParen, .. }) => break,
                Some(lx) => return Err(self.error(lx.span, format!("expected `,` or `)`, found {}", lx.token.describe()))),
                None => return Err(self.error(self.last_span, "unterminated argument list")),
            }
        }
        Ok(args)
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let depth = self.nesting;
        let mut expr = self.parse_primary()?;
        loop {
            if matches!(
                self.peek()?,
                Some(Token::Dot | Token::LBracket | Token::LParen | Token::Pipe)
            ) {
                self.deepen()?;
            }
            match self.peek()? {
                Some(Token::Dot) => {
                    self.consume()?;
                    let (attr, _) = self.expect_ident("attribute name")?;
                    expr = Expr::Attr(Box::new(expr), attr);
                }
                Some(Token::LBracket) => {
                    self.consume()?;
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::LParen) => {
                    let span = self.last_span;
                    self.consume()?;
                    let name = match dotted_name(&expr) {
                        Some(name) => name,
                        None => return Err(self.error(span, "only named functions can be called")),
                    };
                    let args = self.parse_args()?;
                    expr = Expr::Call { name, args };
                }
                Some(Token::Pipe) => {
                    self.consume()?;
                    let (mut name, _) = self.expect_ident("filter name")?;
                    while let Some(Token::Dot) = self.peek()? {
                        self.consume()?;
                        let (part, _) = self.expect_ident("filter name")?;
                        name = format!("{}.{}", name, part);
                    }
                    let mut args = vec![expr];
                    if let Some(Token::LParen) = self.peek()? {
                        self.consume()?;
                        args.extend(self.parse_args()?);
                    }
                    expr = Expr::Call { name, args };
                }
                _ => break,
            }
        }
        self.nesting = depth;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let lx = match self.consume()? {
            Some(lx) => lx,
            None => return Err(self.error(self.last_span, "expected expression, found end of input")),
        };
        match lx.token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Ident(s) => match s.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "none" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" => {
                    Err(self.error(lx.span, format!("expected expression, found keyword `{}`", s)))
                }
                _ => Ok(Expr::Var(s)),
            },
            Token::LParen => {
                let e = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if let Some(Token::RBracket) = self.peek()? {
                    self.consume()?;
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    match self.consume()? {
                        Some(Lexeme { token: Token::Comma, .. }) => continue,
                        Some(Lexeme { token: Token::RBracket, .. }) => break,
                        Some(lx) => return Err(self.error(lx.span, format!("expected `,` or `]`, found {}", lx.token.describe()))),
                        None => return Err(self.error(self.last_span, "unterminated list literal")),
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(self.error(lx.span, format!("expected expression, found {}", other.describe()))),
        }
    }
}

fn dotted_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Var(name) => Some(name.clone()),
        Expr::Attr(target, attr) => dotted_name(target).map(|prefix| format!("{}.{}", prefix, attr)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_and_expression() {
        let ast = parse("Hello {{ name }}!").unwrap();
        assert_eq!(ast.nodes().len(), 3);
        match &ast.nodes()[1] {
            Node::Expression { raw, expr, .. } => {
                assert_eq!(raw, "name");
                assert_eq!(expr, &Expr::Var("name".into()));
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(ast.variables.contains("name"));
    }

    #[test]
    fn test_parse_if_elif_else_nests() {
        let ast = parse("{% if a %}A{% elif b %}B{% else %}C{% end %}").unwrap();
        match &ast.nodes()[0] {
            Node::Conditional { else_branch: Some(e), .. } => match &e[0] {
                Node::Conditional { else_branch: Some(inner), .. } => {
                    assert_eq!(inner, &vec![Node::Text("C".into())]);
                }
                other => panic!("expected nested conditional, got {:?}", other),
            },
            other => panic!("unexpected node {:?}", other),
        }
        assert_eq!(ast.variables.len(), 2);
    }

    #[test]
    fn test_loop_variable_is_local() {
        let ast = parse("{% for u in users %}{{ u.name }}{{ loop.index }}{{ site }}{% end %}").unwrap();
        let vars: Vec<_> = ast.variables.iter().cloned().collect();
        assert_eq!(vars, vec!["site", "users"]);
    }

    #[test]
    fn test_partials_collected() {
        let ast = parse(r#"{% include "header" %}body{% partial "footer" %}"#).unwrap();
        assert!(ast.partials.contains("header"));
        assert!(ast.partials.contains("footer"));
    }

    #[test]
    fn test_unclosed_block_reports_open_position() {
        let err = parse("line\n{% if x %}never closed").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);
        assert!(err.message.contains("unclosed `if`"));
        assert_eq!(err.snippet, "{% if x %}never closed");
    }

    #[test]
    fn test_unmatched_end_is_fatal() {
        let err = parse("text {% end %}").unwrap_err();
        assert!(err.message.contains("without an open block"));
    }

    #[test]
    fn test_mismatched_end_keyword() {
        let err = parse("{% for x in xs %}{% endif %}").unwrap_err();
        assert!(err.message.contains("closes a `for` block"));
    }

    #[test]
    fn test_nested_extends_rejected() {
        let err = parse(r#"{% if x %}{% extends "base" %}{% end %}"#).unwrap_err();
        assert!(err.message.contains("top level"));
    }

    #[test]
    fn test_block_flags() {
        let ast = parse("{% block title required final %}T{% end %}").unwrap();
        match &ast.nodes()[0] {
            Node::Block { name, required, overridable, default_content, .. } => {
                assert_eq!(name, "title");
                assert!(*required);
                assert!(!*overridable);
                assert_eq!(default_content, &vec![Node::Text("T".into())]);
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_parse_expression_precedence() {
        let e = parse_expression("a + b * 2 == c and not d").unwrap();
        assert_eq!(e.to_string(), "(((a + (b * 2)) == c) and not (d))");
    }

    #[test]
    fn test_filter_and_dotted_call() {
        let e = parse_expression("name | upper").unwrap();
        assert_eq!(e, Expr::Call { name: "upper".into(), args: vec![Expr::Var("name".into())] });
        let e = parse_expression("fs.read(\"x\")").unwrap();
        assert!(matches!(e, Expr::Call { ref name, .. } if name == "fs.read"));
    }

    #[test]
    fn test_parse_expression_trailing_garbage() {
        assert!(parse_expression("a b").is_err());
    }

    #[test]
    fn test_deep_chains_are_syntax_errors() {
        let chains = [
            format!("{{{{ a{} }}}}", ".b".repeat(100_000)),
            format!("{{{{ {}x }}}}", "not ".repeat(100_000)),
            format!("{{{{ {}1 }}}}", "- ".repeat(100_000)),
            format!("{{{{ a{} }}}}", " + a".repeat(100_000)),
            format!("{{{{ x{} }}}}", " | upper".repeat(100_000)),
        ];
        for src in &chains {
            let err = parse(src).unwrap_err();
            assert!(err.message.contains("nested too deeply"), "{}", err.message);
        }
        assert!(parse_expression(&format!("a{}", "[0]".repeat(100_000))).is_err());
    }

    #[test]
    fn test_deep_blocks_are_syntax_errors() {
        let src = format!("{}{}", "{% if x %}".repeat(50_000), "{% end %}".repeat(50_000));
        assert!(parse(&src).unwrap_err().message.contains("blocks nested too deeply"));
        let src = format!("{{% if a %}}{}{{% end %}}", "{% elif b %}".repeat(50_000));
        assert!(parse(&src).unwrap_err().message.contains("blocks nested too deeply"));
    }

    #[test]
    fn test_moderate_chains_still_parse() {
        assert!(parse(&format!("{{{{ a{} }}}}", ".b".repeat(40))).is_ok());
        assert!(parse(&format!("{{{{ a{} }}}}", " + 1".repeat(40))).is_ok());
    }

    #[test]
    fn test_source_roundtrip_is_stable() {
        let src = "{% if a >= 1 %}{{ b | upper }}{% else %}{% for x in [1, 2] %}{{ x }}{% end %}{% end %}";
        let once = parse(src).unwrap().to_source();
        let twice = parse(&once).unwrap().to_source();
        assert_eq!(once, twice);
    }
}
