//! AST - parsed structure of a template
//!
//! Traversal is a plain `match` over [`Node`]; [`walk_nodes`] and
//! [`Expr::walk`] cover the common pre-order visits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::hashing::content_hash;
use crate::value::Value;

/// 1-based source position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

/// Raw template text plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSource {
    pub name: String,
    pub path: Option<std::path::PathBuf>,
    pub text: String,
    pub content_hash: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "template name must not be empty");
        let text = text.into();
        Self {
            content_hash: content_hash(&text),
            name,
            path: None,
            text,
        }
    }

    pub fn with_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => "in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// `name` may be dotted (`fs.read`); the prefix is the namespace.
    Call { name: String, args: Vec<Expr> },
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    /// Loop-invariant value computed once per loop; `expr` is the fallback.
    Hoisted { slot: String, expr: Box<Expr> },
}

impl Expr {
    /// Pre-order visit of this expression and its operands.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Var(_) => {}
            Expr::List(items) => items.iter().for_each(|e| e.walk(f)),
            Expr::Call { args, .. } => args.iter().for_each(|e| e.walk(f)),
            Expr::Attr(target, _) => target.walk(f),
            Expr::Index(target, index) => {
                target.walk(f);
                index.walk(f);
            }
            Expr::Unary(_, operand) => operand.walk(f),
            Expr::Binary(lhs, _, rhs) => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Hoisted { expr, .. } => expr.walk(f),
        }
    }

    pub fn depth(&self) -> usize {
        1 + match self {
            Expr::Literal(_) | Expr::Var(_) => 0,
            Expr::List(items) => items.iter().map(Expr::depth).max().unwrap_or(0),
            Expr::Call { args, .. } => args.iter().map(Expr::depth).max().unwrap_or(0),
            Expr::Attr(target, _) => target.depth(),
            Expr::Index(a, b) | Expr::Binary(a, _, b) => a.depth().max(b.depth()),
            Expr::Unary(_, e) => e.depth(),
            Expr::Hoisted { expr, .. } => expr.depth() - 1,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }

    /// Root variable names this expression reads.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Var(name) = e {
                out.insert(name.clone());
            }
        });
        out
    }

    pub fn contains_call(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, Expr::Call { .. }));
        found
    }
}

/// String literal using only escapes the tokenizer decodes.
fn write_string_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c if c.is_control() => write!(f, "\\u{{{:x}}}", c as u32)?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

/// Float literal the tokenizer reads back to the same value: no exponent,
/// always a fractional part, and non-finite values as float arithmetic.
fn write_float_literal(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    // f64::MAX prints without an exponent; times ten overflows to infinity.
    let infinity = format!("({}.0 * 10.0)", f64::MAX);
    if x.is_nan() {
        return write!(f, "({} - {})", infinity, infinity);
    }
    if x.is_sign_negative() {
        f.write_str("-")?;
    }
    if x.is_infinite() {
        return f.write_str(&infinity);
    }
    let text = x.abs().to_string();
    if text.contains('.') {
        f.write_str(&text)
    } else {
        write!(f, "{}.0", text)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => match v {
                Value::Null => f.write_str("null"),
                Value::String(s) => write_string_literal(f, s),
                Value::Float(x) => write_float_literal(f, *x),
                Value::Int(i64::MIN) => write!(f, "(-{} - 1)", i64::MAX),
                Value::List(items) => {
                    let items: Vec<Expr> = items.iter().cloned().map(Expr::Literal).collect();
                    write!(f, "{}", Expr::List(items))
                }
                other => write!(f, "{}", other),
            },
            Expr::Var(name) => f.write_str(name),
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Expr::Attr(target, name) => write!(f, "{}.{}", target, name),
            Expr::Index(target, index) => write!(f, "{}[{}]", target, index),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Unary(UnaryOp::Not, e) => write!(f, "not ({})", e),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-({})", e),
            Expr::Binary(lhs, op, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Hoisted { expr, .. } => write!(f, "{}", expr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Text(String),
    Expression {
        raw: String,
        expr: Expr,
        span: Span,
    },
    Conditional {
        condition: Expr,
        then_branch: Vec<Node>,
        else_branch: Option<Vec<Node>>,
        span: Span,
    },
    Loop {
        item: String,
        collection: Expr,
        body: Vec<Node>,
        /// Slots evaluated once before the first iteration.
        hoisted: Vec<(String, Expr)>,
        span: Span,
    },
    Partial {
        name: String,
        span: Span,
    },
    Block {
        name: String,
        content: Vec<Node>,
        overridable: bool,
        required: bool,
        default_content: Vec<Node>,
        span: Span,
    },
    Extends {
        layout: String,
        span: Span,
    },
    Set {
        name: String,
        value: Expr,
        span: Span,
    },
    /// Placeholder for the overridden block's content; replaced during merge.
    Super {
        span: Span,
    },
}

impl Node {
    /// Ordered child sequences of this node.
    pub fn children(&self) -> Vec<&[Node]> {
        match self {
            Node::Conditional {
                then_branch,
                else_branch,
                ..
            } => {
                let mut out = vec![then_branch.as_slice()];
                if let Some(e) = else_branch {
                    out.push(e.as_slice());
                }
                out
            }
            Node::Loop { body, .. } => vec![body.as_slice()],
            Node::Block { content, .. } => vec![content.as_slice()],
            _ => vec![],
        }
    }

    /// Expressions held directly by this node (not its children).
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            Node::Expression { expr, .. } => vec![expr],
            Node::Conditional { condition, .. } => vec![condition],
            Node::Loop {
                collection,
                hoisted,
                ..
            } => std::iter::once(collection)
                .chain(hoisted.iter().map(|(_, e)| e))
                .collect(),
            Node::Set { value, .. } => vec![value],
            _ => vec![],
        }
    }

    /// Rebuild this node with `f` applied to each child sequence.
    /// `default_content` of a block is left untouched.
    pub fn map_children(self, f: &mut impl FnMut(Vec<Node>) -> Vec<Node>) -> Node {
        match self {
            Node::Conditional {
                condition,
                then_branch,
                else_branch,
                span,
            } => {
                let then_branch = f(then_branch);
                let else_branch = match else_branch {
                    Some(e) => Some(f(e)),
                    None => None,
                };
                Node::Conditional {
                    condition,
                    then_branch,
                    else_branch,
                    span,
                }
            }
            Node::Loop {
                item,
                collection,
                body,
                hoisted,
                span,
            } => Node::Loop {
                item,
                collection,
                body: f(body),
                hoisted,
                span,
            },
            Node::Block {
                name,
                content,
                overridable,
                required,
                default_content,
                span,
            } => Node::Block {
                name,
                content: f(content),
                overridable,
                required,
                default_content,
                span,
            },
            other => other,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Node::Text(_) => None,
            Node::Expression { span, .. }
            | Node::Conditional { span, .. }
            | Node::Loop { span, .. }
            | Node::Partial { span, .. }
            | Node::Block { span, .. }
            | Node::Extends { span, .. }
            | Node::Set { span, .. }
            | Node::Super { span } => Some(*span),
        }
    }
}

/// Pre-order traversal with nesting depth (top level is 0).
pub fn walk_nodes<'a>(nodes: &'a [Node], f: &mut impl FnMut(&'a Node, usize)) {
    fn go<'a>(nodes: &'a [Node], depth: usize, f: &mut impl FnMut(&'a Node, usize)) {
        for node in nodes {
            f(node, depth);
            for child in node.children() {
                go(child, depth + 1, f);
            }
        }
    }
    go(nodes, 0, f)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootNode {
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    pub root: RootNode,
    pub variables: BTreeSet<String>,
    pub partials: BTreeSet<String>,
}

impl Ast {
    pub fn nodes(&self) -> &[Node] {
        &self.root.children
    }

    /// Layout named by a top-level `extends`, if any.
    pub fn extends(&self) -> Option<&str> {
        self.nodes().iter().find_map(|n| match n {
            Node::Extends { layout, .. } => Some(layout.as_str()),
            _ => None,
        })
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        walk_nodes(self.nodes(), &mut |_, _| count += 1);
        count
    }

    /// Regenerate normalized template text.
    pub fn to_source(&self) -> String {
        let mut w = SourceWriter::default();
        w.nodes(self.nodes());
        w.out
    }
}

/// Prints nodes back to template syntax. A newline right after `%}` is
/// eaten by the tokenizer, so one is doubled to survive a reparse.
#[derive(Default)]
struct SourceWriter {
    out: String,
    after_tag: bool,
}

impl SourceWriter {
    fn tag(&mut self, text: &str) {
        self.out.push_str(text);
        self.after_tag = true;
    }

    fn nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &Node) {
        match node {
            // Text the tokenizer would read differently goes out as a literal.
            Node::Text(t)
                if t.contains('\r') || t.ends_with('{') || ["{{", "{%", "{#"].iter().any(|d| t.contains(d)) =>
            {
                let literal = Expr::Literal(Value::String(t.clone()));
                self.out.push_str(&format!("{{{{ {} }}}}", literal));
                self.after_tag = false;
            }
            Node::Text(t) => {
                if self.after_tag && (t.starts_with('\n') || t.starts_with("\r\n")) {
                    self.out.push('\n');
                }
                self.out.push_str(t);
                self.after_tag = false;
            }
            Node::Expression { expr, .. } => {
                self.out.push_str(&format!("{{{{ {} }}}}", expr));
                self.after_tag = false;
            }
            Node::Conditional {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.tag(&format!("{{% if {} %}}", condition));
                self.nodes(then_branch);
                if let Some(e) = else_branch {
                    self.tag("{% else %}");
                    self.nodes(e);
                }
                self.tag("{% end %}");
            }
            Node::Loop {
                item,
                collection,
                body,
                ..
            } => {
                self.tag(&format!("{{% for {} in {} %}}", item, collection));
                self.nodes(body);
                self.tag("{% end %}");
            }
            Node::Partial { name, .. } => self.tag(&format!("{{% include {:?} %}}", name)),
            Node::Block {
                name,
                content,
                overridable,
                required,
                ..
            } => {
                let mut open = format!("{{% block {}", name);
                if *required {
                    open.push_str(" required");
                }
                if !overridable {
                    open.push_str(" final");
                }
                open.push_str(" %}");
                self.tag(&open);
                self.nodes(content);
                self.tag("{% end %}");
            }
            Node::Extends { layout, .. } => self.tag(&format!("{{% extends {:?} %}}", layout)),
            Node::Set { name, value, .. } => self.tag(&format!("{{% set {} = {} %}}", name, value)),
            Node::Super { .. } => self.tag("{% super %}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_depth() {
        let e = Expr::Binary(
            Box::new(Expr::Var("a".into())),
            BinaryOp::Add,
            Box::new(Expr::Attr(Box::new(Expr::Var("b".into())), "c".into())),
        );
        assert_eq!(e.depth(), 3);
        assert_eq!(e.variables().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_walk_nodes_depth() {
        let nodes = vec![Node::Loop {
            item: "x".into(),
            collection: Expr::Var("xs".into()),
            body: vec![Node::Text("t".into())],
            hoisted: vec![],
            span: Span::default(),
        }];
        let mut seen = vec![];
        walk_nodes(&nodes, &mut |_, d| seen.push(d));
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_literal_display_reparses_to_same_value() {
        use crate::compiler::compile_expression;
        use crate::context::TemplateContext;

        let values = vec![
            Value::from("quote \" slash \\ nl \n tab \t cr \r nul \0 bell \u{7} del \u{7f} é"),
            Value::Int(i64::MIN),
            Value::Int(-3),
            Value::Float(1e300),
            Value::Float(1e-7),
            Value::Float(-0.5),
            Value::Float(2.0),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
        ];
        let mut ctx = TemplateContext::new();
        for v in values {
            let text = Expr::Literal(v.clone()).to_string();
            let back = compile_expression(&text).unwrap().evaluate(&mut ctx).unwrap();
            assert_eq!(back, v, "{}", text);
        }
        let nan = Expr::Literal(Value::Float(f64::NAN)).to_string();
        match compile_expression(&nan).unwrap().evaluate(&mut ctx).unwrap() {
            Value::Float(x) => assert!(x.is_nan()),
            other => panic!("expected NaN, got {:?}", other),
        }
    }

    #[test]
    fn test_to_source_escapes_text_that_would_lex_differently() {
        use crate::hashing::normalize_source;

        let text = "a{{ b }}\r\u{1}{";
        let ast = Ast {
            root: RootNode {
                children: vec![Node::Text(text.into()), Node::Text("% c".into())],
            },
            ..Ast::default()
        };
        let back = crate::parser::parse(&normalize_source(&ast.to_source())).unwrap();
        match back.nodes() {
            [Node::Expression { expr, .. }, Node::Text(rest)] => {
                assert_eq!(expr, &Expr::Literal(Value::from(text)));
                assert_eq!(rest, "% c");
            }
            other => panic!("unexpected nodes {:?}", other),
        }
    }

    #[test]
    fn test_source_content_hash_is_normalized() {
        let a = TemplateSource::new("a", "x\r\ny");
        let b = TemplateSource::new("b", "x\ny");
        assert_eq!(a.content_hash, b.content_hash);
    }
}
