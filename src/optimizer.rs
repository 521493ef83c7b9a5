//! Optimizer - AST to AST passes
//!
//! Passes run in a fixed order, each behind its own switch:
//! partial inlining, constant folding, dead-code elimination, loop-invariant
//! hoisting, adjacent-text merging. Inlining runs first so that inlined
//! content goes through the remaining passes in the same call, which keeps
//! `optimize(optimize(x)) == optimize(x)`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::ast::{walk_nodes, Ast, BinaryOp, Expr, Node, RootNode, Span};
use crate::render::{apply_binary, apply_unary};
use crate::security::static_loop_bound;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationOptions {
    #[serde(default = "default_true")]
    pub constant_folding: bool,
    #[serde(default = "default_true")]
    pub dead_code_elimination: bool,
    #[serde(default = "default_true")]
    pub inlining: bool,
    /// Largest partial (in nodes) that is inlined.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,
    #[serde(default = "default_true")]
    pub loop_hoisting: bool,
    #[serde(default = "default_true")]
    pub merge_text: bool,
}

fn default_true() -> bool { true }
fn default_inline_threshold() -> usize { 32 }

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            constant_folding: true,
            dead_code_elimination: true,
            inlining: true,
            inline_threshold: default_inline_threshold(),
            loop_hoisting: true,
            merge_text: true,
        }
    }
}

impl OptimizationOptions {
    pub fn none() -> Self {
        Self {
            constant_folding: false,
            dead_code_elimination: false,
            inlining: false,
            inline_threshold: default_inline_threshold(),
            loop_hoisting: false,
            merge_text: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationStats {
    pub original_size: usize,
    pub optimized_size: usize,
    pub original_nodes: usize,
    pub optimized_nodes: usize,
    pub folded: usize,
    pub eliminated: usize,
    pub inlined: usize,
    pub hoisted: usize,
    pub merged: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub ast: Ast,
    pub optimized_source: String,
    pub stats: OptimizationStats,
}

pub struct Optimizer {
    options: OptimizationOptions,
    partials: BTreeMap<String, Arc<Ast>>,
}

impl Optimizer {
    pub fn new(options: OptimizationOptions) -> Self {
        assert!(
            !options.inlining || options.inline_threshold > 0,
            "inline_threshold must be non-zero when inlining is enabled"
        );
        Self {
            options,
            partials: BTreeMap::new(),
        }
    }

    /// Partial definitions available for inlining.
    pub fn with_partials(mut self, partials: BTreeMap<String, Arc<Ast>>) -> Self {
        self.partials = partials;
        self
    }

    pub fn options(&self) -> &OptimizationOptions {
        &self.options
    }

    pub fn optimize(&self, ast: &Ast) -> OptimizationResult {
        let original_source = ast.to_source();
        let mut stats = OptimizationStats {
            original_size: original_source.len(),
            original_nodes: ast.node_count(),
            ..OptimizationStats::default()
        };

        let mut variables = ast.variables.clone();
        let mut nodes = ast.nodes().to_vec();

        if self.options.inlining {
            let mut inlined = BTreeSet::new();
            nodes = self.inline(nodes, &mut Vec::new(), &mut inlined, &mut stats);
            for name in &inlined {
                if let Some(partial) = self.partials.get(name) {
                    variables.extend(partial.variables.iter().cloned());
                }
            }
        }
        if self.options.constant_folding {
            nodes = fold_nodes(nodes, &mut stats);
        }
        if self.options.dead_code_elimination {
            nodes = eliminate(nodes, &mut stats);
        }
        if self.options.loop_hoisting {
            let mut counter = count_slots(&nodes);
            nodes = hoist(nodes, &mut counter, &mut stats);
        }
        if self.options.merge_text {
            nodes = merge_text(nodes, &mut stats);
        }

        let mut partials = BTreeSet::new();
        walk_nodes(&nodes, &mut |node, _| {
            if let Node::Partial { name, .. } = node {
                partials.insert(name.clone());
            }
        });
        let optimized = Ast {
            root: RootNode { children: nodes },
            variables,
            partials,
        };
        let optimized_source = optimized.to_source();
        stats.optimized_size = optimized_source.len();
        stats.optimized_nodes = optimized.node_count();
        debug!(
            folded = stats.folded,
            eliminated = stats.eliminated,
            inlined = stats.inlined,
            hoisted = stats.hoisted,
            "optimized template"
        );

        OptimizationResult {
            ast: optimized,
            optimized_source,
            stats,
        }
    }

    fn inlinable(&self, name: &str) -> Option<&Arc<Ast>> {
        let partial = self.partials.get(name)?;
        if partial.node_count() > self.options.inline_threshold || self.reaches(name, name) {
            return None;
        }
        let mut plain = true;
        walk_nodes(partial.nodes(), &mut |node, _| {
            plain &= !matches!(
                node,
                Node::Set { .. } | Node::Extends { .. } | Node::Block { .. } | Node::Super { .. }
            );
        });
        plain.then_some(partial)
    }

    /// Whether partial `from` can include `target`, directly or transitively.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![from];
        while let Some(name) = stack.pop() {
            let partial = match self.partials.get(name) {
                Some(p) => p,
                None => continue,
            };
            for next in &partial.partials {
                if next == target {
                    return true;
                }
                if seen.insert(next.as_str()) {
                    stack.push(next);
                }
            }
        }
        false
    }

    fn inline(
        &self,
        nodes: Vec<Node>,
        active: &mut Vec<String>,
        inlined: &mut BTreeSet<String>,
        stats: &mut OptimizationStats,
    ) -> Vec<Node> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                Node::Partial { name, span } => match self.inlinable(&name) {
                    Some(partial) if !active.contains(&name) => {
                        active.push(name.clone());
                        let body = self.inline(partial.nodes().to_vec(), active, inlined, stats);
                        active.pop();
                        stats.inlined += 1;
                        inlined.insert(name);
                        out.extend(body);
                    }
                    _ => out.push(Node::Partial { name, span }),
                },
                other => out.push(other.map_children(&mut |c| self.inline(c, active, inlined, stats))),
            }
        }
        out
    }
}

fn fold_expr(expr: Expr, stats: &mut OptimizationStats) -> Expr {
    match expr {
        Expr::List(items) => {
            let items: Vec<Expr> = items.into_iter().map(|e| fold_expr(e, stats)).collect();
            if !items.iter().all(Expr::is_literal) {
                return Expr::List(items);
            }
            stats.folded += 1;
            Expr::Literal(Value::List(
                items
                    .into_iter()
                    .filter_map(|e| match e {
                        Expr::Literal(v) => Some(v),
                        _ => None,
                    })
                    .collect(),
            ))
        }
        Expr::Unary(op, operand) => {
            let operand = fold_expr(*operand, stats);
            if let Expr::Literal(v) = &operand {
                if let Ok(v) = apply_unary(op, v.clone()) {
                    stats.folded += 1;
                    return Expr::Literal(v);
                }
            }
            Expr::Unary(op, Box::new(operand))
        }
        Expr::Binary(lhs, op, rhs) => {
            let lhs = fold_expr(*lhs, stats);
            if let Expr::Literal(v) = &lhs {
                let short = match op {
                    BinaryOp::And if !v.is_truthy() => Some(false),
                    BinaryOp::Or if v.is_truthy() => Some(true),
                    _ => None,
                };
                if let Some(b) = short {
                    stats.folded += 1;
                    return Expr::Literal(Value::Bool(b));
                }
            }
            let rhs = fold_expr(*rhs, stats);
            if let (Expr::Literal(l), Expr::Literal(r)) = (&lhs, &rhs) {
                // Failing operations stay put so the error surfaces at render.
                if let Ok(v) = apply_binary(op, l.clone(), r.clone()) {
                    stats.folded += 1;
                    return Expr::Literal(v);
                }
            }
            Expr::Binary(Box::new(lhs), op, Box::new(rhs))
        }
        Expr::Attr(target, member) => Expr::Attr(Box::new(fold_expr(*target, stats)), member),
        Expr::Index(target, index) => Expr::Index(
            Box::new(fold_expr(*target, stats)),
            Box::new(fold_expr(*index, stats)),
        ),
        Expr::Call { name, args } => Expr::Call {
            name,
            args: args.into_iter().map(|e| fold_expr(e, stats)).collect(),
        },
        Expr::Hoisted { slot, expr } => Expr::Hoisted {
            slot,
            expr: Box::new(fold_expr(*expr, stats)),
        },
        other => other,
    }
}

fn fold_nodes(nodes: Vec<Node>, stats: &mut OptimizationStats) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = node.map_children(&mut |c| fold_nodes(c, stats));
        let folded = match node {
            Node::Expression { raw, expr, span } => match fold_expr(expr, stats) {
                Expr::Literal(v) => {
                    stats.folded += 1;
                    Node::Text(v.to_string())
                }
                expr => Node::Expression { raw, expr, span },
            },
            Node::Conditional {
                condition,
                then_branch,
                else_branch,
                span,
            } => Node::Conditional {
                condition: fold_expr(condition, stats),
                then_branch,
                else_branch,
                span,
            },
            Node::Loop {
                item,
                collection,
                body,
                hoisted,
                span,
            } => Node::Loop {
                item,
                collection: fold_expr(collection, stats),
                body,
                hoisted: hoisted
                    .into_iter()
                    .map(|(slot, e)| (slot, fold_expr(e, stats)))
                    .collect(),
                span,
            },
            Node::Set { name, value, span } => Node::Set {
                name,
                value: fold_expr(value, stats),
                span,
            },
            other => other,
        };
        out.push(folded);
    }
    out
}

fn eliminate(nodes: Vec<Node>, stats: &mut OptimizationStats) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Conditional {
                condition: Expr::Literal(v),
                then_branch,
                else_branch,
                ..
            } => {
                stats.eliminated += 1;
                let taken = if v.is_truthy() {
                    then_branch
                } else {
                    else_branch.unwrap_or_default()
                };
                out.extend(eliminate(taken, stats));
            }
            Node::Loop {
                collection: Expr::Literal(v),
                ..
            } if v == Value::Null || v.len() == Some(0) => {
                stats.eliminated += 1;
            }
            other => out.push(other.map_children(&mut |c| eliminate(c, stats))),
        }
    }
    out
}

fn count_slots(nodes: &[Node]) -> usize {
    let mut n = 0;
    walk_nodes(nodes, &mut |node, _| {
        if let Node::Loop { hoisted, .. } = node {
            n += hoisted.len();
        }
    });
    n
}

/// Names written by `set` anywhere under `nodes`.
fn assigned_names(nodes: &[Node]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    walk_nodes(nodes, &mut |node, _| {
        if let Node::Set { name, .. } = node {
            names.insert(name.clone());
        }
    });
    names
}

fn calls_anything(nodes: &[Node]) -> bool {
    let mut found = false;
    walk_nodes(nodes, &mut |node, _| {
        found |= node.expressions().iter().any(|e| e.contains_call());
    });
    found
}

fn is_invariant(expr: &Expr, excluded: &BTreeSet<String>) -> bool {
    let mut pure = true;
    expr.walk(&mut |e| pure &= !matches!(e, Expr::Call { .. } | Expr::Hoisted { .. }));
    pure && expr.variables().is_disjoint(excluded)
}

struct Hoister<'a> {
    excluded: &'a BTreeSet<String>,
    counter: &'a mut usize,
    slots: &'a mut Vec<(String, Expr)>,
}

impl Hoister<'_> {
    fn expr(&mut self, expr: Expr) -> Expr {
        if matches!(expr, Expr::Literal(_) | Expr::Var(_) | Expr::Hoisted { .. }) {
            return expr;
        }
        if is_invariant(&expr, self.excluded) {
            let slot = format!("$hoist{}", *self.counter);
            *self.counter += 1;
            self.slots.push((slot.clone(), expr.clone()));
            return Expr::Hoisted {
                slot,
                expr: Box::new(expr),
            };
        }
        match expr {
            Expr::List(items) => Expr::List(items.into_iter().map(|e| self.expr(e)).collect()),
            Expr::Attr(target, member) => Expr::Attr(Box::new(self.expr(*target)), member),
            Expr::Index(target, index) => Expr::Index(Box::new(self.expr(*target)), Box::new(self.expr(*index))),
            Expr::Unary(op, e) => Expr::Unary(op, Box::new(self.expr(*e))),
            Expr::Binary(lhs, op, rhs) => Expr::Binary(Box::new(self.expr(*lhs)), op, Box::new(self.expr(*rhs))),
            other => other,
        }
    }
}

fn hoist(nodes: Vec<Node>, counter: &mut usize, stats: &mut OptimizationStats) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = node.map_children(&mut |c| hoist(c, counter, stats));
        let node = match node {
            // A call may change what the next iteration sees, so bodies
            // that call anything are left alone.
            Node::Loop {
                item,
                collection,
                mut body,
                mut hoisted,
                span,
            } if !calls_anything(&body) => {
                let mut excluded = assigned_names(&body);
                excluded.insert(item.clone());
                excluded.insert("loop".to_string());
                let before = hoisted.len();
                let mut hoister = Hoister {
                    excluded: &excluded,
                    counter: &mut *counter,
                    slots: &mut hoisted,
                };
                for child in body.iter_mut() {
                    if let Node::Expression { expr, .. } = child {
                        let taken = std::mem::replace(expr, Expr::Literal(Value::Null));
                        *expr = hoister.expr(taken);
                    }
                }
                stats.hoisted += hoisted.len() - before;
                Node::Loop {
                    item,
                    collection,
                    body,
                    hoisted,
                    span,
                }
            }
            other => other,
        };
        out.push(node);
    }
    out
}

fn merge_text(nodes: Vec<Node>, stats: &mut OptimizationStats) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node.map_children(&mut |c| merge_text(c, stats)) {
            Node::Text(t) if t.is_empty() => stats.merged += 1,
            Node::Text(t) => match out.last_mut() {
                Some(Node::Text(prev)) => {
                    prev.push_str(&t);
                    stats.merged += 1;
                }
                _ => out.push(Node::Text(t)),
            },
            other => out.push(other),
        }
    }
    out
}

// --- Performance analysis ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    ComplexExpression,
    NestedLoop,
    StringConcatenation,
    FrequentReflection,
    UncachedComputation,
    LargeAllocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub impact: Impact,
    pub message: String,
    pub location: Option<Span>,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub node_count: usize,
    pub expression_count: usize,
    pub max_loop_depth: usize,
    pub max_expression_depth: usize,
    /// Weighted size of the template, independent of data.
    pub complexity_score: u64,
    /// Rough evaluation cost with loops weighted by their expected size.
    pub estimated_cost: u64,
    pub bottlenecks: Vec<Bottleneck>,
}

impl PerformanceReport {
    pub fn worst_impact(&self) -> Option<Impact> {
        self.bottlenecks.iter().map(|b| b.impact).max()
    }
}

const ASSUMED_ITERATIONS: u64 = 10;
const LARGE_LIST: usize = 256;
const LARGE_RANGE: u64 = 100_000;

struct Analysis {
    report: PerformanceReport,
}

impl Analysis {
    fn flag(&mut self, kind: BottleneckKind, impact: Impact, message: String, location: Option<Span>, suggestion: &str) {
        self.report.bottlenecks.push(Bottleneck {
            kind,
            impact,
            message,
            location,
            suggestion: suggestion.to_string(),
        });
    }

    fn nodes(&mut self, nodes: &[Node], loops: &[&str], weight: u64) {
        for node in nodes {
            self.node(node, loops, weight);
        }
    }

    fn node(&mut self, node: &Node, loops: &[&str], weight: u64) {
        self.report.node_count += 1;
        self.report.complexity_score += match node {
            Node::Loop { .. } => 5,
            Node::Conditional { .. } => 3,
            Node::Partial { .. } => 2,
            _ => 1,
        };
        self.report.estimated_cost = self.report.estimated_cost.saturating_add(weight);
        let span = node.span();
        for expr in node.expressions() {
            self.expression(expr, loops, weight, span);
        }

        match node {
            Node::Loop {
                item,
                collection,
                body,
                ..
            } => {
                let depth = loops.len() + 1;
                self.report.max_loop_depth = self.report.max_loop_depth.max(depth);
                if depth >= 2 {
                    let impact = if depth >= 3 { Impact::High } else { Impact::Medium };
                    self.flag(
                        BottleneckKind::NestedLoop,
                        impact,
                        format!("loop over `{}` is nested {} deep", collection, depth),
                        span,
                        "Precompute the inner data or flatten the iteration",
                    );
                }
                let iterations = static_loop_bound(collection).unwrap_or(ASSUMED_ITERATIONS).max(1);
                let mut inner = loops.to_vec();
                inner.push(item.as_str());
                self.nodes(body, &inner, weight.saturating_mul(iterations));
            }
            other => {
                for child in other.children() {
                    self.nodes(child, loops, weight);
                }
            }
        }
    }

    fn expression(&mut self, expr: &Expr, loops: &[&str], weight: u64, span: Option<Span>) {
        self.report.expression_count += 1;
        let depth = expr.depth();
        self.report.max_expression_depth = self.report.max_expression_depth.max(depth);
        self.report.complexity_score += depth as u64;
        self.report.estimated_cost = self.report.estimated_cost.saturating_add(weight.saturating_mul(depth as u64));
        let in_loop = !loops.is_empty();

        if depth > 8 {
            let impact = if depth > 16 { Impact::High } else { Impact::Medium };
            self.flag(
                BottleneckKind::ComplexExpression,
                impact,
                format!("expression `{}` is {} levels deep", expr, depth),
                span,
                "Compute the value in host code",
            );
        }

        expr.walk(&mut |e| match e {
            Expr::Binary(lhs, BinaryOp::Add, rhs) if in_loop => {
                let stringy = |e: &Expr| matches!(e, Expr::Literal(Value::String(_)));
                if stringy(lhs) || stringy(rhs) {
                    self.report.bottlenecks.push(Bottleneck {
                        kind: BottleneckKind::StringConcatenation,
                        impact: Impact::Medium,
                        message: format!("string concatenation `{}` inside a loop", e),
                        location: span,
                        suggestion: "Emit the parts as separate text and expressions".into(),
                    });
                }
            }
            Expr::Attr(..) if in_loop && attr_chain(e) >= 3 => {
                self.report.bottlenecks.push(Bottleneck {
                    kind: BottleneckKind::FrequentReflection,
                    impact: if loops.len() >= 2 { Impact::Medium } else { Impact::Low },
                    message: format!("property path `{}` resolved every iteration", e),
                    location: span,
                    suggestion: "Bind the value with `set` before the loop".into(),
                });
            }
            Expr::Call { name, args } if in_loop => {
                let varies = args
                    .iter()
                    .any(|a| a.variables().iter().any(|v| v == "loop" || loops.contains(&v.as_str())));
                if !varies {
                    self.report.bottlenecks.push(Bottleneck {
                        kind: BottleneckKind::UncachedComputation,
                        impact: Impact::Medium,
                        message: format!("call to `{}` repeats the same work every iteration", name),
                        location: span,
                        suggestion: "Call it once with `set` before the loop".into(),
                    });
                }
            }
            Expr::Literal(Value::List(items)) if items.len() > LARGE_LIST => {
                self.report.bottlenecks.push(Bottleneck {
                    kind: BottleneckKind::LargeAllocation,
                    impact: Impact::Medium,
                    message: format!("list literal with {} items", items.len()),
                    location: span,
                    suggestion: "Pass large data through the context".into(),
                });
            }
            Expr::List(items) if items.len() > LARGE_LIST => {
                self.report.bottlenecks.push(Bottleneck {
                    kind: BottleneckKind::LargeAllocation,
                    impact: Impact::Medium,
                    message: format!("list literal with {} items", items.len()),
                    location: span,
                    suggestion: "Pass large data through the context".into(),
                });
            }
            Expr::Call { name, .. } if name == "range" => {
                if let Some(n) = static_loop_bound(e).filter(|n| *n > LARGE_RANGE) {
                    self.report.bottlenecks.push(Bottleneck {
                        kind: BottleneckKind::LargeAllocation,
                        impact: Impact::High,
                        message: format!("`{}` materializes {} items", e, n),
                        location: span,
                        suggestion: "Iterate over a smaller range".into(),
                    });
                }
            }
            _ => {}
        });
    }
}

fn attr_chain(expr: &Expr) -> usize {
    match expr {
        Expr::Attr(target, _) => 1 + attr_chain(target),
        _ => 0,
    }
}

/// Heuristic cost report for an already parsed template.
pub fn analyze_performance(ast: &Ast) -> PerformanceReport {
    let mut analysis = Analysis {
        report: PerformanceReport::default(),
    };
    analysis.nodes(ast.nodes(), &[], 1);
    analysis.report
}
