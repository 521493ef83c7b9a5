//! Compiler - AST to bytecode
//!
//! Control flow is flattened into jumps so rendering is a single loop over
//! an instruction array. A merged, optimized AST is expected; anything that
//! should have been resolved earlier is rejected here with a `CompileError`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::ast::{walk_nodes, Ast, Expr, Node, RootNode, Span};
use crate::context::TemplateContext;
use crate::hashing::{canonical_json, sha256_hex};
use crate::optimizer::OptimizationStats;
use crate::parser::{parse_expression, SyntaxError};
use crate::render::{render_program, Evaluator, RenderEnv, RenderError, RenderOptions, RenderOutput};
use crate::security::{RuntimeLimits, SecurityResult};
use crate::value::Value;

const MAX_LIFTED_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("unresolved `extends \"{layout}\"`; the inheritance chain must be merged before compiling")]
    UnresolvedExtends { layout: String },

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("cache key error: {0}")]
    CacheKey(#[from] serde_json::Error),

    #[error("AST encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Text(String),
    Emit(Expr),
    Set { name: String, value: Expr },
    JumpUnless { condition: Expr, target: usize },
    Jump { target: usize },
    /// Jumps to `exit` when the collection is empty.
    LoopStart {
        item: String,
        collection: Expr,
        hoisted: Vec<(String, Expr)>,
        exit: usize,
    },
    /// Jumps back to `body` while items remain.
    LoopNext { body: usize },
    Include { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    /// Source position per instruction; empty unless built with debug info.
    pub spans: Vec<Option<Span>>,
}

/// Compiled partial programs by name.
pub type PartialTable = BTreeMap<String, Arc<Program>>;

impl Program {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn span_of(&self, pc: usize) -> Option<Span> {
        self.spans.get(pc).copied().flatten()
    }

    /// Check jump targets and loop pairing.
    pub fn verify(&self) -> Result<(), CompileError> {
        let len = self.instructions.len();
        let mut open_loops: Vec<usize> = vec![];
        for (pc, ins) in self.instructions.iter().enumerate() {
            let target = match ins {
                Instruction::JumpUnless { target, .. } | Instruction::Jump { target } => Some(*target),
                Instruction::LoopStart { exit, .. } => {
                    open_loops.push(pc);
                    Some(*exit)
                }
                Instruction::LoopNext { body } => {
                    match open_loops.pop() {
                        Some(start) if *body == start + 1 => {}
                        _ => {
                            return Err(CompileError::InvalidProgram(format!(
                                "loop end at {} does not match a loop start",
                                pc
                            )))
                        }
                    }
                    Some(*body)
                }
                _ => None,
            };
            if let Some(t) = target.filter(|t| *t > len) {
                return Err(CompileError::InvalidProgram(format!(
                    "jump at {} targets {} past the end ({})",
                    pc, t, len
                )));
            }
        }
        if !open_loops.is_empty() {
            return Err(CompileError::InvalidProgram("unclosed loop".into()));
        }
        if !self.spans.is_empty() && self.spans.len() != len {
            return Err(CompileError::InvalidProgram("span table length mismatch".into()));
        }
        Ok(())
    }

    /// Human-readable listing, one instruction per line.
    pub fn to_assembly(&self) -> String {
        let mut out = String::new();
        for (pc, ins) in self.instructions.iter().enumerate() {
            let _ = write!(out, "{:04}  ", pc);
            let _ = match ins {
                Instruction::Text(t) => write!(out, "TEXT {:?}", t),
                Instruction::Emit(e) => write!(out, "EMIT {}", e),
                Instruction::Set { name, value } => write!(out, "SET {} = {}", name, value),
                Instruction::JumpUnless { condition, target } => {
                    write!(out, "JUMP_UNLESS {} -> {:04}", condition, target)
                }
                Instruction::Jump { target } => write!(out, "JUMP -> {:04}", target),
                Instruction::LoopStart {
                    item,
                    collection,
                    hoisted,
                    exit,
                } => {
                    let _ = write!(out, "LOOP {} IN {} EXIT {:04}", item, collection, exit);
                    hoisted
                        .iter()
                        .try_for_each(|(slot, e)| write!(out, "\n      HOIST {} = {}", slot, e))
                }
                Instruction::LoopNext { body } => write!(out, "NEXT -> {:04}", body),
                Instruction::Include { name } => write!(out, "INCLUDE {:?}", name),
            };
            if let Some(span) = self.span_of(pc) {
                let _ = write!(out, "    ; {}:{}", span.line, span.column);
            }
            out.push('\n');
        }
        out
    }

    /// Rebuild a node tree from the instructions so a program that arrived
    /// without its AST can still be analyzed. Every instruction lands in
    /// exactly one node; out-of-range jumps are clamped.
    pub fn to_ast(&self) -> Result<Ast, CompileError> {
        let mut ast = Ast {
            root: RootNode {
                children: self.lift(0, self.len(), 0)?,
            },
            ..Ast::default()
        };
        let mut variables = BTreeSet::new();
        let mut partials = BTreeSet::new();
        walk_nodes(ast.nodes(), &mut |node, _| {
            if let Node::Partial { name, .. } = node {
                partials.insert(name.clone());
            }
            for e in node.expressions() {
                e.walk(&mut |e| {
                    if let Expr::Var(name) = e {
                        variables.insert(name.clone());
                    }
                });
            }
        });
        ast.variables = variables;
        ast.partials = partials;
        Ok(ast)
    }

    fn lift(&self, mut pc: usize, end: usize, depth: usize) -> Result<Vec<Node>, CompileError> {
        if depth > MAX_LIFTED_DEPTH {
            return Err(CompileError::InvalidProgram("control flow nested too deeply".into()));
        }
        let mut nodes = vec![];
        while pc < end {
            let span = self.span_of(pc).unwrap_or(Span { line: 1, column: 1 });
            let mut next = pc + 1;
            match &self.instructions[pc] {
                Instruction::Text(t) => nodes.push(Node::Text(t.clone())),
                Instruction::Emit(expr) => nodes.push(Node::Expression {
                    raw: expr.to_string(),
                    expr: expr.clone(),
                    span,
                }),
                Instruction::Set { name, value } => nodes.push(Node::Set {
                    name: name.clone(),
                    value: value.clone(),
                    span,
                }),
                Instruction::Include { name } => nodes.push(Node::Partial { name: name.clone(), span }),
                Instruction::JumpUnless { condition, target } => {
                    let split = (*target).clamp(next, end);
                    let (then_end, else_branch) = match &self.instructions[split - 1] {
                        Instruction::Jump { target: skip } if split - 1 > pc => {
                            let skip = (*skip).clamp(split, end);
                            next = skip;
                            (split - 1, Some(self.lift(split, skip, depth + 1)?))
                        }
                        _ => {
                            next = split;
                            (split, None)
                        }
                    };
                    nodes.push(Node::Conditional {
                        condition: condition.clone(),
                        then_branch: self.lift(pc + 1, then_end, depth + 1)?,
                        else_branch,
                        span,
                    });
                }
                Instruction::LoopStart {
                    item,
                    collection,
                    hoisted,
                    ..
                } => {
                    let close = self.loop_end(pc, end);
                    nodes.push(Node::Loop {
                        item: item.clone(),
                        collection: collection.clone(),
                        body: self.lift(pc + 1, close, depth + 1)?,
                        hoisted: hoisted.clone(),
                        span,
                    });
                    next = (close + 1).min(end);
                }
                Instruction::Jump { .. } | Instruction::LoopNext { .. } => {}
            }
            pc = next;
        }
        Ok(nodes)
    }

    /// Index of the `LoopNext` closing the loop opened at `start`, or `end`.
    fn loop_end(&self, start: usize, end: usize) -> usize {
        let mut open = 0usize;
        for pc in start + 1..end {
            match self.instructions[pc] {
                Instruction::LoopStart { .. } => open += 1,
                Instruction::LoopNext { .. } if open == 0 => return pc,
                Instruction::LoopNext { .. } => open -= 1,
                _ => {}
            }
        }
        end
    }
}

struct Lowering {
    instructions: Vec<Instruction>,
    spans: Vec<Option<Span>>,
}

impl Lowering {
    fn push(&mut self, ins: Instruction, span: Option<Span>) -> usize {
        self.instructions.push(ins);
        self.spans.push(span);
        self.instructions.len() - 1
    }

    fn patch(&mut self, at: usize, to: usize) {
        match &mut self.instructions[at] {
            Instruction::JumpUnless { target, .. } | Instruction::Jump { target } => *target = to,
            Instruction::LoopStart { exit, .. } => *exit = to,
            _ => {}
        }
    }

    fn nodes(&mut self, nodes: &[Node]) -> Result<(), CompileError> {
        nodes.iter().try_for_each(|n| self.node(n))
    }

    fn node(&mut self, node: &Node) -> Result<(), CompileError> {
        let span = node.span();
        match node {
            Node::Text(t) if t.is_empty() => {}
            Node::Text(t) => {
                self.push(Instruction::Text(t.clone()), span);
            }
            Node::Expression { expr, .. } => {
                self.push(Instruction::Emit(expr.clone()), span);
            }
            Node::Set { name, value, .. } => {
                self.push(
                    Instruction::Set {
                        name: name.clone(),
                        value: value.clone(),
                    },
                    span,
                );
            }
            Node::Conditional {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let test = self.push(
                    Instruction::JumpUnless {
                        condition: condition.clone(),
                        target: 0,
                    },
                    span,
                );
                self.nodes(then_branch)?;
                match else_branch {
                    Some(else_branch) if !else_branch.is_empty() => {
                        let skip = self.push(Instruction::Jump { target: 0 }, span);
                        self.patch(test, self.instructions.len());
                        self.nodes(else_branch)?;
                        self.patch(skip, self.instructions.len());
                    }
                    _ => self.patch(test, self.instructions.len()),
                }
            }
            Node::Loop {
                item,
                collection,
                body,
                hoisted,
                ..
            } => {
                if item.is_empty() {
                    return Err(CompileError::InvalidProgram("loop without an item name".into()));
                }
                let start = self.push(
                    Instruction::LoopStart {
                        item: item.clone(),
                        collection: collection.clone(),
                        hoisted: hoisted.clone(),
                        exit: 0,
                    },
                    span,
                );
                self.nodes(body)?;
                self.push(Instruction::LoopNext { body: start + 1 }, span);
                self.patch(start, self.instructions.len());
            }
            Node::Partial { name, .. } => {
                self.push(Instruction::Include { name: name.clone() }, span);
            }
            Node::Block { content, .. } => self.nodes(content)?,
            // A root-level `super` has nothing to expand to.
            Node::Super { .. } => {}
            Node::Extends { layout, .. } => {
                return Err(CompileError::UnresolvedExtends { layout: layout.clone() });
            }
        }
        Ok(())
    }
}

/// Lower an AST to a verified program.
pub fn lower(ast: &Ast, debug_info: bool) -> Result<Program, CompileError> {
    let mut lowering = Lowering {
        instructions: vec![],
        spans: vec![],
    };
    lowering.nodes(ast.nodes())?;
    let program = Program {
        instructions: lowering.instructions,
        spans: if debug_info { lowering.spans } else { vec![] },
    };
    program.verify()?;
    Ok(program)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOptions {
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    /// Keep per-instruction source positions.
    #[serde(default)]
    pub debug_info: bool,
}

fn default_true() -> bool { true }

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            enable_caching: true,
            debug_info: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Lowers ASTs, memoizing programs by AST content and options.
pub struct Compiler {
    options: CompilerOptions,
    cache: Mutex<HashMap<String, Arc<Program>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self {
            options,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    fn ast_key(&self, ast: &Ast) -> Result<String, CompileError> {
        let mut bytes = bincode::serialize(ast)?;
        bytes.extend_from_slice(canonical_json(&self.options)?.as_bytes());
        Ok(sha256_hex(&bytes))
    }

    pub fn compile(&self, ast: &Ast) -> Result<Arc<Program>, CompileError> {
        if !self.options.enable_caching {
            return Ok(Arc::new(lower(ast, self.options.debug_info)?));
        }
        let key = self.ast_key(ast)?;
        if let Some(program) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %&key[..12], "program cache hit");
            return Ok(program.clone());
        }
        let program = Arc::new(lower(ast, self.options.debug_info)?);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, program.clone());
        Ok(program)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerOptions::default())
    }
}

/// Wall-clock time spent in each stage, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileTimings {
    pub parse_us: u64,
    pub merge_us: u64,
    pub security_us: u64,
    pub optimize_us: u64,
    pub compile_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub security: Option<SecurityResult>,
    pub optimization: Option<OptimizationStats>,
    pub timings: CompileTimings,
}

/// An executable template. Immutable and safe to share across renders.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub name: String,
    pub cache_key: String,
    pub program: Arc<Program>,
    pub partials: PartialTable,
    /// Merged and optimized AST; absent when restored from bytecode.
    pub ast: Option<Arc<Ast>>,
    pub variables: BTreeSet<String>,
    /// Layouts and partials this template was built from.
    pub dependencies: BTreeSet<String>,
    pub limits: RuntimeLimits,
    pub render_options: RenderOptions,
    pub diagnostics: Diagnostics,
}

impl CompiledTemplate {
    fn env<'a>(&'a self, options: &'a RenderOptions, allow_async: bool) -> RenderEnv<'a> {
        RenderEnv {
            partials: &self.partials,
            limits: &self.limits,
            options,
            allow_async,
        }
    }

    /// Render synchronously. Async host functions are refused.
    pub fn render(&self, ctx: &mut TemplateContext) -> Result<RenderOutput, RenderError> {
        self.render_with(ctx, &self.render_options)
    }

    pub fn render_with(&self, ctx: &mut TemplateContext, options: &RenderOptions) -> Result<RenderOutput, RenderError> {
        let env = self.env(options, false);
        futures::executor::block_on(render_program(&self.program, ctx, &env))
    }

    pub async fn render_async(&self, ctx: &mut TemplateContext) -> Result<RenderOutput, RenderError> {
        self.render_async_with(ctx, &self.render_options).await
    }

    pub async fn render_async_with(
        &self,
        ctx: &mut TemplateContext,
        options: &RenderOptions,
    ) -> Result<RenderOutput, RenderError> {
        let env = self.env(options, true);
        render_program(&self.program, ctx, &env).await
    }

    pub fn render_to_string(&self, ctx: &mut TemplateContext) -> Result<String, RenderError> {
        Ok(self.render(ctx)?.text)
    }
}

/// A single host-supplied expression, parsed and ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    pub source: String,
    pub expr: Expr,
    pub variables: BTreeSet<String>,
    pub functions: BTreeSet<String>,
}

impl CompiledExpression {
    pub fn evaluate(&self, ctx: &mut TemplateContext) -> Result<Value, RenderError> {
        futures::executor::block_on(Evaluator::standalone(false).eval(&self.expr, ctx))
    }

    pub async fn evaluate_async(&self, ctx: &mut TemplateContext) -> Result<Value, RenderError> {
        Evaluator::standalone(true).eval(&self.expr, ctx).await
    }

    /// The expression as a one-node template, for analysis.
    pub fn as_ast(&self) -> Ast {
        Ast {
            root: RootNode {
                children: vec![Node::Expression {
                    raw: self.source.clone(),
                    expr: self.expr.clone(),
                    span: Span { line: 1, column: 1 },
                }],
            },
            variables: self.variables.clone(),
            partials: BTreeSet::new(),
        }
    }
}

pub fn compile_expression(text: &str) -> Result<CompiledExpression, CompileError> {
    let expr = parse_expression(text)?;
    let mut functions = BTreeSet::new();
    expr.walk(&mut |e| {
        if let Expr::Call { name, .. } = e {
            functions.insert(name.clone());
        }
    });
    Ok(CompiledExpression {
        source: text.trim().to_string(),
        variables: expr.variables(),
        functions,
        expr,
    })
}

/// A compiled condition; evaluates to the truthiness of its expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledConditional {
    pub expression: CompiledExpression,
}

impl CompiledConditional {
    pub fn test(&self, ctx: &mut TemplateContext) -> Result<bool, RenderError> {
        Ok(self.expression.evaluate(ctx)?.is_truthy())
    }

    pub async fn test_async(&self, ctx: &mut TemplateContext) -> Result<bool, RenderError> {
        Ok(self.expression.evaluate_async(ctx).await?.is_truthy())
    }
}

pub fn compile_conditional(text: &str) -> Result<CompiledConditional, CompileError> {
    Ok(CompiledConditional {
        expression: compile_expression(text)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn program(src: &str) -> Program {
        lower(&parse(src).unwrap(), false).unwrap()
    }

    fn render(src: &str, ctx: &mut TemplateContext) -> Result<RenderOutput, RenderError> {
        let template = CompiledTemplate {
            name: "test".into(),
            cache_key: String::new(),
            program: Arc::new(program(src)),
            partials: PartialTable::new(),
            ast: None,
            variables: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            limits: RuntimeLimits::default(),
            render_options: RenderOptions::default(),
            diagnostics: Diagnostics::default(),
        };
        template.render(ctx)
    }

    #[test]
    fn test_conditional_jumps() {
        let p = program("{% if a %}A{% else %}B{% end %}");
        assert_eq!(p.len(), 4);
        assert!(matches!(p.instructions[0], Instruction::JumpUnless { target: 3, .. }));
        assert!(matches!(p.instructions[2], Instruction::Jump { target: 4 }));
    }

    #[test]
    fn test_loop_layout() {
        let p = program("{% for x in xs %}{{ x }}{% end %}");
        assert!(matches!(p.instructions[0], Instruction::LoopStart { exit: 3, .. }));
        assert!(matches!(p.instructions[2], Instruction::LoopNext { body: 1 }));
        p.verify().unwrap();
    }

    #[test]
    fn test_unresolved_extends_rejected() {
        let ast = parse(r#"{% extends "base" %}"#).unwrap();
        assert!(matches!(lower(&ast, false), Err(CompileError::UnresolvedExtends { .. })));
    }

    #[test]
    fn test_verify_rejects_bad_target() {
        let p = Program {
            instructions: vec![Instruction::Jump { target: 9 }],
            spans: vec![],
        };
        assert!(p.verify().is_err());
    }

    #[test]
    fn test_lifted_ast_lowers_to_same_program() {
        let sources = [
            "a{{ b }}c",
            "{% if a %}A{% else %}B{% end %}",
            "{% if a %}{% if b %}x{% else %}{% end %}{% end %}tail",
            "{% if a %}1{% elif b %}2{% else %}3{% end %}",
            r#"{% for x in xs %}{% set y = x %}{% for z in y %}{{ z }}{% end %}{% include "p" %}{% end %}"#,
        ];
        for src in sources {
            let p = program(src);
            let lifted = p.to_ast().unwrap();
            assert_eq!(lower(&lifted, false).unwrap(), p, "{}", src);
        }
        let lifted = program(r#"{% for x in xs %}{% include "p" %}{% end %}"#).to_ast().unwrap();
        assert!(lifted.partials.contains("p"));
        assert!(lifted.variables.contains("xs"));
    }

    #[test]
    fn test_lift_clamps_malformed_jumps() {
        let p = Program {
            instructions: vec![
                Instruction::JumpUnless {
                    condition: Expr::Var("a".into()),
                    target: 0,
                },
                Instruction::Emit(Expr::Var("b".into())),
                Instruction::Jump { target: 0 },
            ],
            spans: vec![],
        };
        let ast = p.to_ast().unwrap();
        let mut exprs = 0;
        walk_nodes(ast.nodes(), &mut |n, _| exprs += n.expressions().len());
        assert_eq!(exprs, 2);
    }

    #[test]
    fn test_render_loop_with_loop_vars() {
        let mut ctx = TemplateContext::new();
        ctx.set("xs", vec!["a", "b", "c"]);
        let out = render("{% for x in xs %}{{ loop.index }}{{ x }}{% if not loop.last %},{% end %}{% end %}", &mut ctx).unwrap();
        assert_eq!(out.text, "1a,2b,3c");
        assert_eq!(out.iterations, 3);
        assert!(ctx.get("x").is_none());
    }

    #[test]
    fn test_strict_undefined_variable() {
        let err = render("{{ missing }}", &mut TemplateContext::new()).unwrap_err();
        assert_eq!(err, RenderError::UndefinedVariable { name: "missing".into() });
    }

    #[test]
    fn test_compiler_cache_hits() {
        let compiler = Compiler::default();
        let ast = parse("x{{ y }}").unwrap();
        let a = compiler.compile(&ast).unwrap();
        let b = compiler.compile(&ast).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = compiler.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_debug_info_spans() {
        let p = lower(&parse("a\n{{ b }}").unwrap(), true).unwrap();
        assert_eq!(p.span_of(1), Some(Span { line: 2, column: 1 }));
        assert!(p.to_assembly().contains("EMIT b"));
    }

    #[test]
    fn test_compile_expression_and_conditional() {
        let mut ctx = TemplateContext::with_builtins();
        ctx.set("user", Value::map([("name", Value::from("ada"))]));
        let e = compile_expression("user.name | upper").unwrap();
        assert!(e.functions.contains("upper"));
        assert_eq!(e.evaluate(&mut ctx).unwrap(), Value::from("ADA"));
        let c = compile_conditional("len(user.name) >= 3").unwrap();
        assert!(c.test(&mut ctx).unwrap());
    }
}
