//! Renderer - executes compiled programs against a context
//!
//! One async implementation backs both entry points. The sync entry point
//! refuses async host functions, so its future never suspends and can be
//! driven with `block_on`. Evaluation is strictly sequential, so output
//! order always matches document order.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::compiler::{Instruction, PartialTable, Program};
use crate::context::{Function, TemplateContext};
use crate::security::{IterationLimitAction, RuntimeLimits};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RenderError {
    #[error("undefined variable `{name}`")]
    UndefinedVariable { name: String },

    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    #[error("function `{name}` failed: {message}")]
    Function { name: String, message: String },

    #[error("async function `{name}` cannot be called from a synchronous render")]
    AsyncFunction { name: String },

    #[error("cannot iterate over {type_name}")]
    NotIterable { type_name: String },

    #[error("loop iteration limit of {limit} exceeded")]
    IterationLimitExceeded { limit: u64 },

    #[error("output limit of {limit} bytes exceeded")]
    OutputLimitExceeded { limit: usize },

    #[error("partial `{name}` not found")]
    PartialNotFound { name: String },

    #[error("include depth limit of {limit} exceeded at partial `{name}`")]
    IncludeDepthExceeded { name: String, limit: usize },

    #[error("type error: {0}")]
    Type(String),
}

impl RenderError {
    /// Resource-limit errors end the render in every mode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::IterationLimitExceeded { .. }
                | RenderError::OutputLimitExceeded { .. }
                | RenderError::IncludeDepthExceeded { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Any error fails the render with no output.
    #[default]
    Strict,
    /// Recoverable errors become inline markers and are collected.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    #[serde(default)]
    pub mode: RenderMode,
    /// `{message}` is replaced with the error text.
    #[serde(default = "default_error_marker")]
    pub error_marker: String,
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
}

fn default_error_marker() -> String { "[[error: {message}]]".to_string() }
fn default_max_include_depth() -> usize { 16 }

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            mode: RenderMode::Strict,
            error_marker: default_error_marker(),
            max_include_depth: default_max_include_depth(),
        }
    }
}

impl RenderOptions {
    pub fn lenient() -> Self {
        Self {
            mode: RenderMode::Lenient,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    pub text: String,
    /// Errors recovered from in lenient mode, in document order.
    pub errors: Vec<RenderError>,
    pub iterations: u64,
}

impl RenderOutput {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

pub(crate) struct RenderEnv<'a> {
    pub partials: &'a PartialTable,
    pub limits: &'a RuntimeLimits,
    pub options: &'a RenderOptions,
    pub allow_async: bool,
}

#[derive(Default)]
struct RenderState {
    output: String,
    errors: Vec<RenderError>,
    iterations: u64,
    hoisted: Vec<HashMap<String, Value>>,
    include_depth: usize,
}

impl RenderState {
    fn write(&mut self, text: &str, env: &RenderEnv<'_>) -> Result<(), RenderError> {
        self.output.push_str(text);
        if self.output.len() > env.limits.max_output_size {
            return Err(RenderError::OutputLimitExceeded {
                limit: env.limits.max_output_size,
            });
        }
        Ok(())
    }

    fn mark(&mut self, err: RenderError, env: &RenderEnv<'_>) -> Result<(), RenderError> {
        let marker = env.options.error_marker.replace("{message}", &err.to_string());
        warn!(error = %err, "recovered render error");
        self.errors.push(err);
        self.write(&marker, env)
    }

    /// Lenient mode records the error and carries on; strict mode fails.
    fn recover(&mut self, err: RenderError, env: &RenderEnv<'_>) -> Result<(), RenderError> {
        if err.is_fatal() || env.options.mode == RenderMode::Strict {
            return Err(err);
        }
        self.mark(err, env)
    }

    /// Count one loop iteration. `Ok(false)` means the loop was truncated.
    fn begin_iteration(&mut self, env: &RenderEnv<'_>) -> Result<bool, RenderError> {
        let limit = env.limits.max_loop_iterations;
        if self.iterations >= limit {
            let err = RenderError::IterationLimitExceeded { limit };
            let truncate = env.limits.iteration_limit_action == IterationLimitAction::TruncateLoop
                && env.options.mode == RenderMode::Lenient;
            if truncate {
                self.mark(err, env)?;
                return Ok(false);
            }
            return Err(err);
        }
        self.iterations += 1;
        Ok(true)
    }
}

struct LoopFrame {
    item: String,
    items: Vec<Value>,
    index: usize,
    scope: usize,
}

/// Run `program` to completion. Scopes opened during the run are closed
/// again even when the render fails.
pub(crate) async fn render_program(
    program: &Program,
    ctx: &mut TemplateContext,
    env: &RenderEnv<'_>,
) -> Result<RenderOutput, RenderError> {
    let mut state = RenderState::default();
    let base = ctx.depth();
    let result = run_program(program, ctx, env, &mut state).await;
    ctx.exit_scope(base);
    result?;
    debug!(bytes = state.output.len(), iterations = state.iterations, "render finished");
    Ok(RenderOutput {
        text: state.output,
        errors: state.errors,
        iterations: state.iterations,
    })
}

fn run_program<'a>(
    program: &'a Program,
    ctx: &'a mut TemplateContext,
    env: &'a RenderEnv<'a>,
    state: &'a mut RenderState,
) -> BoxFuture<'a, Result<(), RenderError>> {
    async move {
        let ops = &program.instructions;
        let mut loops: Vec<LoopFrame> = Vec::new();
        let mut pc = 0;

        while pc < ops.len() {
            match &ops[pc] {
                Instruction::Text(text) => {
                    state.write(text, env)?;
                    pc += 1;
                }
                Instruction::Emit(expr) => {
                    let value = Evaluator::new(env, &state.hoisted).eval(expr, ctx).await;
                    match value {
                        Ok(v) => state.write(&v.to_string(), env)?,
                        Err(e) => state.recover(e, env)?,
                    }
                    pc += 1;
                }
                Instruction::Set { name, value } => {
                    match Evaluator::new(env, &state.hoisted).eval(value, ctx).await {
                        Ok(v) => ctx.set(name.clone(), v),
                        Err(e) => state.recover(e, env)?,
                    }
                    pc += 1;
                }
                Instruction::JumpUnless { condition, target } => {
                    let truthy = match Evaluator::new(env, &state.hoisted).eval(condition, ctx).await {
                        Ok(v) => v.is_truthy(),
                        Err(e) => {
                            state.recover(e, env)?;
                            false
                        }
                    };
                    pc = if truthy { pc + 1 } else { *target };
                }
                Instruction::Jump { target } => pc = *target,
                Instruction::LoopStart {
                    item,
                    collection,
                    hoisted,
                    exit,
                } => {
                    let items = Evaluator::new(env, &state.hoisted)
                        .eval(collection, ctx)
                        .await
                        .and_then(iterate);
                    let items = match items {
                        Ok(items) => items,
                        Err(e) => {
                            state.recover(e, env)?;
                            pc = *exit;
                            continue;
                        }
                    };
                    if items.is_empty() || !state.begin_iteration(env)? {
                        pc = *exit;
                        continue;
                    }
                    let scope = ctx.enter_scope();
                    bind_iteration(ctx, item, &items, 0);

                    let mut slots = HashMap::new();
                    for (slot, expr) in hoisted {
                        // On failure the use site evaluates the original expression.
                        if let Ok(v) = Evaluator::new(env, &state.hoisted).eval(expr, ctx).await {
                            slots.insert(slot.clone(), v);
                        }
                    }
                    state.hoisted.push(slots);
                    loops.push(LoopFrame {
                        item: item.clone(),
                        items,
                        index: 0,
                        scope,
                    });
                    pc += 1;
                }
                Instruction::LoopNext { body } => {
                    let frame = match loops.last_mut() {
                        Some(frame) => frame,
                        None => return Err(RenderError::Type("loop end without loop start".into())),
                    };
                    frame.index += 1;
                    let more = frame.index < frame.items.len() && state.begin_iteration(env)?;
                    ctx.exit_scope(frame.scope);
                    if more {
                        ctx.enter_scope();
                        bind_iteration(ctx, &frame.item, &frame.items, frame.index);
                        pc = *body;
                    } else {
                        loops.pop();
                        state.hoisted.pop();
                        pc += 1;
                    }
                }
                Instruction::Include { name } => {
                    include(name, ctx, env, state).await?;
                    pc += 1;
                }
            }
        }
        Ok(())
    }
    .boxed()
}

async fn include(
    name: &str,
    ctx: &mut TemplateContext,
    env: &RenderEnv<'_>,
    state: &mut RenderState,
) -> Result<(), RenderError> {
    let program = match env.partials.get(name) {
        Some(p) => p.clone(),
        None => {
            return state.recover(
                RenderError::PartialNotFound {
                    name: name.to_string(),
                },
                env,
            )
        }
    };
    if state.include_depth >= env.options.max_include_depth {
        return Err(RenderError::IncludeDepthExceeded {
            name: name.to_string(),
            limit: env.options.max_include_depth,
        });
    }

    // Partials see the caller's variables but cannot leak writes back.
    let mut child = ctx.clone();
    let saved = std::mem::take(&mut state.hoisted);
    state.include_depth += 1;
    let result = run_program(&program, &mut child, env, state).await;
    state.include_depth -= 1;
    state.hoisted = saved;
    result
}

fn bind_iteration(ctx: &mut TemplateContext, item: &str, items: &[Value], index: usize) {
    ctx.set(item, items[index].clone());
    ctx.set(
        "loop",
        Value::map([
            ("index", Value::Int(index as i64 + 1)),
            ("index0", Value::Int(index as i64)),
            ("first", Value::Bool(index == 0)),
            ("last", Value::Bool(index + 1 == items.len())),
            ("length", Value::Int(items.len() as i64)),
        ]),
    );
}

fn iterate(value: Value) -> Result<Vec<Value>, RenderError> {
    match value {
        Value::List(items) => Ok(items),
        Value::Map(m) => Ok(m
            .into_iter()
            .map(|(k, v)| Value::map([("key", Value::String(k)), ("value", v)]))
            .collect()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(RenderError::NotIterable {
            type_name: other.type_name().to_string(),
        }),
    }
}

/// Expression evaluation against a live context.
pub(crate) struct Evaluator<'a> {
    allow_async: bool,
    hoisted: &'a [HashMap<String, Value>],
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(env: &RenderEnv<'_>, hoisted: &'a [HashMap<String, Value>]) -> Self {
        Self {
            allow_async: env.allow_async,
            hoisted,
        }
    }

    pub(crate) fn standalone(allow_async: bool) -> Self {
        Self {
            allow_async,
            hoisted: &[],
        }
    }

    pub(crate) fn eval<'b>(
        &'b self,
        expr: &'b Expr,
        ctx: &'b mut TemplateContext,
    ) -> BoxFuture<'b, Result<Value, RenderError>> {
        async move {
            match expr {
                Expr::Literal(v) => Ok(v.clone()),
                Expr::Var(name) => ctx
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RenderError::UndefinedVariable { name: name.clone() }),
                Expr::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item, ctx).await?);
                    }
                    Ok(Value::List(out))
                }
                Expr::Attr(target, member) => {
                    let target = self.eval(target, ctx).await?;
                    Ok(ctx.resolver().resolve(&target, member).unwrap_or(Value::Null))
                }
                Expr::Index(target, index) => {
                    let target = self.eval(target, ctx).await?;
                    let index = self.eval(index, ctx).await?;
                    index_value(&target, &index)
                }
                Expr::Call { name, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg, ctx).await?);
                    }
                    match ctx.function(name) {
                        Some(Function::Sync(f)) => f(ctx, &values).map_err(|message| RenderError::Function {
                            name: name.clone(),
                            message,
                        }),
                        Some(Function::Async(f)) if self.allow_async => {
                            f(values).await.map_err(|message| RenderError::Function {
                                name: name.clone(),
                                message,
                            })
                        }
                        Some(Function::Async(_)) => Err(RenderError::AsyncFunction { name: name.clone() }),
                        None => Err(RenderError::UnknownFunction { name: name.clone() }),
                    }
                }
                Expr::Unary(op, operand) => {
                    let v = self.eval(operand, ctx).await?;
                    apply_unary(*op, v)
                }
                Expr::Binary(lhs, BinaryOp::And, rhs) => {
                    if !self.eval(lhs, ctx).await?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.eval(rhs, ctx).await?.is_truthy()))
                }
                Expr::Binary(lhs, BinaryOp::Or, rhs) => {
                    if self.eval(lhs, ctx).await?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.eval(rhs, ctx).await?.is_truthy()))
                }
                Expr::Binary(lhs, op, rhs) => {
                    let l = self.eval(lhs, ctx).await?;
                    let r = self.eval(rhs, ctx).await?;
                    apply_binary(*op, l, r)
                }
                Expr::Hoisted { slot, expr } => {
                    if let Some(v) = self.hoisted.iter().rev().find_map(|slots| slots.get(slot)) {
                        return Ok(v.clone());
                    }
                    self.eval(expr, ctx).await
                }
            }
        }
        .boxed()
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, RenderError> {
    match (target, index) {
        (Value::Map(m), Value::String(key)) => Ok(m.get(key).cloned().unwrap_or(Value::Null)),
        (Value::List(items), Value::Int(i)) => {
            let idx = if *i < 0 { items.len() as i64 + i } else { *i };
            Ok(usize::try_from(idx)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Null))
        }
        (Value::String(s), Value::Int(i)) => Ok(usize::try_from(*i)
            .ok()
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (Value::Null, _) => Ok(Value::Null),
        (t, i) => Err(RenderError::Type(format!(
            "cannot index {} with {}",
            t.type_name(),
            i.type_name()
        ))),
    }
}

pub(crate) fn apply_unary(op: UnaryOp, v: Value) -> Result<Value, RenderError> {
    match (op, v) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| RenderError::Type("integer overflow".into())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(RenderError::Type(format!("cannot negate {}", other.type_name()))),
    }
}

fn compare(l: &Value, r: &Value) -> Result<Ordering, RenderError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| RenderError::Type("cannot compare NaN".into())),
            _ => Err(RenderError::Type(format!(
                "cannot compare {} with {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn arithmetic(
    op: BinaryOp,
    l: Value,
    r: Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, RenderError> {
    match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| RenderError::Type("integer overflow".into())),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
            _ => Err(RenderError::Type(format!(
                "unsupported operand types for {}: {} and {}",
                op.symbol(),
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

/// Pure binary operators; shared by the renderer and constant folding.
pub(crate) fn apply_binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, RenderError> {
    match op {
        BinaryOp::And => Ok(Value::Bool(l.is_truthy() && r.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(l.is_truthy() || r.is_truthy())),
        BinaryOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
        BinaryOp::NotEq => Ok(Value::Bool(!l.loose_eq(&r))),
        BinaryOp::Lt => compare(&l, &r).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => compare(&l, &r).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => compare(&l, &r).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => compare(&l, &r).map(|o| Value::Bool(o != Ordering::Less)),
        BinaryOp::In => match (&r, &l) {
            (Value::List(items), needle) => Ok(Value::Bool(items.iter().any(|i| i.loose_eq(needle)))),
            (Value::String(hay), Value::String(needle)) => Ok(Value::Bool(hay.contains(needle.as_str()))),
            (Value::Map(m), Value::String(key)) => Ok(Value::Bool(m.contains_key(key))),
            _ => Err(RenderError::Type(format!(
                "cannot test membership of {} in {}",
                l.type_name(),
                r.type_name()
            ))),
        },
        BinaryOp::Add => match (l, r) {
            (Value::String(a), b) => Ok(Value::String(a + &b.to_string())),
            (a, Value::String(b)) => Ok(Value::String(a.to_string() + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => arithmetic(op, a, b, i64::checked_add, |x, y| x + y),
        },
        BinaryOp::Sub => arithmetic(op, l, r, i64::checked_sub, |x, y| x - y),
        BinaryOp::Mul => arithmetic(op, l, r, i64::checked_mul, |x, y| x * y),
        BinaryOp::Div | BinaryOp::Rem => {
            if r.as_f64() == Some(0.0) {
                return Err(RenderError::Type("division by zero".into()));
            }
            match (op, &l, &r) {
                (BinaryOp::Div, Value::Int(a), Value::Int(b)) if a.checked_rem(*b).is_some_and(|m| m != 0) => {
                    Ok(Value::Float(*a as f64 / *b as f64))
                }
                (BinaryOp::Div, ..) => arithmetic(op, l, r, i64::checked_div, |x, y| x / y),
                _ => arithmetic(op, l, r, i64::checked_rem, |x, y| x % y),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        assert_eq!(apply_binary(BinaryOp::Add, Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(apply_binary(BinaryOp::Div, Value::Int(6), Value::Int(3)).unwrap(), Value::Int(2));
        assert_eq!(apply_binary(BinaryOp::Div, Value::Int(7), Value::Int(2)).unwrap(), Value::Float(3.5));
        assert!(apply_binary(BinaryOp::Rem, Value::Int(7), Value::Int(0)).is_err());
        assert!(apply_binary(BinaryOp::Add, Value::Int(i64::MAX), Value::Int(1)).is_err());
    }

    #[test]
    fn test_min_int_division_overflows_without_panic() {
        for op in [BinaryOp::Div, BinaryOp::Rem] {
            match apply_binary(op, Value::Int(i64::MIN), Value::Int(-1)) {
                Err(RenderError::Type(msg)) => assert_eq!(msg, "integer overflow"),
                other => panic!("expected overflow, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            apply_binary(BinaryOp::Add, Value::from("n="), Value::Int(3)).unwrap(),
            Value::from("n=3")
        );
    }

    #[test]
    fn test_comparison_and_membership() {
        assert_eq!(apply_binary(BinaryOp::Ge, Value::Int(16), Value::Int(18)).unwrap(), Value::Bool(false));
        assert_eq!(
            apply_binary(BinaryOp::In, Value::from("b"), Value::from(vec!["a", "b"])).unwrap(),
            Value::Bool(true)
        );
        assert!(apply_binary(BinaryOp::Lt, Value::from("a"), Value::Int(1)).is_err());
    }

    #[test]
    fn test_index_value() {
        let list = Value::from(vec![1, 2, 3]);
        assert_eq!(index_value(&list, &Value::Int(-1)).unwrap(), Value::Int(3));
        assert_eq!(index_value(&list, &Value::Int(9)).unwrap(), Value::Null);
        assert!(index_value(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn test_iterate_map_yields_entries() {
        let m = Value::map([("a", Value::Int(1))]);
        let items = iterate(m).unwrap();
        assert_eq!(items, vec![Value::map([("key", Value::from("a")), ("value", Value::Int(1))])]);
        assert!(iterate(Value::Int(3)).is_err());
    }
}
