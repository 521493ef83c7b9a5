//! Template Context - variables, functions and scopes for one render
//!
//! Variables live in a stack of layers. Reads search innermost-first,
//! writes always land in the innermost layer. Layers are `Arc`-shared so a
//! fork only copies pointers; a layer is copied the first time either side
//! writes to it.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::value::Value;

/// Synchronous host function. May read and mutate the calling context.
pub type HostFunction =
    Arc<dyn Fn(&mut TemplateContext, &[Value]) -> Result<Value, String> + Send + Sync>;

/// Asynchronous host function, only callable from an async render.
pub type AsyncHostFunction =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Clone)]
pub enum Function {
    Sync(HostFunction),
    Async(AsyncHostFunction),
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Sync(_) => f.write_str("Function::Sync"),
            Function::Async(_) => f.write_str("Function::Async"),
        }
    }
}

/// Dotted-path member access on host values (`user.name`).
pub trait PropertyResolver: Send + Sync {
    fn resolve(&self, target: &Value, member: &str) -> Option<Value>;
}

/// Map keys, `length`, and numeric list indices.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl PropertyResolver for DefaultResolver {
    fn resolve(&self, target: &Value, member: &str) -> Option<Value> {
        match target {
            Value::Map(m) => m.get(member).cloned().or_else(|| {
                (member == "length").then(|| Value::Int(m.len() as i64))
            }),
            Value::List(items) => match member {
                "length" => Some(Value::Int(items.len() as i64)),
                "first" => items.first().cloned(),
                "last" => items.last().cloned(),
                _ => member.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            },
            Value::String(s) if member == "length" => Some(Value::Int(s.chars().count() as i64)),
            _ => None,
        }
    }
}

type Layer = Arc<HashMap<String, Value>>;

pub struct TemplateContext {
    layers: Vec<Layer>,
    functions: Arc<HashMap<String, Function>>,
    resolver: Arc<dyn PropertyResolver>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self {
            layers: vec![Layer::default()],
            functions: Arc::new(HashMap::new()),
            resolver: Arc::new(DefaultResolver),
        }
    }

    /// New context with the standard functions registered.
    pub fn with_builtins() -> Self {
        let mut ctx = Self::new();
        let functions = Arc::make_mut(&mut ctx.functions);
        for (name, f) in builtins::all() {
            functions.insert(name.to_string(), Function::Sync(f));
        }
        ctx
    }

    /// Root variables from the entries of a JSON object.
    pub fn from_json(vars: serde_json::Value) -> Self {
        let mut ctx = Self::with_builtins();
        if let Value::Map(m) = Value::from(vars) {
            for (k, v) in m {
                ctx.set(k, v);
            }
        }
        ctx
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PropertyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn resolver(&self) -> &dyn PropertyResolver {
        self.resolver.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.layers.iter().rev().find_map(|layer| layer.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Write to the innermost scope; outer bindings are shadowed, never changed.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        if let Some(top) = self.layers.last_mut() {
            Arc::make_mut(top).insert(name.into(), value.into());
        }
    }

    /// Number of variable layers, root included.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Open a scope; dropping the guard discards everything set inside it.
    pub fn push_scope(&mut self) -> ScopeGuard<'_> {
        let depth = self.enter_scope();
        ScopeGuard { ctx: self, depth }
    }

    pub(crate) fn enter_scope(&mut self) -> usize {
        let depth = self.layers.len();
        self.layers.push(Layer::default());
        depth
    }

    pub(crate) fn exit_scope(&mut self, depth: usize) {
        self.layers.truncate(depth.max(1));
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut TemplateContext, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.functions).insert(name.into(), Function::Sync(Arc::new(f)));
    }

    pub fn register_async_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.functions).insert(name.into(), Function::Async(Arc::new(f)));
    }

    pub fn function(&self, name: &str) -> Option<Function> {
        self.functions.get(name).cloned()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Independent copy with its own top layer. Later writes on either side
/// are invisible to the other.
impl Clone for TemplateContext {
    fn clone(&self) -> Self {
        let mut layers = self.layers.clone();
        layers.push(Layer::default());
        Self {
            layers,
            functions: Arc::clone(&self.functions),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl fmt::Debug for TemplateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateContext")
            .field("layers", &self.layers)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handle returned by [`TemplateContext::push_scope`].
pub struct ScopeGuard<'a> {
    ctx: &'a mut TemplateContext,
    depth: usize,
}

impl Deref for ScopeGuard<'_> {
    type Target = TemplateContext;

    fn deref(&self) -> &TemplateContext {
        self.ctx
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut TemplateContext {
        self.ctx
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.exit_scope(self.depth);
    }
}

mod builtins {
    use super::{HostFunction, TemplateContext};
    use crate::value::Value;
    use std::sync::Arc;

    fn host<F>(f: F) -> HostFunction
    where
        F: Fn(&mut TemplateContext, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    const MAX_RANGE: i64 = 10_000_000;

    fn string_arg(args: &[Value], i: usize, fname: &str) -> Result<String, String> {
        match args.get(i) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(format!("{}: missing argument {}", fname, i + 1)),
        }
    }

    fn int_arg(args: &[Value], i: usize, fname: &str) -> Result<i64, String> {
        match args.get(i) {
            Some(Value::Int(n)) => Ok(*n),
            Some(other) => Err(format!("{}: expected int, got {}", fname, other.type_name())),
            None => Err(format!("{}: missing argument {}", fname, i + 1)),
        }
    }

    pub fn all() -> Vec<(&'static str, HostFunction)> {
        vec![
            (
                "range",
                host(|_, args| {
                    let (start, end) = match args.len() {
                        1 => (0, int_arg(args, 0, "range")?),
                        2 => (int_arg(args, 0, "range")?, int_arg(args, 1, "range")?),
                        n => return Err(format!("range: expected 1 or 2 arguments, got {}", n)),
                    };
                    if end.saturating_sub(start) > MAX_RANGE {
                        return Err(format!("range: more than {} items", MAX_RANGE));
                    }
                    Ok(Value::List((start..end).map(Value::Int).collect()))
                }),
            ),
            (
                "len",
                host(|_, args| {
                    args.first()
                        .and_then(Value::len)
                        .map(|n| Value::Int(n as i64))
                        .ok_or_else(|| "len: expected string, list or map".to_string())
                }),
            ),
            (
                "upper",
                host(|_, args| Ok(Value::String(string_arg(args, 0, "upper")?.to_uppercase()))),
            ),
            (
                "lower",
                host(|_, args| Ok(Value::String(string_arg(args, 0, "lower")?.to_lowercase()))),
            ),
            (
                "trim",
                host(|_, args| Ok(Value::String(string_arg(args, 0, "trim")?.trim().to_string()))),
            ),
            (
                "join",
                host(|_, args| {
                    let sep = if args.len() > 1 { string_arg(args, 1, "join")? } else { String::new() };
                    match args.first() {
                        Some(Value::List(items)) => Ok(Value::String(
                            items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(&sep),
                        )),
                        _ => Err("join: expected a list".to_string()),
                    }
                }),
            ),
            (
                "default",
                host(|_, args| match args {
                    [value, fallback] => Ok(if value.is_truthy() { value.clone() } else { fallback.clone() }),
                    _ => Err("default: expected 2 arguments".to_string()),
                }),
            ),
        ]
    }
}
