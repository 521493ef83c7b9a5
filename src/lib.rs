//! Templar Core - Template Compiler and Sandboxed Renderer
//!
//! # Pipeline
//! 1. Parse source into an AST
//! 2. Merge the `extends` chain into one standalone AST
//! 3. Security analysis gates admission
//! 4. Optimize (inline, fold, eliminate, hoist, merge)
//! 5. Lower to bytecode and cache
//! 6. Render against a scoped context, strict or lenient

pub mod value;
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod context;
pub mod hashing;
pub mod security;
pub mod optimizer;
pub mod render;
pub mod compiler;
pub mod inheritance;
pub mod partials;
pub mod precompile;
pub mod config;
pub mod engine;

pub use value::Value;
pub use ast::{Ast, Expr, Node, Span, TemplateSource};
pub use parser::{parse, parse_expression, SyntaxError};
pub use context::{PropertyResolver, ScopeGuard, TemplateContext};
pub use hashing::{canonical_json, compute_cache_key, content_hash};
pub use security::{
    check_dynamic_expression, check_security, IterationLimitAction, RiskLevel, SecurityAnalyzer, SecurityPolicy,
    SecurityResult, SecurityRule, SecurityViolation, Threat,
};
pub use optimizer::{analyze_performance, OptimizationOptions, OptimizationResult, Optimizer, PerformanceReport};
pub use render::{RenderError, RenderMode, RenderOptions, RenderOutput};
pub use compiler::{
    compile_conditional, compile_expression, CompileError, CompiledConditional, CompiledExpression, CompiledTemplate,
    Compiler, CompilerOptions,
};
pub use inheritance::{InheritanceManager, LayoutProvider, MemoryLayoutProvider, FileSystemLayoutProvider, MergeError};
pub use partials::{
    ChangeKind, FileSystemPartialProvider, MemoryPartialProvider, PartialChange, PartialError, PartialProvider,
    PartialRegistry,
};
pub use precompile::{ArtifactError, ArtifactFormat, BatchResult, CancellationFlag, PrecompileOptions, PrecompiledArtifact};
pub use config::EngineConfig;
pub use engine::{EngineError, TemplateEngine};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
