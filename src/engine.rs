//! Template Engine - Single Entry Point
//!
//! CRITICAL: every compile path runs the security analyzer on the merged
//! template and on each partial it pulls in. No bypass.
//!
//! The engine owns both process-wide caches: compiled templates keyed by
//! (normalized source, options), and resolved partials by name. Two engines
//! with different policies never share either.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::ast::Ast;
use crate::compiler::{
    compile_expression, CacheStats, CompileError, CompileTimings, CompiledTemplate, Compiler, Diagnostics, PartialTable,
};
use crate::config::{ConfigError, EngineConfig};
use crate::context::TemplateContext;
use crate::hashing::{compute_cache_key, normalize_source};
use crate::inheritance::{FileSystemLayoutProvider, InheritanceInfo, InheritanceManager, LayoutProvider, MergeError};
use crate::optimizer::{analyze_performance, OptimizationResult, Optimizer, PerformanceReport};
use crate::parser::{parse, SyntaxError};
use crate::partials::{
    ChangeKind, FileSystemPartialProvider, PartialChange, PartialEntry, PartialError, PartialInfo, PartialProvider, PartialRegistry,
};
use crate::precompile::{ArtifactError, BatchResult, CancellationFlag, PrecompileOptions, PrecompiledArtifact, Precompiler};
use crate::render::{RenderError, RenderOutput};
use crate::security::{SecurityAnalyzer, SecurityResult, SecurityViolation, Threat};
use crate::value::Value;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::AtomicU32;

#[cfg(feature = "test-hooks")]
static SECURITY_CHECK_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_security_check_count() -> u32 {
    SECURITY_CHECK_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_security_check_count() {
    SECURITY_CHECK_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Security(#[from] SecurityViolation),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Partial(#[from] PartialError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("cache key error: {0}")]
    CacheKey(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type TemplateCell = Arc<OnceCell<Arc<CompiledTemplate>>>;

/// Parse, secure, merge, optimize, compile and render templates.
pub struct TemplateEngine {
    config: EngineConfig,
    analyzer: SecurityAnalyzer,
    compiler: Compiler,
    inheritance: InheritanceManager,
    partials: PartialRegistry,
    templates: Mutex<HashMap<String, TemplateCell>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TemplateEngine {
    /// Panics if the optimizer options are contradictory.
    pub fn new(config: EngineConfig) -> Self {
        assert!(
            !config.optimizer.inlining || config.optimizer.inline_threshold > 0,
            "inline_threshold must be non-zero when inlining is enabled"
        );
        let partials = PartialRegistry::new();
        for (i, dir) in config.partial_dirs.iter().enumerate() {
            let provider = FileSystemPartialProvider::new(dir, -(i as i32)).with_extension(&config.template_extension);
            partials.add_provider(Arc::new(provider));
        }
        let inheritance = InheritanceManager::new();
        for dir in &config.layout_dirs {
            let provider = FileSystemLayoutProvider::new(dir).with_extension(&config.template_extension);
            inheritance.add_provider(Arc::new(provider));
        }
        Self {
            compiler: Compiler::new(config.compiler.clone()),
            config,
            analyzer: SecurityAnalyzer::new(),
            inheritance,
            partials,
            templates: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config_file(path: &Path) -> Result<Self, EngineError> {
        Ok(Self::new(EngineConfig::load(path)?))
    }

    /// Replace the default security rule set.
    pub fn with_analyzer(mut self, analyzer: SecurityAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn parse(&self, source: &str) -> Result<Ast, SyntaxError> {
        parse(&normalize_source(source))
    }

    fn analyze(&self, ast: &Ast, source_size: usize) -> SecurityResult {
        #[cfg(feature = "test-hooks")]
        SECURITY_CHECK_COUNT.fetch_add(1, Ordering::SeqCst);

        self.analyzer.analyze(ast, source_size, &self.config.security)
    }

    /// Security report for an untrusted source. Never fails on threats.
    pub fn check_security(&self, source: &str) -> Result<SecurityResult, SyntaxError> {
        let ast = self.parse(source)?;
        Ok(self.analyze(&ast, source.len()))
    }

    /// Admission gate: parses and rejects templates over the policy threshold.
    pub fn validate(&self, source: &str) -> Result<SecurityResult, EngineError> {
        let result = self.check_security(source)?;
        if !result.is_secure {
            return Err(SecurityViolation { result }.into());
        }
        Ok(result)
    }

    /// Optimize with the configured passes. No partials are inlined here;
    /// `compile` does that with the partials it resolves.
    pub fn optimize(&self, ast: &Ast) -> OptimizationResult {
        Optimizer::new(self.config.optimizer.clone()).optimize(ast)
    }

    pub fn analyze_performance(&self, source: &str) -> Result<PerformanceReport, SyntaxError> {
        Ok(analyze_performance(&self.parse(source)?))
    }

    pub fn register_layout(&self, name: impl Into<String>, source: &str) -> Result<(), SyntaxError> {
        let name = name.into();
        self.inheritance.register_layout(name.clone(), source)?;
        self.drop_dependents(&BTreeSet::from([name]));
        Ok(())
    }

    pub fn add_layout_provider(&self, provider: Arc<dyn LayoutProvider>) {
        self.inheritance.add_provider(provider);
    }

    /// Drop a cached layout and every template merged from it.
    pub fn invalidate_layout(&self, name: &str) -> Vec<String> {
        self.inheritance.invalidate(name);
        self.drop_dependents(&BTreeSet::from([name.to_string()]))
    }

    pub fn register_partial(&self, name: impl Into<String>, source: &str) -> Result<(), SyntaxError> {
        let name = name.into();
        self.partials.register_partial(name.clone(), source)?;
        self.notify_partial_change(&PartialChange {
            name,
            kind: ChangeKind::Modified,
        });
        Ok(())
    }

    /// Remove a registered partial and drop everything built from it.
    pub fn unregister_partial(&self, name: &str) -> Vec<String> {
        self.partials.unregister_partial(name);
        self.notify_partial_change(&PartialChange {
            name: name.to_string(),
            kind: ChangeKind::Deleted,
        })
    }

    pub fn add_partial_provider(&self, provider: Arc<dyn PartialProvider>) {
        self.partials.add_provider(provider);
        self.clear_templates();
    }

    pub fn partials(&self) -> &PartialRegistry {
        &self.partials
    }

    pub async fn partial_info(&self, name: &str) -> Result<PartialInfo, EngineError> {
        Ok(self.partials.info(name).await?)
    }

    /// Invalidate a partial and everything built from it. Returns the names
    /// of the compiled templates that were dropped.
    pub fn notify_partial_change(&self, change: &PartialChange) -> Vec<String> {
        let affected = self.partials.notify(change);
        self.drop_dependents(&affected)
    }

    /// Cells still being built are dropped too: their dependencies are not
    /// known yet, and the build may have read what just changed. The build
    /// finishes for its own callers but is never published to the cache.
    fn drop_dependents(&self, names: &BTreeSet<String>) -> Vec<String> {
        let mut templates = self.templates.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = vec![];
        templates.retain(|_, cell| match cell.get() {
            Some(t) if t.dependencies.iter().any(|d| names.contains(d)) => {
                dropped.push(t.name.clone());
                false
            }
            Some(_) => true,
            None => false,
        });
        drop(templates);
        if !dropped.is_empty() {
            warn!(templates = ?dropped, "compiled templates invalidated");
        }
        dropped
    }

    pub async fn inspect_inheritance(&self, name: &str, source: &str) -> Result<InheritanceInfo, EngineError> {
        let ast = self.parse(source)?;
        Ok(self.inheritance.inspect(name, &ast).await?)
    }

    fn cache_key(&self, source: &str) -> Result<String, serde_json::Error> {
        let options = serde_json::json!({
            "security": self.config.security,
            "optimizer": self.config.optimizer,
            "compiler": self.config.compiler,
            "render": self.config.render,
        });
        compute_cache_key(source, &options)
    }

    /// Compile through the cache. Concurrent calls for the same key share one
    /// in-flight compile.
    pub async fn compile(&self, name: &str, source: &str) -> Result<Arc<CompiledTemplate>, EngineError> {
        assert!(!name.is_empty(), "template name must not be empty");
        let key = self.cache_key(source)?;
        if !self.config.compiler.enable_caching {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::new(self.build(name, source, key).await?));
        }

        let cell = self
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        let mut built = false;
        let template = cell
            .get_or_try_init(|| {
                built = true;
                let key = key.clone();
                async move { self.build(name, source, key).await.map(Arc::new) }
            })
            .await?
            .clone();
        if built {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(template = name, key = %&key[..12], "template cache miss");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(template = name, key = %&key[..12], "template cache hit");
        }
        Ok(template)
    }

    async fn build(&self, name: &str, source: &str, cache_key: String) -> Result<CompiledTemplate, EngineError> {
        let mut timings = CompileTimings::default();

        let started = Instant::now();
        let ast = self.parse(source)?;
        timings.parse_us = started.elapsed().as_micros() as u64;

        let started = Instant::now();
        let resolved = self.inheritance.resolve(name, &ast).await?;
        timings.merge_us = started.elapsed().as_micros() as u64;

        let started = Instant::now();
        let (found, unresolved) = self.collect_partials(&resolved.ast.partials).await?;
        let security = self.secure(
            &resolved.ast,
            source.len(),
            found.iter().map(|(n, e)| (n.as_str(), &*e.ast, e.info.size as usize)),
        )?;
        timings.security_us = started.elapsed().as_micros() as u64;

        let started = Instant::now();
        let asts: BTreeMap<String, Arc<Ast>> = found.iter().map(|(n, e)| (n.clone(), e.ast.clone())).collect();
        let optimizer = Optimizer::new(self.config.optimizer.clone()).with_partials(asts);
        let optimized = optimizer.optimize(&resolved.ast);
        timings.optimize_us = started.elapsed().as_micros() as u64;

        let started = Instant::now();
        let program = self.compiler.compile(&optimized.ast)?;
        let mut partials = PartialTable::new();
        for (partial, entry) in &found {
            let compiled = entry
                .program
                .get_or_try_init(|| async { self.compiler.compile(&optimizer.optimize(&entry.ast).ast) })
                .await?;
            partials.insert(partial.clone(), compiled.clone());
        }
        timings.compile_us = started.elapsed().as_micros() as u64;

        let mut dependencies: BTreeSet<String> = found.keys().cloned().collect();
        dependencies.extend(unresolved);
        dependencies.extend(resolved.info.chain.iter().filter(|n| n.as_str() != name).cloned());

        debug!(
            template = name,
            instructions = program.len(),
            partials = partials.len(),
            parse_us = timings.parse_us,
            compile_us = timings.compile_us,
            "compiled template"
        );

        Ok(CompiledTemplate {
            name: name.to_string(),
            cache_key,
            program,
            partials,
            variables: optimized.ast.variables.clone(),
            ast: Some(Arc::new(optimized.ast)),
            dependencies,
            limits: self.config.security.runtime_limits(),
            render_options: self.config.render.clone(),
            diagnostics: Diagnostics {
                security: Some(security),
                optimization: Some(optimized.stats),
                timings,
            },
        })
    }

    /// Resolve every partial reachable from `roots`. Names no provider
    /// knows are returned separately and left to fail at render time; they
    /// still count as dependencies so a later registration invalidates.
    async fn collect_partials(
        &self,
        roots: &BTreeSet<String>,
    ) -> Result<(BTreeMap<String, Arc<PartialEntry>>, BTreeSet<String>), EngineError> {
        let mut found = BTreeMap::new();
        let mut unresolved = BTreeSet::new();
        let mut queue: Vec<String> = roots.iter().cloned().collect();
        while let Some(name) = queue.pop() {
            if found.contains_key(&name) || unresolved.contains(&name) {
                continue;
            }
            match self.partials.resolve(&name).await {
                Ok(entry) => {
                    queue.extend(entry.info.dependencies.iter().cloned());
                    found.insert(name, entry);
                }
                Err(PartialError::NotFound(_)) => {
                    debug!(partial = %name, "partial not resolvable at compile time");
                    unresolved.insert(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((found, unresolved))
    }

    /// Analyze a template and its partials as one unit. Partial threats
    /// are prefixed with the partial name.
    fn secure<'a>(
        &self,
        ast: &Ast,
        source_size: usize,
        partials: impl IntoIterator<Item = (&'a str, &'a Ast, usize)>,
    ) -> Result<SecurityResult, SecurityViolation> {
        let mut threats = self.analyze(ast, source_size).threats;
        for (name, partial, size) in partials {
            let report = self.analyze(partial, size);
            threats.extend(report.threats.into_iter().map(|t| Threat {
                message: format!("partial {:?}: {}", name, t.message),
                ..t
            }));
        }
        let result = SecurityResult::from_threats(threats, self.config.security.threshold);
        if !result.is_secure {
            return Err(SecurityViolation { result });
        }
        Ok(result)
    }

    /// Compile (through the cache) and render asynchronously.
    pub async fn render(&self, name: &str, source: &str, ctx: &mut TemplateContext) -> Result<RenderOutput, EngineError> {
        let template = self.compile(name, source).await?;
        Ok(template.render_async(ctx).await?)
    }

    pub async fn render_to_string(
        &self,
        name: &str,
        source: &str,
        ctx: &mut TemplateContext,
    ) -> Result<String, EngineError> {
        Ok(self.render(name, source, ctx).await?.text)
    }

    /// Evaluate host-supplied expression text after a security check.
    pub async fn evaluate_expression(&self, text: &str, ctx: &mut TemplateContext) -> Result<Value, EngineError> {
        let compiled = compile_expression(text)?;
        let result = self.analyze(&compiled.as_ast(), text.len());
        if !result.is_secure {
            return Err(SecurityViolation { result }.into());
        }
        Ok(compiled.evaluate_async(ctx).await?)
    }

    pub async fn precompile(
        &self,
        name: &str,
        source: &str,
        options: &PrecompileOptions,
    ) -> Result<PrecompiledArtifact, EngineError> {
        let template = self.compile(name, source).await?;
        Ok(Precompiler::package(&template, source.len(), options)?)
    }

    /// Restore an artifact, run it through this engine's security policy and
    /// seed the template cache with it. A Bytecode artifact is analyzed on
    /// the node tree lifted from its instructions.
    pub fn load_artifact(&self, artifact: &PrecompiledArtifact) -> Result<Arc<CompiledTemplate>, EngineError> {
        let mut template = Precompiler::load(artifact)?;
        let lifted;
        let ast = match template.ast.as_deref() {
            Some(ast) => ast,
            None => {
                lifted = template.program.to_ast()?;
                &lifted
            }
        };
        let partials = template
            .partials
            .iter()
            .map(|(name, program)| Ok((name.as_str(), program.to_ast()?)))
            .collect::<Result<Vec<_>, CompileError>>()?;
        let security = self.secure(
            ast,
            artifact.stats.original_size,
            partials.iter().map(|(name, ast)| (*name, ast, 0)),
        )?;
        template.diagnostics.security = Some(security);
        let template = Arc::new(template);
        if self.config.compiler.enable_caching && !template.cache_key.is_empty() {
            self.templates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(template.cache_key.clone(), Arc::new(OnceCell::new_with(Some(template.clone()))));
        }
        Ok(template)
    }

    /// Precompile every file under `dir` matching `pattern`. A failing file
    /// is recorded and the batch moves on; cancellation is checked between
    /// files.
    pub async fn precompile_directory(
        &self,
        dir: &Path,
        pattern: &str,
        options: &PrecompileOptions,
        cancel: &CancellationFlag,
    ) -> Result<BatchResult, EngineError> {
        let full = dir.join(pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&full.to_string_lossy())?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut result = BatchResult::default();
        for (i, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = paths[i..].iter().map(|p| template_name(dir, p)).collect();
                break;
            }
            let name = template_name(dir, path);
            let outcome = match tokio::fs::read_to_string(path).await {
                Ok(text) => self.precompile(&name, &text, options).await,
                Err(e) => Err(e.into()),
            };
            record(&mut result, name, outcome);
        }
        log_batch("directory", &result);
        Ok(result)
    }

    /// Precompile every partial any provider lists.
    pub async fn precompile_partials(
        &self,
        options: &PrecompileOptions,
        cancel: &CancellationFlag,
    ) -> Result<BatchResult, EngineError> {
        let names = self.partials.list().await?;
        let mut result = BatchResult::default();
        for (i, name) in names.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = names[i..].to_vec();
                break;
            }
            let outcome = self.precompile_partial(name, options).await;
            record(&mut result, name.clone(), outcome);
        }
        log_batch("partials", &result);
        Ok(result)
    }

    async fn precompile_partial(&self, name: &str, options: &PrecompileOptions) -> Result<PrecompiledArtifact, EngineError> {
        let entry = self.partials.resolve(name).await?;
        self.precompile(name, &entry.source.text, options).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .templates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .filter(|c| c.initialized())
                .count(),
        }
    }

    fn clear_templates(&self) {
        self.templates.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Drop compiled templates, compiled programs and resolved partials.
    pub fn clear_cache(&self) {
        self.clear_templates();
        self.compiler.clear_cache();
        self.partials.clear();
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// `dir/pages/home.tpl` becomes `pages/home`.
fn template_name(dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(dir).unwrap_or(path).with_extension("");
    let parts: Vec<String> = relative.iter().map(|c| c.to_string_lossy().into_owned()).collect();
    parts.join("/")
}

fn record(result: &mut BatchResult, name: String, outcome: Result<PrecompiledArtifact, EngineError>) {
    match outcome {
        Ok(artifact) => {
            result.succeeded.insert(name, artifact);
        }
        Err(e) => {
            warn!(template = %name, error = %e, "precompile failed");
            result.failed.insert(name, e.to_string());
        }
    }
}

fn log_batch(kind: &str, result: &BatchResult) {
    info!(
        kind,
        succeeded = result.succeeded.len(),
        failed = result.failed.len(),
        cancelled = result.cancelled.len(),
        "batch precompile finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partials::{MemoryPartialProvider, PartialSource};
    use crate::precompile::ArtifactFormat;
    use crate::render::RenderMode;
    use serde_json::json;
    use tokio::sync::Notify;

    /// Holds every load until released, so a change can land mid-compile.
    struct GatedProvider {
        text: Mutex<String>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl PartialProvider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        fn priority(&self) -> i32 {
            1
        }

        async fn load(&self, name: &str) -> Result<Option<PartialSource>, PartialError> {
            let text = self.text.lock().unwrap().clone();
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Some(PartialSource::new(name, text)))
        }

        async fn list(&self) -> Result<Vec<String>, PartialError> {
            Ok(vec!["slow".into()])
        }
    }

    fn ctx(vars: serde_json::Value) -> TemplateContext {
        TemplateContext::from_json(vars)
    }

    #[tokio::test]
    async fn test_render_hello() {
        let engine = TemplateEngine::default();
        let out = engine
            .render_to_string("hello", "Hello {{ name }}!", &mut ctx(json!({"name": "World"})))
            .await
            .unwrap();
        assert_eq!(out, "Hello World!");
    }

    #[tokio::test]
    async fn test_second_compile_hits_cache() {
        let engine = TemplateEngine::default();
        let a = engine.compile("a", "x{{ y }}").await.unwrap();
        let b = engine.compile("a", "x{{ y }}").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = engine.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_compiles_share_one_build() {
        let engine = TemplateEngine::default();
        let compiles = (0..8).map(|_| engine.compile("t", "{% for i in range(3) %}{{ i }}{% end %}"));
        let results = futures::future::join_all(compiles).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(engine.cache_stats().misses, 1);
        assert_eq!(engine.cache_stats().hits, 7);
    }

    #[tokio::test]
    async fn test_insecure_template_rejected() {
        let mut config = EngineConfig::default();
        config.security.denied_functions = vec!["upper".into()];
        let engine = TemplateEngine::new(config);
        let err = engine.compile("t", "{{ upper(x) }}").await.unwrap_err();
        assert!(matches!(err, EngineError::Security(_)));
        assert!(matches!(engine.validate("{{ upper(x) }}"), Err(EngineError::Security(_))));
        assert!(!engine.check_security("{{ upper(x) }}").unwrap().is_secure);
    }

    #[tokio::test]
    async fn test_insecure_partial_rejects_template() {
        let mut config = EngineConfig::default();
        config.security.denied_functions = vec!["upper".into()];
        let engine = TemplateEngine::new(config);
        engine.register_partial("shout", "{{ upper(x) }}").unwrap();
        let err = engine.compile("t", r#"{% include "shout" %}"#).await.unwrap_err();
        match err {
            EngineError::Security(v) => assert!(v.result.threats[0].message.contains("shout")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_layout_merge() {
        let engine = TemplateEngine::default();
        engine
            .register_layout("base", "<title>{% block title %}Default{% end %}</title>")
            .unwrap();
        let out = engine
            .render_to_string(
                "page",
                r#"{% extends "base" %}{% block title %}Page{% end %}"#,
                &mut TemplateContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, "<title>Page</title>");
        let t = engine.compile("page", r#"{% extends "base" %}{% block title %}Page{% end %}"#).await.unwrap();
        assert!(t.dependencies.contains("base"));
    }

    #[tokio::test]
    async fn test_partial_change_invalidates_template() {
        let engine = TemplateEngine::default();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("greet", "hi {{ name }}");
        engine.add_partial_provider(provider.clone());

        let src = r#"[{% include "greet" %}]"#;
        let mut c = ctx(json!({"name": "bo"}));
        assert_eq!(engine.render_to_string("t", src, &mut c).await.unwrap(), "[hi bo]");

        provider.insert("greet", "bye {{ name }}");
        let dropped = engine.notify_partial_change(&PartialChange {
            name: "greet".into(),
            kind: ChangeKind::Modified,
        });
        assert_eq!(dropped, vec!["t".to_string()]);
        assert_eq!(engine.render_to_string("t", src, &mut c).await.unwrap(), "[bye bo]");
    }

    #[tokio::test]
    async fn test_partial_created_after_compile_invalidates() {
        let engine = TemplateEngine::default();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        engine.add_partial_provider(provider.clone());

        let src = r#"[{% include "late" %}]"#;
        let first = engine.compile("t", src).await.unwrap();
        assert!(first.dependencies.contains("late"));

        provider.insert("late", "here");
        let dropped = engine.notify_partial_change(&PartialChange {
            name: "late".into(),
            kind: ChangeKind::Created,
        });
        assert_eq!(dropped, vec!["t".to_string()]);
        assert_eq!(engine.render_to_string("t", src, &mut TemplateContext::new()).await.unwrap(), "[here]");
    }

    #[tokio::test]
    async fn test_change_during_compile_is_not_cached() {
        let engine = TemplateEngine::default();
        let provider = Arc::new(GatedProvider {
            text: Mutex::new("old".into()),
            entered: Notify::new(),
            release: Notify::new(),
        });
        engine.add_partial_provider(provider.clone());
        let src = r#"{% include "slow" %}"#;

        let change = async {
            provider.entered.notified().await;
            *provider.text.lock().unwrap() = "new".into();
            engine.notify_partial_change(&PartialChange {
                name: "slow".into(),
                kind: ChangeKind::Modified,
            });
            provider.release.notify_one();
        };
        let (stale, ()) = tokio::join!(engine.compile("t", src), change);
        let stale = stale.unwrap();
        assert_eq!(stale.render_to_string(&mut TemplateContext::new()).unwrap(), "old");
        assert_eq!(engine.cache_stats().entries, 0);

        provider.release.notify_one();
        let fresh = engine.compile("t", src).await.unwrap();
        assert_eq!(fresh.render_to_string(&mut TemplateContext::new()).unwrap(), "new");
        assert_eq!(engine.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn test_unregister_partial_invalidates() {
        let engine = TemplateEngine::default();
        engine.register_partial("p", "x").unwrap();
        engine.compile("t", r#"{% include "p" %}"#).await.unwrap();
        assert_eq!(engine.unregister_partial("p"), vec!["t".to_string()]);
        assert!(engine.render("t", r#"{% include "p" %}"#, &mut TemplateContext::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_lenient_mode_from_config() {
        let mut config = EngineConfig::default();
        config.render.mode = RenderMode::Lenient;
        let engine = TemplateEngine::new(config);
        let out = engine
            .render("t", "a{{ missing }}b", &mut TemplateContext::new())
            .await
            .unwrap();
        assert_eq!(out.text, "a[[error: undefined variable `missing`]]b");
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_expression_gate() {
        let mut config = EngineConfig::default();
        config.security.denied_functions = vec!["lower".into()];
        let engine = TemplateEngine::new(config);
        let mut c = ctx(json!({"n": 4}));
        assert_eq!(engine.evaluate_expression("n * 2", &mut c).await.unwrap(), Value::Int(8));
        assert!(matches!(
            engine.evaluate_expression("lower(\"A\")", &mut c).await,
            Err(EngineError::Security(_))
        ));
    }

    #[tokio::test]
    async fn test_precompile_directory_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pages")).unwrap();
        std::fs::write(dir.path().join("pages/good.tpl"), "ok {{ x }}").unwrap();
        std::fs::write(dir.path().join("pages/bad.tpl"), "{% if %}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let engine = TemplateEngine::default();
        let result = engine
            .precompile_directory(dir.path(), "**/*.tpl", &PrecompileOptions::default(), &CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(result.summary().succeeded, vec!["pages/good".to_string()]);
        assert!(result.failed.contains_key("pages/bad"));
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tpl"), "a").unwrap();
        std::fs::write(dir.path().join("b.tpl"), "b").unwrap();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let result = TemplateEngine::default()
            .precompile_directory(dir.path(), "*.tpl", &PrecompileOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(result.succeeded.is_empty());
        assert_eq!(result.cancelled, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_seeds_cache() {
        let producer = TemplateEngine::default();
        producer.register_partial("sig", "-- {{ who }}").unwrap();
        let src = r#"Dear {{ who }} {% include "sig" %}"#;
        let artifact = producer.precompile("letter", src, &PrecompileOptions::default()).await.unwrap();
        assert_eq!(artifact.format, ArtifactFormat::Bytecode);

        let consumer = TemplateEngine::default();
        let loaded = consumer.load_artifact(&artifact).unwrap();
        let mut c = ctx(json!({"who": "Ada"}));
        assert_eq!(loaded.render_to_string(&mut c).unwrap(), "Dear Ada -- Ada");

        consumer.compile("letter", src).await.unwrap();
        assert_eq!(consumer.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_loaded_artifact_is_checked_against_policy() {
        let producer = TemplateEngine::default();
        producer.register_partial("shout", "{{ upper(x) }}").unwrap();
        let mut config = EngineConfig::default();
        config.security.denied_functions = vec!["upper".into()];
        let consumer = TemplateEngine::new(config);

        let cases = [
            ("{{ upper(x) }}", ArtifactFormat::Bytecode),
            ("{{ upper(x) }}", ArtifactFormat::Binary),
            (r#"{% include "shout" %}"#, ArtifactFormat::Bytecode),
        ];
        for (src, format) in cases {
            let options = PrecompileOptions {
                format,
                ..PrecompileOptions::default()
            };
            let artifact = producer.precompile("t", src, &options).await.unwrap();
            assert!(
                matches!(consumer.load_artifact(&artifact), Err(EngineError::Security(_))),
                "{:?} {}",
                format,
                src
            );
        }
        assert_eq!(consumer.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_precompile_partials_tolerates_failures() {
        let engine = TemplateEngine::default();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("fine", "ok");
        provider.insert("broken", "{{ nope");
        engine.add_partial_provider(provider);
        let result = engine
            .precompile_partials(&PrecompileOptions::default(), &CancellationFlag::new())
            .await
            .unwrap();
        assert!(result.succeeded.contains_key("fine"));
        assert!(result.failed.contains_key("broken"));
    }

    #[test]
    #[should_panic(expected = "inline_threshold")]
    fn test_zero_inline_threshold_panics() {
        let mut config = EngineConfig::default();
        config.optimizer.inline_threshold = 0;
        TemplateEngine::new(config);
    }
}
