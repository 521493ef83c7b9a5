//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use futures::FutureExt;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use templar_core::{
    EngineConfig, EngineError, IterationLimitAction, MemoryPartialProvider, MergeError, OptimizationOptions, Optimizer,
    RenderError, RenderMode, TemplateContext, TemplateEngine, Value,
};

/// Templates with a context that renders them without errors.
fn corpus() -> Vec<(&'static str, serde_json::Value)> {
    vec![
        ("Hello {{ name }}!", json!({"name": "World"})),
        ("{{ 1 + 2 * 3 }} {{ \"a\" + \"b\" }}", json!({})),
        ("{% if true %}yes{% else %}no{% end %}", json!({})),
        ("{% if 1 > 2 %}never{% end %}tail", json!({})),
        (
            "{% for u in users %}{{ loop.index }}:{{ u.name | upper }}{% if not loop.last %}, {% end %}{% end %}",
            json!({"users": [{"name": "ada"}, {"name": "bob"}]}),
        ),
        (
            "{% for i in range(3) %}{{ prefix + \"-\" }}{{ i }}{% end %}",
            json!({"prefix": "p"}),
        ),
        ("{% set total = price * qty %}{{ total }}", json!({"price": 3, "qty": 4})),
        (
            "{% for row in rows %}{% for c in row %}{{ c }}{% end %}|{% end %}",
            json!({"rows": [[1, 2], [3]]}),
        ),
        ("{{ missing_ok | default(\"fallback\") }}", json!({"missing_ok": null})),
        ("a{{ \"\" }}b{% if false %}x{% end %}c", json!({})),
    ]
}

fn engine_with(optimizer: OptimizationOptions) -> TemplateEngine {
    TemplateEngine::new(EngineConfig {
        optimizer,
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn invariant_hello_world() {
    let engine = TemplateEngine::default();
    let mut ctx = TemplateContext::from_json(json!({"name": "World"}));
    let out = engine.render_to_string("hello", "Hello {{ name }}!", &mut ctx).await.unwrap();
    assert_eq!(out, "Hello World!");
}

#[tokio::test]
async fn invariant_conditional_else_branch() {
    let engine = TemplateEngine::default();
    let mut ctx = TemplateContext::from_json(json!({"age": 16}));
    let out = engine
        .render_to_string("age", "{% if age >= 18 %}Adult{% else %}Minor{% end %}", &mut ctx)
        .await
        .unwrap();
    assert_eq!(out, "Minor");
}

#[tokio::test]
async fn invariant_block_override() {
    let engine = TemplateEngine::default();
    engine.register_layout("base", "{% block title %}Default{% end %}").unwrap();
    let out = engine
        .render_to_string(
            "page",
            r#"{% extends "base" %}{% block title %}Page{% end %}"#,
            &mut TemplateContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(out, "Page");
}

#[tokio::test]
async fn invariant_inheritance_cycle_rejected_before_merge() {
    let engine = TemplateEngine::default();
    engine
        .register_layout("B", r#"{% extends "A" %}{% block body %}b{% end %}"#)
        .unwrap();
    let err = engine
        .compile("A", r#"{% extends "B" %}{% block body %}a{% end %}"#)
        .await
        .unwrap_err();
    match err {
        EngineError::Merge(MergeError::Cycle { chain }) => assert_eq!(chain, vec!["A", "B", "A"]),
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert_eq!(engine.cache_stats().entries, 0);
}

#[test]
fn invariant_scope_disposal() {
    let mut ctx = TemplateContext::new();
    ctx.set("before", 1);
    {
        let mut scope = ctx.push_scope();
        scope.set("inside", 2);
        assert_eq!(scope.get("before"), Some(&Value::Int(1)));
        assert_eq!(scope.get("inside"), Some(&Value::Int(2)));
    }
    assert!(ctx.get("inside").is_none());
    assert_eq!(ctx.get("before"), Some(&Value::Int(1)));
    assert_eq!(ctx.depth(), 1);
}

#[tokio::test]
async fn invariant_iteration_limit_aborts_at_exactly_limit() {
    let mut config = EngineConfig::default();
    config.security.max_loop_iterations = 1000;
    let engine = TemplateEngine::new(config);

    let ticks = Arc::new(AtomicU64::new(0));
    let counter = ticks.clone();
    let mut ctx = TemplateContext::from_json(json!({"n": 5000}));
    ctx.register_function("tick", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });

    let err = engine
        .render("loop", "{% for i in range(n) %}{{ tick() }}{% end %}", &mut ctx)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Render(RenderError::IterationLimitExceeded { limit: 1000 })
    ));
    assert_eq!(ticks.load(Ordering::SeqCst), 1000);
}

#[tokio::test]
async fn invariant_iteration_limit_fatal_in_lenient_mode() {
    let mut config = EngineConfig::default();
    config.security.max_loop_iterations = 10;
    config.render = templar_core::RenderOptions::lenient();
    let engine = TemplateEngine::new(config);
    let mut ctx = TemplateContext::from_json(json!({"n": 50}));
    let err = engine
        .render("loop", "{% for i in range(n) %}{{ i }}{% end %}", &mut ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Render(RenderError::IterationLimitExceeded { .. })));
}

#[tokio::test]
async fn invariant_truncate_loop_only_in_lenient_mode() {
    let mut config = EngineConfig::default();
    config.security.max_loop_iterations = 3;
    config.security.iteration_limit_action = IterationLimitAction::TruncateLoop;
    config.render.mode = RenderMode::Lenient;
    let engine = TemplateEngine::new(config.clone());
    let src = "{% for i in range(n) %}{{ i }}{% end %}!";

    let out = engine
        .render("loop", src, &mut TemplateContext::from_json(json!({"n": 10})))
        .await
        .unwrap();
    assert!(out.text.starts_with("012[[error:"), "{}", out.text);
    assert!(out.text.ends_with('!'));
    assert_eq!(out.errors.len(), 1);
    assert_eq!(out.iterations, 3);

    config.render.mode = RenderMode::Strict;
    let strict = TemplateEngine::new(config);
    let err = strict
        .render("loop", src, &mut TemplateContext::from_json(json!({"n": 10})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Render(RenderError::IterationLimitExceeded { limit: 3 })));
}

#[tokio::test]
async fn invariant_partial_render_leaves_caller_context_unchanged() {
    let engine = TemplateEngine::default();
    engine
        .register_partial("p", "{% set v = \"inner\" %}{% for x in xs %}{{ x }}{% end %}{{ v }}")
        .unwrap();
    let mut ctx = TemplateContext::from_json(json!({"xs": [1, 2]}));
    let depth = ctx.depth();
    let out = engine
        .render_to_string("t", r#"{% set v = "outer" %}{% include "p" %}|{{ v }}"#, &mut ctx)
        .await
        .unwrap();
    assert_eq!(out, "12inner|outer");
    assert_eq!(ctx.depth(), depth);
    assert!(ctx.get("x").is_none());
    assert_eq!(ctx.get("xs"), Some(&Value::from(vec![1, 2])));
}

#[tokio::test]
async fn invariant_async_functions_keep_output_order() {
    let engine = TemplateEngine::default();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    let mut ctx = TemplateContext::new();
    ctx.register_async_function("fetch", move |args: Vec<Value>| {
        let log = log.clone();
        async move {
            let n = match args.first() {
                Some(Value::Int(n)) => *n,
                _ => 0,
            };
            log.lock().unwrap().push(format!("start {}", n));
            // Earlier calls take longer, so any overlap would reorder output.
            for _ in 0..(3 - n) * 4 {
                tokio::task::yield_now().await;
            }
            log.lock().unwrap().push(format!("end {}", n));
            Ok(Value::from(format!("v{}", n)))
        }
        .boxed()
    });

    let out = engine
        .render_to_string("t", "<{% for i in range(3) %}[{{ fetch(i) }}]{% end %}>", &mut ctx)
        .await
        .unwrap();
    assert_eq!(out, "<[v0][v1][v2]>");
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
    );
}

#[tokio::test]
async fn invariant_partial_registered_after_compile_is_picked_up() {
    let engine = TemplateEngine::default();
    let src = r#"[{% include "late" %}]"#;
    assert!(engine.render("t", src, &mut TemplateContext::new()).await.is_err());

    engine.register_partial("late", "here").unwrap();
    let out = engine.render_to_string("t", src, &mut TemplateContext::new()).await.unwrap();
    assert_eq!(out, "[here]");
}

#[tokio::test]
async fn invariant_partial_priority() {
    let engine = TemplateEngine::default();
    let low = MemoryPartialProvider::new(5).with_name("low");
    low.insert("x", "from five");
    let high = MemoryPartialProvider::new(10).with_name("high");
    high.insert("x", "from ten");
    engine.add_partial_provider(Arc::new(low));
    engine.add_partial_provider(Arc::new(high));

    let info = engine.partial_info("x").await.unwrap();
    assert_eq!(info.provider, "high");
    let out = engine
        .render_to_string("t", r#"{% include "x" %}"#, &mut TemplateContext::new())
        .await
        .unwrap();
    assert_eq!(out, "from ten");
}

#[tokio::test]
async fn invariant_identical_compile_hits_cache() {
    let engine = TemplateEngine::default();
    let a = engine.compile("t", "Hi\n{{ who }}").await.unwrap();
    let b = engine.compile("t", "Hi\n{{ who }}").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(engine.cache_stats().misses, 1);
    assert_eq!(engine.cache_stats().hits, 1);

    // Same text with different line endings is the same template.
    engine.compile("t", "Hi\r\n{{ who }}").await.unwrap();
    assert_eq!(engine.cache_stats().hits, 2);
}

#[test]
fn invariant_optimize_is_idempotent() {
    let optimizer = Optimizer::new(OptimizationOptions::default());
    for (src, _) in corpus() {
        let ast = templar_core::parse(src).unwrap();
        let once = optimizer.optimize(&ast).ast;
        let twice = optimizer.optimize(&once).ast;
        assert_eq!(once, twice, "not a fixed point: {}", src);
    }
}

#[tokio::test]
async fn invariant_optimization_preserves_output() {
    let plain = engine_with(OptimizationOptions::none());
    let optimized = engine_with(OptimizationOptions::default());
    for (src, vars) in corpus() {
        let mut a = TemplateContext::from_json(vars.clone());
        let mut b = TemplateContext::from_json(vars);
        let expected = plain.render_to_string("t", src, &mut a).await.unwrap();
        let actual = optimized.render_to_string("t", src, &mut b).await.unwrap();
        assert_eq!(expected, actual, "output changed for: {}", src);
    }
}

#[tokio::test]
async fn invariant_declared_variables_suffice() {
    let engine = TemplateEngine::default();
    for (src, _) in corpus() {
        let ast = engine.parse(src).unwrap();
        let mut ctx = TemplateContext::with_builtins();
        for name in &ast.variables {
            ctx.set(name.clone(), Value::Int(1));
        }
        if let Err(EngineError::Render(RenderError::UndefinedVariable { name })) =
            engine.render("t", src, &mut ctx).await
        {
            panic!("`{}` reported missing in: {}", name, src);
        }
    }
}

#[tokio::test]
async fn invariant_render_leaves_context_depth_unchanged() {
    let engine = TemplateEngine::default();
    let mut ctx = TemplateContext::from_json(json!({"xs": [1, 2, 3]}));
    let depth = ctx.depth();
    engine
        .render("t", "{% for x in xs %}{% set y = x %}{{ y }}{% end %}", &mut ctx)
        .await
        .unwrap();
    assert_eq!(ctx.depth(), depth);
    assert!(ctx.get("x").is_none());

    let _ = engine.render("t2", "{% for x in xs %}{{ nope }}{% end %}", &mut ctx).await;
    assert_eq!(ctx.depth(), depth);
}

#[cfg(feature = "test-hooks")]
#[tokio::test]
async fn invariant_compile_runs_security() {
    use templar_core::engine::{get_security_check_count, reset_security_check_count};

    reset_security_check_count();
    let engine = TemplateEngine::default();
    engine.register_partial("p", "x").unwrap();
    engine.compile("t", r#"{% include "p" %}"#).await.unwrap();
    assert!(get_security_check_count() >= 2);
}
