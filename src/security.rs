//! Security Analyzer - Rule/Policy Separation
//!
//! Rules inspect the AST and produce structured threats.
//! The policy decides which threat levels block admission.
//! Analysis is a pure function of (AST, source size, policy).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

use crate::ast::{walk_nodes, Ast, Expr, Node, Span};
use crate::compiler::{compile_expression, CompileError};
use crate::parser::{parse, SyntaxError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IterationLimitAction {
    /// Fail the whole render.
    #[default]
    AbortRender,
    /// Stop only the offending loop; honoured in lenient render mode.
    TruncateLoop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    #[serde(default = "default_max_template_size")]
    pub max_template_size: usize,
    #[serde(default = "default_max_expression_depth")]
    pub max_expression_depth: usize,
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u64,
    #[serde(default = "default_max_includes")]
    pub max_includes: usize,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: usize,
    /// Entries match exactly, or by prefix when written as `ns.*`.
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,
    #[serde(default)]
    pub denied_namespaces: Vec<String>,
    #[serde(default)]
    pub allowed_functions: Vec<String>,
    #[serde(default)]
    pub denied_functions: Vec<String>,
    #[serde(default)]
    pub allowed_types: Vec<String>,
    #[serde(default)]
    pub denied_types: Vec<String>,
    #[serde(default)]
    pub allow_file_access: bool,
    #[serde(default)]
    pub allow_network_access: bool,
    #[serde(default)]
    pub allow_reflection: bool,
    #[serde(default)]
    pub allow_instantiation: bool,
    /// Lowest risk level that makes a template insecure.
    #[serde(default = "default_threshold")]
    pub threshold: RiskLevel,
    #[serde(default)]
    pub iteration_limit_action: IterationLimitAction,
    #[serde(default = "default_true")]
    pub flag_unbounded_loops: bool,
}

fn default_max_template_size() -> usize { 1024 * 1024 }
fn default_max_expression_depth() -> usize { 32 }
fn default_max_nesting_depth() -> usize { 64 }
fn default_max_loop_iterations() -> u64 { 10_000 }
fn default_max_includes() -> usize { 64 }
fn default_max_output_size() -> usize { 10 * 1024 * 1024 }
fn default_threshold() -> RiskLevel { RiskLevel::High }
fn default_true() -> bool { true }

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_template_size: default_max_template_size(),
            max_expression_depth: default_max_expression_depth(),
            max_nesting_depth: default_max_nesting_depth(),
            max_loop_iterations: default_max_loop_iterations(),
            max_includes: default_max_includes(),
            max_output_size: default_max_output_size(),
            allowed_namespaces: vec![],
            denied_namespaces: vec![],
            allowed_functions: vec![],
            denied_functions: vec![],
            allowed_types: vec![],
            denied_types: vec![],
            allow_file_access: false,
            allow_network_access: false,
            allow_reflection: false,
            allow_instantiation: false,
            threshold: default_threshold(),
            iteration_limit_action: IterationLimitAction::AbortRender,
            flag_unbounded_loops: true,
        }
    }
}

impl SecurityPolicy {
    pub fn runtime_limits(&self) -> RuntimeLimits {
        RuntimeLimits {
            max_loop_iterations: self.max_loop_iterations,
            max_output_size: self.max_output_size,
            iteration_limit_action: self.iteration_limit_action,
        }
    }
}

/// The part of a policy enforced while rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLimits {
    pub max_loop_iterations: u64,
    pub max_output_size: usize,
    pub iteration_limit_action: IterationLimitAction,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        SecurityPolicy::default().runtime_limits()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threat {
    pub rule: String,
    pub level: RiskLevel,
    pub message: String,
    #[serde(default)]
    pub location: Option<Span>,
    #[serde(default)]
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityResult {
    pub is_secure: bool,
    pub risk_level: RiskLevel,
    pub threats: Vec<Threat>,
}

impl SecurityResult {
    pub fn from_threats(threats: Vec<Threat>, threshold: RiskLevel) -> Self {
        let risk_level = threats.iter().map(|t| t.level).max().unwrap_or_default();
        Self {
            is_secure: threats.iter().all(|t| t.level < threshold),
            risk_level,
            threats,
        }
    }

    pub fn blocking(&self, threshold: RiskLevel) -> impl Iterator<Item = &Threat> {
        self.threats.iter().filter(move |t| t.level >= threshold)
    }
}

#[derive(Debug, Clone, Error)]
#[error("template rejected by security policy (risk {:?}, {} threats)", .result.risk_level, .result.threats.len())]
pub struct SecurityViolation {
    pub result: SecurityResult,
}

/// Input for analysis
pub struct AnalysisInput<'a> {
    pub ast: &'a Ast,
    pub source_size: usize,
}

/// Security rule trait - produces threats
pub trait SecurityRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat>;
}

fn threat(rule: &str, level: RiskLevel, message: String, location: Option<Span>, fix: &str) -> Threat {
    Threat {
        rule: rule.to_string(),
        level,
        message,
        location,
        remediation: vec![fix.to_string()],
    }
}

/// Every expression in the template with the span of its owning node.
fn expressions(ast: &Ast) -> Vec<(&Expr, Option<Span>)> {
    let mut out = vec![];
    walk_nodes(ast.nodes(), &mut |node, _| {
        for e in node.expressions() {
            out.push((e, node.span()));
        }
    });
    out
}

// --- Concrete Rules ---

pub struct TemplateSizeRule;

impl SecurityRule for TemplateSizeRule {
    fn name(&self) -> &'static str { "template_size" }

    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat> {
        if input.source_size <= policy.max_template_size {
            return vec![];
        }
        vec![threat(
            self.name(),
            RiskLevel::High,
            format!(
                "template is {} bytes, limit is {}",
                input.source_size, policy.max_template_size
            ),
            None,
            "Split the template into partials",
        )]
    }
}

pub struct ExpressionDepthRule;

impl SecurityRule for ExpressionDepthRule {
    fn name(&self) -> &'static str { "expression_depth" }

    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat> {
        expressions(input.ast)
            .into_iter()
            .filter(|(e, _)| e.depth() > policy.max_expression_depth)
            .map(|(e, span)| {
                threat(
                    self.name(),
                    RiskLevel::High,
                    format!(
                        "expression nests {} levels deep, limit is {}",
                        e.depth(),
                        policy.max_expression_depth
                    ),
                    span,
                    "Compute the value in host code and pass it in the context",
                )
            })
            .collect()
    }
}

pub struct NestingDepthRule;

impl SecurityRule for NestingDepthRule {
    fn name(&self) -> &'static str { "nesting_depth" }

    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat> {
        let mut deepest: Option<(usize, Option<Span>)> = None;
        walk_nodes(input.ast.nodes(), &mut |node, depth| {
            let depth = depth + 1;
            if depth > policy.max_nesting_depth && deepest.map_or(true, |(d, _)| depth > d) {
                deepest = Some((depth, node.span()));
            }
        });
        match deepest {
            Some((depth, span)) => vec![threat(
                self.name(),
                RiskLevel::High,
                format!("directives nest {} levels deep, limit is {}", depth, policy.max_nesting_depth),
                span,
                "Flatten nested blocks or move them into partials",
            )],
            None => vec![],
        }
    }
}

/// Iteration count of a loop collection when it is known without rendering.
pub fn static_loop_bound(collection: &Expr) -> Option<u64> {
    let int = |e: &Expr| match e {
        Expr::Literal(crate::value::Value::Int(i)) => Some(*i),
        _ => None,
    };
    match collection {
        Expr::List(items) => Some(items.len() as u64),
        Expr::Literal(v) => v.len().map(|n| n as u64),
        Expr::Call { name, args } if name == "range" => match args.as_slice() {
            [n] => int(n).map(|n| n.max(0) as u64),
            [a, b] => match (int(a), int(b)) {
                (Some(a), Some(b)) => Some(b.saturating_sub(a).max(0) as u64),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

pub struct LoopBoundRule;

impl SecurityRule for LoopBoundRule {
    fn name(&self) -> &'static str { "loop_bound" }

    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat> {
        let mut threats = vec![];
        walk_nodes(input.ast.nodes(), &mut |node, _| {
            let (collection, span) = match node {
                Node::Loop { collection, span, .. } => (collection, *span),
                _ => return,
            };
            match static_loop_bound(collection) {
                Some(n) if n > policy.max_loop_iterations => threats.push(threat(
                    self.name(),
                    RiskLevel::High,
                    format!(
                        "loop over `{}` runs {} iterations, limit is {}",
                        collection, n, policy.max_loop_iterations
                    ),
                    Some(span),
                    "Reduce the loop range",
                )),
                Some(_) => {}
                None if policy.flag_unbounded_loops => threats.push(threat(
                    self.name(),
                    RiskLevel::Low,
                    format!(
                        "loop over `{}` has no static bound; runtime limit of {} iterations applies",
                        collection, policy.max_loop_iterations
                    ),
                    Some(span),
                    "Bound the collection in host code",
                )),
                None => {}
            }
        });
        threats
    }
}

pub struct IncludeCountRule;

impl SecurityRule for IncludeCountRule {
    fn name(&self) -> &'static str { "include_count" }

    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat> {
        let mut count = 0;
        walk_nodes(input.ast.nodes(), &mut |node, _| {
            if matches!(node, Node::Partial { .. }) {
                count += 1;
            }
        });
        if count <= policy.max_includes {
            return vec![];
        }
        vec![threat(
            self.name(),
            RiskLevel::High,
            format!("template includes {} partials, limit is {}", count, policy.max_includes),
            None,
            "Merge small partials together",
        )]
    }
}

const FILE_NAMESPACES: &[&str] = &["fs", "file", "io", "path"];
const NETWORK_NAMESPACES: &[&str] = &["http", "net", "url", "socket"];
const REFLECTION_NAMES: &[&str] = &["reflect", "type_of", "typeof", "get_type", "meta"];
const INSTANTIATION_NAMES: &[&str] = &["new", "create", "activator", "construct"];

fn list_matches(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| match entry.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => entry == name,
    })
}

/// Checks called names against capability toggles and allow/deny lists.
///
/// For a call `System.IO.read(x)` the function is `System.IO.read`, the
/// namespace is `System.IO` and the types are the capitalized segments
/// `System` and `IO`. A name that is both allowed and denied is denied,
/// and the conflict is reported separately at Medium.
pub struct ApiAccessRule;

impl ApiAccessRule {
    fn capability_threat(&self, name: &str, span: Option<Span>, policy: &SecurityPolicy) -> Option<Threat> {
        let segments: Vec<String> = name.split('.').map(str::to_ascii_lowercase).collect();
        let hit = |table: &[&str]| segments.iter().any(|s| table.contains(&s.as_str()));
        let (capability, flag) = if hit(FILE_NAMESPACES) {
            ("file system access", policy.allow_file_access)
        } else if hit(NETWORK_NAMESPACES) {
            ("network access", policy.allow_network_access)
        } else if hit(REFLECTION_NAMES) {
            ("reflection", policy.allow_reflection)
        } else if hit(INSTANTIATION_NAMES) {
            ("object instantiation", policy.allow_instantiation)
        } else {
            return None;
        };
        if flag {
            return None;
        }
        Some(threat(
            self.name(),
            RiskLevel::Critical,
            format!("call to `{}` requires {}, which the policy disables", name, capability),
            span,
            "Enable the capability in the policy or remove the call",
        ))
    }
}

impl SecurityRule for ApiAccessRule {
    fn name(&self) -> &'static str { "api_access" }

    fn check(&self, input: &AnalysisInput<'_>, policy: &SecurityPolicy) -> Vec<Threat> {
        let mut calls: BTreeMap<&str, Option<Span>> = BTreeMap::new();
        for (expr, span) in expressions(input.ast) {
            expr.walk(&mut |e| {
                if let Expr::Call { name, .. } = e {
                    calls.entry(name.as_str()).or_insert(span);
                }
            });
        }

        let mut threats = vec![];
        for (name, span) in calls {
            let namespace = name.rsplit_once('.').map(|(ns, _)| ns);
            let types: Vec<&str> = name
                .split('.')
                .filter(|s| s.starts_with(|c: char| c.is_ascii_uppercase()))
                .collect();

            let denied = namespace.map_or(false, |ns| list_matches(&policy.denied_namespaces, ns))
                || list_matches(&policy.denied_functions, name)
                || types.iter().any(|t| list_matches(&policy.denied_types, t));
            let allowed = namespace.map_or(false, |ns| list_matches(&policy.allowed_namespaces, ns))
                || list_matches(&policy.allowed_functions, name)
                || (!types.is_empty() && types.iter().all(|t| list_matches(&policy.allowed_types, t)));
            let allow_list_active = !policy.allowed_functions.is_empty() || !policy.allowed_namespaces.is_empty();

            if denied {
                threats.push(threat(
                    self.name(),
                    RiskLevel::High,
                    format!("call to `{}` is denied by policy", name),
                    span,
                    "Remove the call",
                ));
                if allowed {
                    threats.push(threat(
                        self.name(),
                        RiskLevel::Medium,
                        format!("`{}` is both allowed and denied; deny takes precedence", name),
                        span,
                        "Remove the conflicting allow or deny entry",
                    ));
                }
            } else if allow_list_active && !allowed {
                threats.push(threat(
                    self.name(),
                    RiskLevel::High,
                    format!("call to `{}` is not in the allow list", name),
                    span,
                    "Add the function or its namespace to the allow list",
                ));
            } else if !policy.allowed_types.is_empty() {
                if let Some(t) = types.iter().find(|t| !list_matches(&policy.allowed_types, t)) {
                    threats.push(threat(
                        self.name(),
                        RiskLevel::High,
                        format!("type `{}` used by `{}` is not in the allow list", t, name),
                        span,
                        "Add the type to the allow list",
                    ));
                }
            }

            threats.extend(self.capability_threat(name, span, policy));
        }
        threats
    }
}

/// Analyzer orchestrates rules and applies the policy threshold
pub struct SecurityAnalyzer {
    rules: Vec<Box<dyn SecurityRule>>,
}

impl SecurityAnalyzer {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(TemplateSizeRule),
                Box::new(ExpressionDepthRule),
                Box::new(NestingDepthRule),
                Box::new(LoopBoundRule),
                Box::new(IncludeCountRule),
                Box::new(ApiAccessRule),
            ],
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn SecurityRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn analyze(&self, ast: &Ast, source_size: usize, policy: &SecurityPolicy) -> SecurityResult {
        let input = AnalysisInput { ast, source_size };
        let mut threats = vec![];
        for rule in &self.rules {
            threats.extend(rule.check(&input, policy));
        }
        for t in threats.iter().filter(|t| t.level >= policy.threshold) {
            warn!(rule = %t.rule, level = ?t.level, "{}", t.message);
        }
        SecurityResult::from_threats(threats, policy.threshold)
    }
}

impl Default for SecurityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `source` and analyze it with the default rule set.
pub fn check_security(source: &str, policy: &SecurityPolicy) -> Result<SecurityResult, SyntaxError> {
    let ast = parse(source)?;
    Ok(SecurityAnalyzer::new().analyze(&ast, source.len(), policy))
}

/// Runtime hook for host-supplied expression text, checked before it is
/// evaluated.
pub fn check_dynamic_expression(text: &str, policy: &SecurityPolicy) -> Result<SecurityResult, CompileError> {
    let compiled = compile_expression(text)?;
    let ast = compiled.as_ast();
    Ok(SecurityAnalyzer::new().analyze(&ast, text.len(), policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(src: &str, policy: &SecurityPolicy) -> SecurityResult {
        check_security(src, policy).unwrap()
    }

    #[test]
    fn test_plain_template_is_secure() {
        let r = analyze("Hello {{ name }}!", &SecurityPolicy::default());
        assert!(r.is_secure);
        assert_eq!(r.risk_level, RiskLevel::Low);
        assert!(r.threats.is_empty());
    }

    #[test]
    fn test_unbounded_loop_is_flagged_low() {
        let r = analyze("{% for x in items %}{{ x }}{% end %}", &SecurityPolicy::default());
        assert!(r.is_secure);
        assert_eq!(r.threats.len(), 1);
        assert_eq!(r.threats[0].rule, "loop_bound");
        assert_eq!(r.threats[0].level, RiskLevel::Low);
    }

    #[test]
    fn test_static_loop_bound() {
        let policy = SecurityPolicy {
            max_loop_iterations: 10,
            ..SecurityPolicy::default()
        };
        assert!(analyze("{% for i in range(5) %}{% end %}", &policy).threats.is_empty());
        let r = analyze("{% for i in range(50) %}{% end %}", &policy);
        assert!(!r.is_secure);
        assert_eq!(r.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_expression_depth_limit() {
        let policy = SecurityPolicy {
            max_expression_depth: 3,
            ..SecurityPolicy::default()
        };
        let r = analyze("{{ a + b + c + d + e }}", &policy);
        assert!(!r.is_secure);
        assert_eq!(r.threats[0].rule, "expression_depth");
    }

    #[test]
    fn test_include_count_limit() {
        let policy = SecurityPolicy {
            max_includes: 1,
            ..SecurityPolicy::default()
        };
        let r = analyze(r#"{% include "a" %}{% include "b" %}"#, &policy);
        assert!(!r.is_secure);
    }

    #[test]
    fn test_capability_toggle() {
        let src = r#"{{ fs.read("/etc/passwd") }}"#;
        let r = analyze(src, &SecurityPolicy::default());
        assert_eq!(r.risk_level, RiskLevel::Critical);
        let open = SecurityPolicy {
            allow_file_access: true,
            ..SecurityPolicy::default()
        };
        assert!(analyze(src, &open).is_secure);
    }

    #[test]
    fn test_deny_wins_and_conflict_is_reported() {
        let policy = SecurityPolicy {
            allowed_functions: vec!["util.fmt".into()],
            denied_namespaces: vec!["util".into()],
            ..SecurityPolicy::default()
        };
        let r = analyze("{{ util.fmt(x) }}", &policy);
        assert!(!r.is_secure);
        let levels: Vec<_> = r.threats.iter().map(|t| t.level).collect();
        assert!(levels.contains(&RiskLevel::High));
        assert!(levels.contains(&RiskLevel::Medium));
    }

    #[test]
    fn test_allow_list_rejects_unlisted_function() {
        let policy = SecurityPolicy {
            allowed_functions: vec!["upper".into()],
            ..SecurityPolicy::default()
        };
        assert!(analyze("{{ upper(x) }}", &policy).is_secure);
        assert!(!analyze("{{ lower(x) }}", &policy).is_secure);
    }

    #[test]
    fn test_denied_type() {
        let policy = SecurityPolicy {
            denied_types: vec!["Process".into()],
            ..SecurityPolicy::default()
        };
        assert!(!analyze("{{ Process.start(cmd) }}", &policy).is_secure);
    }

    #[test]
    fn test_threshold_controls_is_secure() {
        let policy = SecurityPolicy {
            threshold: RiskLevel::Low,
            ..SecurityPolicy::default()
        };
        assert!(!analyze("{% for x in xs %}{% end %}", &policy).is_secure);
    }

    #[test]
    fn test_dynamic_expression_hook() {
        let r = check_dynamic_expression("http.get(url)", &SecurityPolicy::default()).unwrap();
        assert!(!r.is_secure);
        assert!(check_dynamic_expression("user.name | upper", &SecurityPolicy::default())
            .unwrap()
            .is_secure);
    }
}
