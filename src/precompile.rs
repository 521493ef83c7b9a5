//! Precompiled Artifacts - persistable compiled templates
//!
//! An artifact wraps one encoded payload with the metadata needed to check
//! it on the way back in: engine version, format and a checksum over both.

use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::ast::Ast;
use crate::compiler::{lower, CompileError, CompileTimings, CompiledTemplate, Diagnostics, Program};
use crate::hashing::compute_artifact_checksum;
use crate::optimizer::OptimizationStats;
use crate::render::RenderOptions;
use crate::security::RuntimeLimits;
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("artifact JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("artifact built by engine {artifact} cannot be loaded by engine {engine}")]
    IncompatibleVersion { artifact: String, engine: String },

    #[error("invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("{0:?} artifacts cannot be loaded")]
    NotLoadable(ArtifactFormat),

    #[error("template `{0}` has no AST to emit source from")]
    SourceUnavailable(String),

    #[error("artifact payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Template text regenerated from the optimized AST.
    Source,
    /// bincode-encoded optimized AST.
    Binary,
    /// bincode-encoded instruction program.
    #[default]
    Bytecode,
    /// Human-readable instruction listing.
    Assembly,
}

impl ArtifactFormat {
    pub fn is_loadable(self) -> bool {
        matches!(self, ArtifactFormat::Binary | ArtifactFormat::Bytecode)
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Source => "tpl",
            ArtifactFormat::Binary => "ast.json",
            ArtifactFormat::Bytecode => "tbc.json",
            ArtifactFormat::Assembly => "asm.json",
        }
    }
}

impl std::str::FromStr for ArtifactFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "source" => Ok(ArtifactFormat::Source),
            "binary" => Ok(ArtifactFormat::Binary),
            "bytecode" => Ok(ArtifactFormat::Bytecode),
            "assembly" => Ok(ArtifactFormat::Assembly),
            other => Err(format!("unknown artifact format `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecompileOptions {
    #[serde(default)]
    pub format: ArtifactFormat,
    /// Emit an instruction to source position map. Needs a compiler built
    /// with `debug_info`.
    #[serde(default)]
    pub source_map: bool,
    #[serde(default)]
    pub debug_info: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStats {
    pub original_size: usize,
    pub compiled_size: usize,
    pub dependency_count: usize,
    pub instruction_count: usize,
    pub cache_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapEntry {
    pub instruction: usize,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    pub entries: Vec<SourceMapEntry>,
}

impl SourceMap {
    fn from_program(program: &Program) -> Self {
        let entries = (0..program.len())
            .filter_map(|pc| {
                program.span_of(pc).map(|span| SourceMapEntry {
                    instruction: pc,
                    line: span.line,
                    column: span.column,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, instruction: usize) -> Option<&SourceMapEntry> {
        self.entries.iter().find(|e| e.instruction == instruction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub template: String,
    pub variables: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub timings: CompileTimings,
    pub optimization: Option<OptimizationStats>,
}

/// Everything a payload checksum covers besides the payload itself.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumMetadata<'a> {
    name: &'a str,
    engine_version: &'a str,
    format: ArtifactFormat,
    stats: &'a ArtifactStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecompiledArtifact {
    pub id: Uuid,
    pub name: String,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub format: ArtifactFormat,
    #[serde(with = "base64_bytes")]
    pub compiled_data: Vec<u8>,
    pub checksum: String,
    #[serde(default)]
    pub source_map: Option<SourceMap>,
    #[serde(default)]
    pub debug_info: Option<DebugInfo>,
    pub stats: ArtifactStats,
}

impl PrecompiledArtifact {
    fn expected_checksum(&self) -> Result<String, ArtifactError> {
        let metadata = ChecksumMetadata {
            name: &self.name,
            engine_version: &self.engine_version,
            format: self.format,
            stats: &self.stats,
        };
        Ok(compute_artifact_checksum(&self.compiled_data, &metadata)?)
    }

    pub fn verify_checksum(&self) -> Result<(), ArtifactError> {
        let actual = self.expected_checksum()?;
        if actual != self.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Same major version, not newer than this engine.
    pub fn check_compatible(&self) -> Result<(), ArtifactError> {
        let req = semver::VersionReq::parse(&format!("^{}", self.engine_version))?;
        let engine = semver::Version::parse(ENGINE_VERSION)?;
        if !req.matches(&engine) {
            return Err(ArtifactError::IncompatibleVersion {
                artifact: self.engine_version.clone(),
                engine: ENGINE_VERSION.to_string(),
            });
        }
        Ok(())
    }

    /// The payload as text, for Source and Assembly artifacts.
    pub fn text(&self) -> Result<String, ArtifactError> {
        Ok(String::from_utf8(self.compiled_data.clone())?)
    }

    pub fn to_json(&self) -> Result<String, ArtifactError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ArtifactError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), ArtifactError> {
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }

    pub async fn read_from(path: &Path) -> Result<Self, ArtifactError> {
        Self::from_json(&tokio::fs::read_to_string(path).await?)
    }
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// The loadable payload. Bytecode carries the program, Binary the AST.
#[derive(Debug, Serialize, Deserialize)]
struct Bundle {
    program: Option<Program>,
    ast: Option<Ast>,
    partials: BTreeMap<String, Program>,
    variables: BTreeSet<String>,
    dependencies: BTreeSet<String>,
    limits: RuntimeLimits,
    render_options: RenderOptions,
}

pub struct Precompiler;

impl Precompiler {
    /// Package a compiled template. `original_size` is the byte length of
    /// the source it was compiled from.
    pub fn package(
        template: &CompiledTemplate,
        original_size: usize,
        options: &PrecompileOptions,
    ) -> Result<PrecompiledArtifact, ArtifactError> {
        let bundle = |program: Option<Program>, ast: Option<Ast>| Bundle {
            program,
            ast,
            partials: template
                .partials
                .iter()
                .map(|(name, p)| (name.clone(), p.as_ref().clone()))
                .collect(),
            variables: template.variables.clone(),
            dependencies: template.dependencies.clone(),
            limits: template.limits.clone(),
            render_options: template.render_options.clone(),
        };

        let compiled_data = match options.format {
            ArtifactFormat::Bytecode => {
                bincode::serialize(&bundle(Some(template.program.as_ref().clone()), None))?
            }
            ArtifactFormat::Binary => {
                let ast = template
                    .ast
                    .as_deref()
                    .ok_or_else(|| ArtifactError::SourceUnavailable(template.name.clone()))?;
                bincode::serialize(&bundle(None, Some(ast.clone())))?
            }
            ArtifactFormat::Source => template
                .ast
                .as_deref()
                .ok_or_else(|| ArtifactError::SourceUnavailable(template.name.clone()))?
                .to_source()
                .into_bytes(),
            ArtifactFormat::Assembly => {
                let mut listing = template.program.to_assembly();
                for (name, program) in &template.partials {
                    listing.push_str(&format!("\n; partial {:?}\n", name));
                    listing.push_str(&program.to_assembly());
                }
                listing.into_bytes()
            }
        };

        let stats = ArtifactStats {
            original_size,
            compiled_size: compiled_data.len(),
            dependency_count: template.dependencies.len(),
            instruction_count: template.program.len() + template.partials.values().map(|p| p.len()).sum::<usize>(),
            cache_key: template.cache_key.clone(),
        };
        let source_map = (options.source_map && !template.program.spans.is_empty())
            .then(|| SourceMap::from_program(&template.program));
        let debug_info = options.debug_info.then(|| DebugInfo {
            template: template.name.clone(),
            variables: template.variables.clone(),
            dependencies: template.dependencies.clone(),
            timings: template.diagnostics.timings.clone(),
            optimization: template.diagnostics.optimization.clone(),
        });

        let mut artifact = PrecompiledArtifact {
            id: Uuid::new_v4(),
            name: template.name.clone(),
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            format: options.format,
            compiled_data,
            checksum: String::new(),
            source_map,
            debug_info,
            stats,
        };
        artifact.checksum = artifact.expected_checksum()?;
        Ok(artifact)
    }

    /// Restore a renderable template from a Binary or Bytecode artifact.
    pub fn load(artifact: &PrecompiledArtifact) -> Result<CompiledTemplate, ArtifactError> {
        if !artifact.format.is_loadable() {
            return Err(ArtifactError::NotLoadable(artifact.format));
        }
        artifact.check_compatible()?;
        artifact.verify_checksum()?;

        let bundle: Bundle = bincode::deserialize(&artifact.compiled_data)?;
        let program = match (bundle.program, &bundle.ast) {
            (Some(program), _) => program,
            (None, Some(ast)) => lower(ast, false)?,
            (None, None) => return Err(CompileError::InvalidProgram("artifact has no program".into()).into()),
        };
        program.verify()?;
        let mut partials = BTreeMap::new();
        for (name, partial) in bundle.partials {
            partial.verify()?;
            partials.insert(name, Arc::new(partial));
        }

        Ok(CompiledTemplate {
            name: artifact.name.clone(),
            cache_key: artifact.stats.cache_key.clone(),
            program: Arc::new(program),
            partials,
            ast: bundle.ast.map(Arc::new),
            variables: bundle.variables,
            dependencies: bundle.dependencies,
            limits: bundle.limits,
            render_options: bundle.render_options,
            diagnostics: Diagnostics {
                timings: artifact
                    .debug_info
                    .as_ref()
                    .map(|d| d.timings.clone())
                    .unwrap_or_default(),
                ..Diagnostics::default()
            },
        })
    }
}

/// Shared flag checked between units of batch work.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: BTreeMap<String, PrecompiledArtifact>,
    /// Error text per failed item.
    pub failed: BTreeMap<String, String>,
    /// Items not attempted because the batch was cancelled.
    pub cancelled: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: BTreeMap<String, String>,
    pub cancelled: Vec<String>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            succeeded: self.succeeded.keys().cloned().collect(),
            failed: self.failed.clone(),
            cancelled: self.cancelled.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::PartialTable;
    use crate::context::TemplateContext;
    use crate::parser::parse;

    fn template(src: &str, debug_info: bool) -> CompiledTemplate {
        let ast = parse(src).unwrap();
        let mut partials = PartialTable::new();
        partials.insert("sig".into(), Arc::new(lower(&parse("-- {{ who }}").unwrap(), false).unwrap()));
        CompiledTemplate {
            name: "letter".into(),
            cache_key: "k".into(),
            program: Arc::new(lower(&ast, debug_info).unwrap()),
            partials,
            variables: ast.variables.clone(),
            ast: Some(Arc::new(ast)),
            dependencies: BTreeSet::from(["sig".to_string()]),
            limits: RuntimeLimits::default(),
            render_options: RenderOptions::default(),
            diagnostics: Diagnostics::default(),
        }
    }

    const SRC: &str = r#"Dear {{ who }},{% include "sig" %}"#;

    #[test]
    fn test_bytecode_artifact_loads_and_renders() {
        let artifact = Precompiler::package(&template(SRC, false), SRC.len(), &PrecompileOptions::default()).unwrap();
        assert_eq!(artifact.format, ArtifactFormat::Bytecode);
        assert_eq!(artifact.stats.dependency_count, 1);

        let json = artifact.to_json().unwrap();
        let restored = PrecompiledArtifact::from_json(&json).unwrap();
        let loaded = Precompiler::load(&restored).unwrap();
        assert!(loaded.ast.is_none());

        let mut ctx = TemplateContext::new();
        ctx.set("who", "Ada");
        assert_eq!(loaded.render_to_string(&mut ctx).unwrap(), "Dear Ada,-- Ada");
    }

    #[test]
    fn test_binary_artifact_keeps_ast() {
        let options = PrecompileOptions {
            format: ArtifactFormat::Binary,
            ..PrecompileOptions::default()
        };
        let artifact = Precompiler::package(&template(SRC, false), SRC.len(), &options).unwrap();
        let loaded = Precompiler::load(&artifact).unwrap();
        assert!(loaded.ast.is_some());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let mut artifact = Precompiler::package(&template(SRC, false), SRC.len(), &PrecompileOptions::default()).unwrap();
        artifact.compiled_data.push(0);
        assert!(matches!(Precompiler::load(&artifact), Err(ArtifactError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_newer_major_version_rejected() {
        let mut artifact = Precompiler::package(&template(SRC, false), SRC.len(), &PrecompileOptions::default()).unwrap();
        artifact.engine_version = "99.0.0".into();
        assert!(matches!(
            Precompiler::load(&artifact),
            Err(ArtifactError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_text_formats() {
        let source = PrecompileOptions {
            format: ArtifactFormat::Source,
            ..PrecompileOptions::default()
        };
        let artifact = Precompiler::package(&template(SRC, false), SRC.len(), &source).unwrap();
        assert!(artifact.text().unwrap().contains("{{ who }}"));
        assert!(matches!(
            Precompiler::load(&artifact),
            Err(ArtifactError::NotLoadable(ArtifactFormat::Source))
        ));

        let assembly = PrecompileOptions {
            format: ArtifactFormat::Assembly,
            source_map: true,
            debug_info: true,
        };
        let artifact = Precompiler::package(&template(SRC, true), SRC.len(), &assembly).unwrap();
        let listing = artifact.text().unwrap();
        assert!(listing.contains("INCLUDE \"sig\""));
        assert!(listing.contains("; partial \"sig\""));
        let map = artifact.source_map.unwrap();
        assert_eq!(map.lookup(1).map(|e| e.line), Some(1));
        assert_eq!(artifact.debug_info.unwrap().template, "letter");
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("Bytecode".parse::<ArtifactFormat>().unwrap(), ArtifactFormat::Bytecode);
        assert!("wasm".parse::<ArtifactFormat>().is_err());
    }
}
