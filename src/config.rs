//! Engine configuration, loaded from camelCase JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::compiler::CompilerOptions;
use crate::optimizer::OptimizationOptions;
use crate::render::RenderOptions;
use crate::security::SecurityPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub security: SecurityPolicy,
    #[serde(default)]
    pub optimizer: OptimizationOptions,
    #[serde(default)]
    pub compiler: CompilerOptions,
    #[serde(default)]
    pub render: RenderOptions,
    /// Searched in order; earlier directories take precedence.
    #[serde(default)]
    pub partial_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub layout_dirs: Vec<PathBuf>,
    /// File extension for layouts and partials on disk.
    #[serde(default = "default_extension")]
    pub template_extension: String,
}

fn default_extension() -> String { "tpl".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            security: SecurityPolicy::default(),
            optimizer: OptimizationOptions::default(),
            compiler: CompilerOptions::default(),
            render: RenderOptions::default(),
            partial_dirs: vec![],
            layout_dirs: vec![],
            template_extension: default_extension(),
        }
    }
}

impl EngineConfig {
    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}
