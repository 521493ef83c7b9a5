//! Inheritance Manager - layout resolution and block merging
//!
//! The whole `extends` chain is loaded and checked for repeats before
//! anything is merged. Merging then runs root to leaf: each level replaces
//! the blocks it defines and leaves the rest of its parent untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::ast::{walk_nodes, Ast, Node, RootNode};
use crate::hashing::normalize_source;
use crate::parser::{parse, SyntaxError};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MergeError {
    #[error("inheritance cycle: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("layout `{name}` not found (extended by `{template}`)")]
    LayoutNotFound { name: String, template: String },

    #[error("block `{block}` is final and cannot be overridden by `{template}`")]
    FinalBlockOverridden { block: String, template: String },

    #[error("required block `{block}` declared in `{layout}` is not supplied")]
    RequiredBlockMissing { block: String, layout: String },

    #[error("block `{block}` appears more than once after merging `{template}`")]
    DuplicateBlock { block: String, template: String },

    #[error("`extends` in `{template}` must be a single top-level directive")]
    MisplacedExtends { template: String },

    #[error("layout `{name}` failed to parse: {error}")]
    LayoutSyntax { name: String, error: SyntaxError },

    #[error("layout provider `{provider}` failed: {message}")]
    Provider { provider: String, message: String },
}

/// Source of layout text by name.
#[async_trait]
pub trait LayoutProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn load(&self, name: &str) -> Result<Option<String>, MergeError>;
}

pub struct MemoryLayoutProvider {
    layouts: RwLock<HashMap<String, String>>,
}

impl MemoryLayoutProvider {
    pub fn new() -> Self {
        Self {
            layouts: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, source: impl Into<String>) {
        self.layouts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), source.into());
    }
}

impl Default for MemoryLayoutProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LayoutProvider for MemoryLayoutProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, name: &str) -> Result<Option<String>, MergeError> {
        Ok(self
            .layouts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }
}

/// Relative template path for `name`, or `None` if it escapes the root.
pub(crate) fn template_path(root: &Path, name: &str, extension: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    let mut path = root.join(relative);
    if path.extension().map_or(true, |e| e != extension) {
        let file = format!("{}.{}", name.rsplit('/').next().unwrap_or(name), extension);
        path.set_file_name(file);
    }
    Some(path)
}

/// Layouts stored as `<root>/<name>.<extension>`.
pub struct FileSystemLayoutProvider {
    root: PathBuf,
    extension: String,
}

impl FileSystemLayoutProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "tpl".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

#[async_trait]
impl LayoutProvider for FileSystemLayoutProvider {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn load(&self, name: &str) -> Result<Option<String>, MergeError> {
        let path = match template_path(&self.root, name, &self.extension) {
            Some(p) => p,
            None => return Ok(None),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MergeError::Provider {
                provider: self.name().to_string(),
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub name: String,
    pub overridable: bool,
    pub required: bool,
    /// Template whose content the block renders after merging.
    pub defined_in: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritanceInfo {
    pub template: String,
    pub parent: Option<String>,
    /// Root layout first, the template itself last.
    pub chain: Vec<String>,
    pub blocks: BTreeMap<String, BlockInfo>,
}

#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub ast: Ast,
    pub info: InheritanceInfo,
}

pub struct InheritanceManager {
    layouts: RwLock<HashMap<String, Arc<Ast>>>,
    providers: RwLock<Vec<Arc<dyn LayoutProvider>>>,
}

impl InheritanceManager {
    pub fn new() -> Self {
        Self {
            layouts: RwLock::new(HashMap::new()),
            providers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_layout(&self, name: impl Into<String>, source: &str) -> Result<(), SyntaxError> {
        let ast = parse(&normalize_source(source))?;
        self.layouts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(ast));
        Ok(())
    }

    pub fn add_provider(&self, provider: Arc<dyn LayoutProvider>) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    /// Drop a cached layout so the next resolve reloads it.
    pub fn invalidate(&self, name: &str) -> bool {
        self.layouts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    async fn layout(&self, name: &str, requested_by: &str) -> Result<Arc<Ast>, MergeError> {
        if let Some(ast) = self.layouts.read().unwrap_or_else(PoisonError::into_inner).get(name) {
            return Ok(ast.clone());
        }
        let providers: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for provider in providers {
            if let Some(source) = provider.load(name).await? {
                let ast = parse(&normalize_source(&source)).map_err(|error| MergeError::LayoutSyntax {
                    name: name.to_string(),
                    error,
                })?;
                debug!(layout = name, provider = provider.name(), "loaded layout");
                let ast = Arc::new(ast);
                self.layouts
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), ast.clone());
                return Ok(ast);
            }
        }
        Err(MergeError::LayoutNotFound {
            name: name.to_string(),
            template: requested_by.to_string(),
        })
    }

    /// Load the chain, leaf first.
    async fn chain(&self, name: &str, ast: &Ast) -> Result<Vec<(String, Arc<Ast>)>, MergeError> {
        let mut chain = vec![(name.to_string(), Arc::new(ast.clone()))];
        loop {
            let (child, current) = match chain.last() {
                Some(last) => (last.0.clone(), last.1.clone()),
                None => break,
            };
            check_extends(&child, &current)?;
            let parent = match current.extends() {
                Some(p) => p.to_string(),
                None => break,
            };
            if chain.iter().any(|(n, _)| *n == parent) {
                let mut names: Vec<String> = chain.iter().map(|(n, _)| n.clone()).collect();
                names.push(parent);
                return Err(MergeError::Cycle { chain: names });
            }
            let layout = self.layout(&parent, &child).await?;
            chain.push((parent, layout));
        }
        Ok(chain)
    }

    pub async fn inspect(&self, name: &str, ast: &Ast) -> Result<InheritanceInfo, MergeError> {
        Ok(self.resolve(name, ast).await?.info)
    }

    /// Merge `ast` with its layout chain into one standalone AST.
    pub async fn resolve(&self, name: &str, ast: &Ast) -> Result<ResolvedTemplate, MergeError> {
        let mut chain = self.chain(name, ast).await?;
        chain.reverse();
        let names: Vec<String> = chain.iter().map(|(n, _)| n.clone()).collect();

        let (root_name, root) = &chain[0];
        let mut merged = root.nodes().to_vec();
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        walk_nodes(&merged, &mut |node, _| {
            if let Node::Block { name, .. } = node {
                owners.insert(name.clone(), root_name.clone());
            }
        });

        for (child_name, child) in &chain[1..] {
            let overrides = block_definitions(child);
            let mut used = BTreeSet::new();
            merged = overlay(merged, &overrides, child_name, &mut used)?;
            for block in &used {
                owners.insert(block.clone(), child_name.clone());
            }
            for unused in overrides.keys().filter(|b| !used.contains(*b)) {
                debug!(block = %unused, template = %child_name, "block has no slot in the layout");
            }
            check_unique_blocks(&merged, child_name)?;
        }

        if chain.len() > 1 {
            let mut missing = None;
            walk_nodes(&merged, &mut |node, _| {
                if let Node::Block { name, required: true, .. } = node {
                    missing.get_or_insert_with(|| name.clone());
                }
            });
            if let Some(block) = missing {
                let layout = owners.get(&block).cloned().unwrap_or_else(|| root_name.clone());
                return Err(MergeError::RequiredBlockMissing { block, layout });
            }
        }
        let merged = strip_super(merged);

        let mut blocks = BTreeMap::new();
        walk_nodes(&merged, &mut |node, _| {
            if let Node::Block {
                name,
                overridable,
                required,
                ..
            } = node
            {
                blocks.insert(
                    name.clone(),
                    BlockInfo {
                        name: name.clone(),
                        overridable: *overridable,
                        required: *required,
                        defined_in: owners.get(name).cloned().unwrap_or_else(|| root_name.clone()),
                    },
                );
            }
        });

        let mut variables = BTreeSet::new();
        for (_, level) in &chain {
            variables.extend(level.variables.iter().cloned());
        }
        let mut partials = BTreeSet::new();
        walk_nodes(&merged, &mut |node, _| {
            if let Node::Partial { name, .. } = node {
                partials.insert(name.clone());
            }
        });

        let info = InheritanceInfo {
            template: name.to_string(),
            parent: ast.extends().map(str::to_string),
            chain: names,
            blocks,
        };
        if info.chain.len() > 1 {
            debug!(template = name, chain = ?info.chain, "merged inheritance chain");
        }
        Ok(ResolvedTemplate {
            ast: Ast {
                root: RootNode { children: merged },
                variables,
                partials,
            },
            info,
        })
    }
}

impl Default for InheritanceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn check_extends(name: &str, ast: &Ast) -> Result<(), MergeError> {
    let mut count = 0;
    walk_nodes(ast.nodes(), &mut |node, depth| {
        if matches!(node, Node::Extends { .. }) {
            count += if depth == 0 { 1 } else { 2 };
        }
    });
    if count > 1 {
        return Err(MergeError::MisplacedExtends {
            template: name.to_string(),
        });
    }
    Ok(())
}

/// Every block a template defines, nested ones included.
fn block_definitions(ast: &Ast) -> BTreeMap<String, Node> {
    let mut blocks = BTreeMap::new();
    walk_nodes(ast.nodes(), &mut |node, _| {
        if let Node::Block { name, .. } = node {
            blocks.entry(name.clone()).or_insert_with(|| node.clone());
        }
    });
    blocks
}

fn overlay(
    nodes: Vec<Node>,
    overrides: &BTreeMap<String, Node>,
    child: &str,
    used: &mut BTreeSet<String>,
) -> Result<Vec<Node>, MergeError> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Block {
                name,
                content,
                overridable,
                required,
                default_content,
                span,
            } => match overrides.get(&name) {
                Some(Node::Block {
                    content: replacement,
                    overridable: child_overridable,
                    ..
                }) => {
                    if !overridable {
                        return Err(MergeError::FinalBlockOverridden {
                            block: name,
                            template: child.to_string(),
                        });
                    }
                    used.insert(name.clone());
                    out.push(Node::Block {
                        name,
                        content: expand_super(replacement.clone(), &content),
                        overridable: *child_overridable,
                        required: false,
                        default_content,
                        span,
                    });
                }
                _ => {
                    let content = overlay(content, overrides, child, used)?;
                    out.push(Node::Block {
                        name,
                        content,
                        overridable,
                        required,
                        default_content,
                        span,
                    });
                }
            },
            other => {
                let mut failed = None;
                let node = other.map_children(&mut |c| match overlay(c, overrides, child, used) {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        failed.get_or_insert(e);
                        Vec::new()
                    }
                });
                if let Some(e) = failed {
                    return Err(e);
                }
                out.push(node);
            }
        }
    }
    Ok(out)
}

/// Replace `super` with the overridden content. Nested blocks keep theirs.
fn expand_super(nodes: Vec<Node>, parent: &[Node]) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Super { .. } => out.extend(parent.iter().cloned()),
            block @ Node::Block { .. } => out.push(block),
            other => out.push(other.map_children(&mut |c| expand_super(c, parent))),
        }
    }
    out
}

/// `super` with nothing above it expands to nothing.
fn strip_super(nodes: Vec<Node>) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|n| !matches!(n, Node::Super { .. }))
        .map(|n| n.map_children(&mut strip_super))
        .collect()
}

fn check_unique_blocks(nodes: &[Node], template: &str) -> Result<(), MergeError> {
    let mut seen = BTreeSet::new();
    let mut duplicate = None;
    walk_nodes(nodes, &mut |node, _| {
        if let Node::Block { name, .. } = node {
            if !seen.insert(name.clone()) {
                duplicate.get_or_insert_with(|| name.clone());
            }
        }
    });
    match duplicate {
        Some(block) => Err(MergeError::DuplicateBlock {
            block,
            template: template.to_string(),
        }),
        None => Ok(()),
    }
}
