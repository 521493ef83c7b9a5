//! Partial Registry - named fragments across prioritized providers
//!
//! Providers are asked in descending priority; the first one that supports
//! the name and returns a source wins. A resolved partial is cached as one
//! entry holding its source, AST and compiled program, so invalidating the
//! entry drops all three together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::ast::Ast;
use crate::compiler::Program;
use crate::hashing::{content_hash, normalize_source};
use crate::inheritance::template_path;
use crate::parser::{parse, SyntaxError};

#[derive(Debug, Error)]
pub enum PartialError {
    #[error("partial `{0}` not found")]
    NotFound(String),

    #[error("partial `{name}` failed to parse: {error}")]
    Syntax { name: String, error: SyntaxError },

    #[error("partial provider `{provider}` failed: {message}")]
    Provider { provider: String, message: String },

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSource {
    pub name: String,
    pub text: String,
    pub path: Option<PathBuf>,
    pub modified: Option<DateTime<Utc>>,
}

impl PartialSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            path: None,
            modified: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialInfo {
    pub name: String,
    pub path: Option<PathBuf>,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub content_hash: String,
    /// Partials this partial includes.
    pub dependencies: BTreeSet<String>,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialChange {
    pub name: String,
    pub kind: ChangeKind,
}

#[async_trait]
pub trait PartialProvider: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;

    fn supports(&self, _name: &str) -> bool {
        true
    }

    async fn load(&self, name: &str) -> Result<Option<PartialSource>, PartialError>;
    async fn list(&self) -> Result<Vec<String>, PartialError>;
}

pub struct MemoryPartialProvider {
    name: String,
    priority: i32,
    partials: RwLock<HashMap<String, String>>,
}

impl MemoryPartialProvider {
    pub fn new(priority: i32) -> Self {
        Self {
            name: "memory".to_string(),
            priority,
            partials: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn insert(&self, name: impl Into<String>, text: impl Into<String>) {
        self.partials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), text.into());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.partials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }
}

#[async_trait]
impl PartialProvider for MemoryPartialProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn load(&self, name: &str) -> Result<Option<PartialSource>, PartialError> {
        let partials = self.partials.read().unwrap_or_else(PoisonError::into_inner);
        Ok(partials.get(name).map(|text| PartialSource::new(name, text.clone())))
    }

    async fn list(&self) -> Result<Vec<String>, PartialError> {
        let partials = self.partials.read().unwrap_or_else(PoisonError::into_inner);
        Ok(partials.keys().cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    size: u64,
}

/// Partials stored as `<root>/<name>.<extension>`; names may contain `/`.
pub struct FileSystemPartialProvider {
    root: PathBuf,
    extension: String,
    priority: i32,
    seen: Mutex<BTreeMap<String, FileStamp>>,
}

impl FileSystemPartialProvider {
    pub fn new(root: impl Into<PathBuf>, priority: i32) -> Self {
        Self {
            root: root.into(),
            extension: "tpl".to_string(),
            priority,
            seen: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn name_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let parts: Vec<&str> = relative.iter().filter_map(|c| c.to_str()).collect();
        Some(parts.join("/"))
    }

    fn files(&self) -> Result<Vec<(String, PathBuf)>, PartialError> {
        let pattern = self.root.join("**").join(format!("*.{}", self.extension));
        let mut files = vec![];
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable partial path");
                    continue;
                }
            };
            if let Some(name) = self.name_of(&path) {
                files.push((name, path));
            }
        }
        Ok(files)
    }

    /// Compare file timestamps against the previous scan. The first scan
    /// reports every file as created. A deletion and a creation with the
    /// same timestamp and size are reported as one rename.
    pub async fn scan_changes(&self) -> Result<Vec<PartialChange>, PartialError> {
        let mut current = BTreeMap::new();
        for (name, path) in self.files()? {
            let meta = tokio::fs::metadata(&path).await?;
            current.insert(
                name,
                FileStamp {
                    modified: meta.modified()?,
                    size: meta.len(),
                },
            );
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut created: Vec<String> = vec![];
        let mut changes = vec![];
        for (name, stamp) in &current {
            match seen.get(name) {
                None => created.push(name.clone()),
                Some(old) if old != stamp => changes.push(PartialChange {
                    name: name.clone(),
                    kind: ChangeKind::Modified,
                }),
                Some(_) => {}
            }
        }
        for (old_name, old_stamp) in seen.iter().filter(|(n, _)| !current.contains_key(*n)) {
            let renamed = created.iter().position(|n| current.get(n) == Some(old_stamp));
            match renamed {
                Some(i) => changes.push(PartialChange {
                    name: created.remove(i),
                    kind: ChangeKind::Renamed { from: old_name.clone() },
                }),
                None => changes.push(PartialChange {
                    name: old_name.clone(),
                    kind: ChangeKind::Deleted,
                }),
            }
        }
        changes.extend(created.into_iter().map(|name| PartialChange {
            name,
            kind: ChangeKind::Created,
        }));
        *seen = current;
        Ok(changes)
    }
}

#[async_trait]
impl PartialProvider for FileSystemPartialProvider {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supports(&self, name: &str) -> bool {
        template_path(&self.root, name, &self.extension).is_some()
    }

    async fn load(&self, name: &str) -> Result<Option<PartialSource>, PartialError> {
        let path = match template_path(&self.root, name, &self.extension) {
            Some(p) => p,
            None => return Ok(None),
        };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PartialError::Provider {
                    provider: self.name().to_string(),
                    message: format!("{}: {}", path.display(), e),
                })
            }
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(Some(PartialSource {
            name: name.to_string(),
            text,
            path: Some(path),
            modified,
        }))
    }

    async fn list(&self) -> Result<Vec<String>, PartialError> {
        Ok(self.files()?.into_iter().map(|(name, _)| name).collect())
    }
}

/// A resolved partial. The compiled program is filled in on first use and
/// lives and dies with the entry.
#[derive(Debug)]
pub struct PartialEntry {
    pub source: PartialSource,
    pub info: PartialInfo,
    pub ast: Arc<Ast>,
    pub(crate) program: OnceCell<Arc<Program>>,
}

impl PartialEntry {
    pub fn compiled(&self) -> Option<Arc<Program>> {
        self.program.get().cloned()
    }
}

type EntryCell = Arc<OnceCell<Arc<PartialEntry>>>;

/// Priority used for partials registered directly on the registry.
pub const REGISTERED_PRIORITY: i32 = i32::MAX;

pub struct PartialRegistry {
    providers: RwLock<Vec<Arc<dyn PartialProvider>>>,
    registered: Arc<MemoryPartialProvider>,
    cache: Mutex<HashMap<String, EntryCell>>,
}

impl PartialRegistry {
    pub fn new() -> Self {
        let registered = Arc::new(MemoryPartialProvider::new(REGISTERED_PRIORITY).with_name("registered"));
        Self {
            providers: RwLock::new(vec![registered.clone() as Arc<dyn PartialProvider>]),
            registered,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Providers stay sorted by descending priority; ties keep insertion order.
    pub fn add_provider(&self, provider: Arc<dyn PartialProvider>) {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        providers.push(provider);
        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        drop(providers);
        self.clear();
    }

    /// Register a partial ahead of every provider.
    pub fn register_partial(&self, name: impl Into<String>, source: &str) -> Result<(), SyntaxError> {
        let name = name.into();
        let source = normalize_source(source);
        parse(&source)?;
        self.registered.insert(name.clone(), source);
        self.invalidate(&name);
        Ok(())
    }

    /// Remove a partial registered with `register_partial`. Provider
    /// partials are untouched; returns whether one was registered.
    pub fn unregister_partial(&self, name: &str) -> bool {
        let removed = self.registered.remove(name);
        self.invalidate(name);
        removed
    }

    pub async fn resolve(&self, name: &str) -> Result<Arc<PartialEntry>, PartialError> {
        let cell = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone();
        if cell.initialized() {
            debug!(partial = name, "partial cache hit");
        }
        cell.get_or_try_init(|| self.load(name)).await.cloned()
    }

    async fn load(&self, name: &str) -> Result<Arc<PartialEntry>, PartialError> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for provider in providers.iter().filter(|p| p.supports(name)) {
            let mut source = match provider.load(name).await? {
                Some(s) => s,
                None => continue,
            };
            source.text = normalize_source(&source.text);
            let ast = parse(&source.text).map_err(|error| PartialError::Syntax {
                name: name.to_string(),
                error,
            })?;
            let info = PartialInfo {
                name: name.to_string(),
                path: source.path.clone(),
                modified: source.modified,
                size: source.text.len() as u64,
                content_hash: content_hash(&source.text),
                dependencies: ast.partials.clone(),
                provider: provider.name().to_string(),
            };
            debug!(partial = name, provider = provider.name(), "resolved partial");
            return Ok(Arc::new(PartialEntry {
                source,
                info,
                ast: Arc::new(ast),
                program: OnceCell::new(),
            }));
        }
        Err(PartialError::NotFound(name.to_string()))
    }

    pub async fn info(&self, name: &str) -> Result<PartialInfo, PartialError> {
        Ok(self.resolve(name).await?.info.clone())
    }

    /// Every name any provider can list, sorted.
    pub async fn list(&self) -> Result<Vec<String>, PartialError> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut names = BTreeSet::new();
        for provider in providers {
            names.extend(provider.list().await?);
        }
        Ok(names.into_iter().collect())
    }

    pub fn invalidate(&self, name: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Apply a provider change notification. The changed names and every
    /// cached partial that includes them, directly or not, are dropped
    /// under one lock. Returns the changed names plus the dropped dependents.
    pub fn notify(&self, change: &PartialChange) -> BTreeSet<String> {
        let mut affected = BTreeSet::from([change.name.clone()]);
        if let ChangeKind::Renamed { from } = &change.kind {
            affected.insert(from.clone());
        }

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let dependents: Vec<String> = cache
                .iter()
                .filter(|(name, _)| !affected.contains(*name))
                .filter(|(_, cell)| {
                    cell.get()
                        .map_or(false, |e| e.info.dependencies.iter().any(|d| affected.contains(d)))
                })
                .map(|(name, _)| name.clone())
                .collect();
            if dependents.is_empty() {
                break;
            }
            affected.extend(dependents);
        }
        for name in &affected {
            cache.remove(name);
        }
        drop(cache);

        warn!(partial = %change.name, kind = ?change.kind, affected = affected.len(), "partial invalidated");
        affected
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn cached(&self) -> Vec<String> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = cache
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for PartialRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_order() {
        let registry = PartialRegistry::new();
        let low = MemoryPartialProvider::new(5).with_name("low");
        low.insert("x", "low");
        let high = MemoryPartialProvider::new(10).with_name("high");
        high.insert("x", "high");
        registry.add_provider(Arc::new(low));
        registry.add_provider(Arc::new(high));
        let entry = registry.resolve("x").await.unwrap();
        assert_eq!(entry.source.text, "high");
        assert_eq!(entry.info.provider, "high");
    }

    #[tokio::test]
    async fn test_cache_until_notified() {
        let registry = PartialRegistry::new();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("card", "v1");
        registry.add_provider(provider.clone());

        let first = registry.resolve("card").await.unwrap();
        provider.insert("card", "v2");
        let again = registry.resolve("card").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let dropped = registry.notify(&PartialChange {
            name: "card".into(),
            kind: ChangeKind::Modified,
        });
        assert!(dropped.contains("card"));
        assert_eq!(registry.resolve("card").await.unwrap().source.text, "v2");
    }

    #[tokio::test]
    async fn test_notify_drops_dependents() {
        let registry = PartialRegistry::new();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("page", r#"<{% include "row" %}>"#);
        provider.insert("row", r#"{% include "cell" %}"#);
        provider.insert("cell", "c");
        provider.insert("other", "o");
        registry.add_provider(provider);
        for name in ["page", "row", "cell", "other"] {
            registry.resolve(name).await.unwrap();
        }

        let dropped = registry.notify(&PartialChange {
            name: "cell".into(),
            kind: ChangeKind::Modified,
        });
        let expected: BTreeSet<String> = ["cell", "page", "row"].iter().map(|s| s.to_string()).collect();
        assert_eq!(dropped, expected);
        assert_eq!(registry.cached(), vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_partials() {
        let registry = PartialRegistry::new();
        assert!(matches!(registry.resolve("nope").await, Err(PartialError::NotFound(_))));
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("bad", "{{ oops");
        registry.add_provider(provider);
        assert!(matches!(registry.resolve("bad").await, Err(PartialError::Syntax { .. })));
    }

    #[tokio::test]
    async fn test_registered_partial_wins() {
        let registry = PartialRegistry::new();
        let provider = Arc::new(MemoryPartialProvider::new(100));
        provider.insert("nav", "provided");
        registry.add_provider(provider);
        registry.register_partial("nav", "registered").unwrap();
        assert_eq!(registry.resolve("nav").await.unwrap().source.text, "registered");
        assert_eq!(registry.list().await.unwrap(), vec!["nav".to_string()]);
    }

    #[tokio::test]
    async fn test_provider_delete_keeps_registered_partial() {
        let registry = PartialRegistry::new();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("nav", "provided");
        registry.add_provider(provider.clone());
        registry.register_partial("nav", "registered").unwrap();

        provider.remove("nav");
        registry.notify(&PartialChange {
            name: "nav".into(),
            kind: ChangeKind::Deleted,
        });
        assert_eq!(registry.resolve("nav").await.unwrap().source.text, "registered");

        assert!(registry.unregister_partial("nav"));
        assert!(matches!(registry.resolve("nav").await, Err(PartialError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_provider_partials_are_normalized() {
        let registry = PartialRegistry::new();
        let provider = Arc::new(MemoryPartialProvider::new(1));
        provider.insert("crlf", "a\r\nb");
        registry.add_provider(provider);
        registry.register_partial("lf", "a\nb").unwrap();
        let crlf = registry.resolve("crlf").await.unwrap();
        let lf = registry.resolve("lf").await.unwrap();
        assert_eq!(crlf.source.text, "a\nb");
        assert_eq!(crlf.ast, lf.ast);
        assert_eq!(crlf.info.content_hash, lf.info.content_hash);
    }

    #[tokio::test]
    async fn test_filesystem_provider_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("cards")).unwrap();
        std::fs::write(dir.path().join("cards/user.tpl"), "{{ user.name }}").unwrap();
        std::fs::write(dir.path().join("footer.tpl"), "bye").unwrap();

        let provider = FileSystemPartialProvider::new(dir.path(), 1);
        let mut names = provider.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["cards/user".to_string(), "footer".to_string()]);

        let source = provider.load("cards/user").await.unwrap().unwrap();
        assert_eq!(source.text, "{{ user.name }}");
        assert!(source.modified.is_some());

        let first = provider.scan_changes().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|c| c.kind == ChangeKind::Created));

        std::fs::remove_file(dir.path().join("footer.tpl")).unwrap();
        let second = provider.scan_changes().await.unwrap();
        assert_eq!(
            second,
            vec![PartialChange {
                name: "footer".into(),
                kind: ChangeKind::Deleted
            }]
        );
    }
}
