//! Per-root cache construction.
//!
//! One `RootBuilder` exists per discovered build root (a module, a legacy
//! search-path project, or the runtime's builtin directory). It resolves the
//! loader pattern for its root, runs the loader, and publishes the results
//! into the shared unit store.
//!
//! # State machine
//! - `Uninitialized -> Initializing -> Ready`
//! - `Ready <-> Stale` as the dependency fingerprint drifts
//! - `Ready | Stale -> Rebuilding -> Ready`
//! - any failure -> `Failed`; a later rebuild retries from scratch
//!
//! Builds for one root are serialized by an async gate. The loader call runs
//! while holding only that gate, never a store lock, so queries keep reading
//! the previous snapshot until the swap.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;

use crate::config::{StalePolicy, WorkspaceConfig};
use crate::error::LayoutError;
use crate::file_state::DirectoryLoader;
use crate::loader::{
    LoadPattern, LoadRequest, ModuleInfo, ModuleMetadataSource, PackageLoader, SourceOverrides,
};
use crate::messages::Notifier;
use crate::perf::{Phase, TimingGuard};
use crate::store::UnitStore;
use crate::unit::{UnitId, UnitRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// A directory containing a module-defining file
    Module,
    /// A project under a legacy search path's `src` directory
    Legacy,
    /// The runtime's builtin units
    Builtin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Uninitialized,
    Initializing,
    Ready,
    Stale,
    Rebuilding,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildMode {
    /// Rebuild only if the dependency fingerprint or module path changed
    IfStale,
    /// Rebuild unconditionally
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The loader ran and this many units were published
    Rebuilt(usize),
    /// Nothing relevant changed; the loader was not called
    NotStale,
}

/// Resolved dependency directories of a module, for change detection only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyFingerprint {
    dirs: BTreeSet<PathBuf>,
}

impl DependencyFingerprint {
    /// Fingerprint over the non-main modules that resolved to a directory.
    pub fn from_modules(modules: &[ModuleInfo]) -> Self {
        let dirs = modules
            .iter()
            .filter(|m| !m.main)
            .filter_map(|m| m.dir.clone())
            .collect();
        Self { dirs }
    }

    pub fn dirs(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Directories present here but not in `old`.
    pub fn added_since<'a>(&'a self, old: &'a Self) -> impl Iterator<Item = &'a Path> + 'a {
        self.dirs.difference(&old.dirs).map(PathBuf::as_path)
    }

    /// Directories present in `old` but not here.
    pub fn removed_since<'a>(&'a self, old: &'a Self) -> impl Iterator<Item = &'a Path> + 'a {
        old.dirs.difference(&self.dirs).map(PathBuf::as_path)
    }

    /// Whether moving from `old` to `self` warrants a rebuild under `policy`.
    pub fn is_relevant_change(&self, old: &Self, policy: StalePolicy) -> bool {
        if self.added_since(old).next().is_some() {
            return true;
        }
        match policy {
            StalePolicy::AdditionsOnly => false,
            StalePolicy::AnyChange => self.removed_since(old).next().is_some(),
        }
    }
}

/// Module identity captured at the last successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub path: String,
    pub root: PathBuf,
    pub main: bool,
    pub fingerprint: DependencyFingerprint,
}

fn module_regex() -> &'static Regex {
    static MODULE_LINE: OnceLock<Regex> = OnceLock::new();
    MODULE_LINE.get_or_init(|| Regex::new(r#"(?m)^\s*module\s+"?([^\s"]+)"?\s*(?://.*)?$"#).unwrap())
}

/// Module path declared by the first `module` directive in `content`.
pub fn parse_module_path(content: &str) -> Option<String> {
    module_regex()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Import prefix of a legacy root: its path relative to `search_path/src`.
///
/// Returns `None` when `root` lies under no search path.
pub fn legacy_import_prefix(root: &Path, search_paths: &[PathBuf]) -> Option<String> {
    search_paths.iter().find_map(|sp| {
        let rel = root.strip_prefix(sp.join("src")).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    })
}

/// Every unit in `roots` plus everything reachable through imports, each
/// unit exactly once.
pub fn flatten_units(roots: &[Arc<UnitRecord>]) -> Vec<Arc<UnitRecord>> {
    let mut seen: HashSet<UnitId> = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<Arc<UnitRecord>> = roots.iter().rev().cloned().collect();

    while let Some(unit) = stack.pop() {
        if !seen.insert(unit.id.clone()) {
            continue;
        }
        for child in unit.imports.values().rev() {
            if !seen.contains(&child.id) {
                stack.push(child.clone());
            }
        }
        out.push(unit);
    }
    out
}

/// Shared collaborators handed to every builder of a session.
#[derive(Clone)]
pub struct BuilderContext {
    pub config: Arc<WorkspaceConfig>,
    pub store: Arc<UnitStore>,
    pub loader: Arc<dyn PackageLoader>,
    pub metadata: Arc<dyn ModuleMetadataSource>,
    pub overrides: SourceOverrides,
    pub notifier: Notifier,
}

/// Counters observed by tests and perf logging.
#[derive(Debug, Default)]
pub struct BuilderMetrics {
    cache_builds: AtomicU64,
    directory_loads: AtomicU64,
    rebuild_requests: AtomicU64,
}

impl BuilderMetrics {
    /// Number of `rebuild` calls, whether or not they reached the loader
    pub fn rebuild_requests(&self) -> u64 {
        self.rebuild_requests.load(Ordering::SeqCst)
    }

    pub fn cache_builds(&self) -> u64 {
        self.cache_builds.load(Ordering::SeqCst)
    }

    pub fn directory_loads(&self) -> u64 {
        self.directory_loads.load(Ordering::SeqCst)
    }
}

/// What `resolve` found out about the root before building.
struct Resolved {
    pattern: LoadPattern,
    prefix: Option<String>,
    descriptor: Option<ModuleDescriptor>,
}

pub struct RootBuilder {
    root: PathBuf,
    kind: RootKind,
    ctx: BuilderContext,
    state: Mutex<BuilderState>,
    descriptor: RwLock<Option<ModuleDescriptor>>,
    import_prefix: RwLock<Option<String>>,
    gate: tokio::sync::Mutex<()>,
    metrics: BuilderMetrics,
}

impl std::fmt::Debug for RootBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootBuilder")
            .field("root", &self.root)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RootBuilder {
    pub fn new(root: PathBuf, kind: RootKind, ctx: BuilderContext) -> Self {
        Self {
            root,
            kind,
            ctx,
            state: Mutex::new(BuilderState::Uninitialized),
            descriptor: RwLock::new(None),
            import_prefix: RwLock::new(None),
            gate: tokio::sync::Mutex::new(()),
            metrics: BuilderMetrics::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> RootKind {
        self.kind
    }

    pub fn state(&self) -> BuilderState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(BuilderState::Failed)
    }

    fn set_state(&self, next: BuilderState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                log::trace!("Builder {}: {:?} -> {:?}", self.root.display(), *state, next);
                *state = next;
            }
        }
    }

    pub fn descriptor(&self) -> Option<ModuleDescriptor> {
        self.descriptor.read().ok()?.clone()
    }

    /// Import path prefix of this root's own units, once known.
    pub fn import_prefix(&self) -> Option<String> {
        self.import_prefix
            .read()
            .ok()?
            .clone()
            .filter(|p| !p.is_empty())
    }

    pub fn metrics(&self) -> &BuilderMetrics {
        &self.metrics
    }

    /// True if `path` lies inside this builder's root directory.
    pub fn owns_path(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Depth of the root directory, used to order builders deepest first.
    pub fn depth(&self) -> usize {
        self.root.components().count()
    }

    /// Resolve the root's mode-specific identity and build its cache.
    pub async fn init(&self) -> Result<usize> {
        let _gate = self.gate.lock().await;
        self.build_locked(BuilderState::Initializing, "cache build").await
    }

    /// Reload the whole root with one loader call and publish the result.
    ///
    /// The root is re-resolved first, so a builder that never ran `init`
    /// passes through `Initializing` and ends `Ready` like any other build.
    pub async fn build_cache(&self) -> Result<usize> {
        let _gate = self.gate.lock().await;
        let entering = match self.state() {
            BuilderState::Uninitialized => BuilderState::Initializing,
            _ => BuilderState::Rebuilding,
        };
        self.build_locked(entering, "cache build").await
    }

    /// Whether the module's dependencies or module path changed since the
    /// last successful build. Always false outside module mode.
    pub async fn check_stale(&self) -> Result<bool> {
        if self.kind != RootKind::Module {
            return Ok(false);
        }
        let Some(old) = self.descriptor() else {
            return Ok(true);
        };

        let path = self.read_module_path().await?;
        let fingerprint = self.fetch_fingerprint().await?;

        let stale = path != old.path
            || fingerprint.is_relevant_change(&old.fingerprint, self.ctx.config.stale_policy);
        if stale {
            log::trace!(
                "Root {} is stale ({} dependency dirs added, module path {} -> {})",
                self.root.display(),
                fingerprint.added_since(&old.fingerprint).count(),
                old.path,
                path
            );
            if self.state() == BuilderState::Ready {
                self.set_state(BuilderState::Stale);
            }
        }
        Ok(stale)
    }

    /// Rebuild the root's cache.
    ///
    /// Entries are replaced by one batched put; units that disappeared from
    /// the root stay until a directory removal or restart drops them.
    pub async fn rebuild(&self, mode: RebuildMode) -> Result<RebuildOutcome> {
        let _gate = self.gate.lock().await;
        self.metrics.rebuild_requests.fetch_add(1, Ordering::SeqCst);

        let needs_resolve = matches!(
            self.state(),
            BuilderState::Uninitialized | BuilderState::Failed
        );
        if mode == RebuildMode::IfStale && !needs_resolve {
            match self.check_stale().await {
                Ok(false) => return Ok(RebuildOutcome::NotStale),
                Ok(true) => {}
                Err(e) => {
                    self.ctx.notifier.error(format!(
                        "rebuild failed for root {}: {e:#}",
                        self.root.display()
                    ));
                    return Err(e);
                }
            }
        }

        self.build_locked(BuilderState::Rebuilding, "rebuild")
            .await
            .map(RebuildOutcome::Rebuilt)
    }

    /// Move to `entering`, then resolve and build. Caller holds the gate.
    async fn build_locked(&self, entering: BuilderState, action: &str) -> Result<usize> {
        self.set_state(entering);
        match self.resolve_and_build().await {
            Ok(count) => Ok(count),
            Err(e) => {
                self.set_state(BuilderState::Failed);
                self.ctx.notifier.error(format!(
                    "{action} failed for root {}: {e:#}",
                    self.root.display()
                ));
                Err(e)
            }
        }
    }

    async fn resolve_and_build(&self) -> Result<usize> {
        let resolved = self.resolve().await?;
        let count = self.load_and_publish(&resolved.pattern).await?;

        if let Ok(mut prefix) = self.import_prefix.write() {
            *prefix = resolved.prefix;
        }
        if let Ok(mut descriptor) = self.descriptor.write() {
            *descriptor = resolved.descriptor;
        }
        self.set_state(BuilderState::Ready);
        Ok(count)
    }

    async fn resolve(&self) -> Result<Resolved> {
        match self.kind {
            RootKind::Module => {
                let path = self.read_module_path().await?;
                let fingerprint = match self.fetch_fingerprint().await {
                    Ok(fp) => fp,
                    Err(e) => {
                        log::warn!(
                            "Dependency metadata unavailable for {}: {e:#}",
                            self.root.display()
                        );
                        DependencyFingerprint::default()
                    }
                };
                Ok(Resolved {
                    pattern: LoadPattern::Recursive(self.root.clone()),
                    prefix: Some(path.clone()),
                    descriptor: Some(ModuleDescriptor {
                        path,
                        root: self.root.clone(),
                        main: true,
                        fingerprint,
                    }),
                })
            }
            RootKind::Legacy => {
                let prefix = legacy_import_prefix(&self.root, &self.ctx.config.search_paths)
                    .ok_or_else(|| LayoutError::OutsideKnownLayout(self.root.clone()))?;
                let pattern = if prefix.is_empty() {
                    LoadPattern::Recursive(self.root.clone())
                } else {
                    LoadPattern::ImportPrefix(prefix.clone())
                };
                Ok(Resolved {
                    pattern,
                    prefix: Some(prefix),
                    descriptor: None,
                })
            }
            RootKind::Builtin => Ok(Resolved {
                pattern: LoadPattern::Directory(self.root.clone()),
                prefix: None,
                descriptor: None,
            }),
        }
    }

    async fn read_module_path(&self) -> Result<String> {
        let file = self.root.join(&self.ctx.config.module_file_name);
        let content =
            std::fs::read_to_string(&file).map_err(|e| LayoutError::MalformedModuleFile {
                path: file.clone(),
                reason: e.to_string(),
            })?;
        parse_module_path(&content).ok_or_else(|| {
            LayoutError::MalformedModuleFile {
                path: file,
                reason: "missing module directive".to_string(),
            }
            .into()
        })
    }

    async fn fetch_fingerprint(&self) -> Result<DependencyFingerprint> {
        let modules = self.ctx.metadata.modules(&self.root).await?;
        Ok(DependencyFingerprint::from_modules(&modules))
    }

    /// Run the loader for `pattern` and publish the result in one swap.
    async fn load_and_publish(&self, pattern: &LoadPattern) -> Result<usize> {
        let _timing = TimingGuard::new(Phase::BuildCache, &pattern);
        let request = LoadRequest {
            root: self.root.clone(),
            pattern: pattern.clone(),
            overrides: self.ctx.overrides.snapshot(),
        };

        let loaded = self
            .ctx
            .loader
            .load(request)
            .await
            .map_err(|e| anyhow!("loading {} failed: {e:#}", pattern))?;
        self.metrics.cache_builds.fetch_add(1, Ordering::SeqCst);

        let units = flatten_units(&loaded);
        for unit in &units {
            self.ctx.notifier.log(format!("cached unit {}", unit.id));
        }
        let count = self.ctx.store.put_all(units);
        self.ctx
            .notifier
            .info(format!("cache built for root {}", self.root.display()));
        Ok(count)
    }
}

#[async_trait]
impl DirectoryLoader for RootBuilder {
    /// Load only `dir`. Units none of whose files carry an overlay are
    /// also published to the store.
    async fn load_directory(&self, dir: &Path) -> Result<Vec<Arc<UnitRecord>>> {
        let request = LoadRequest {
            root: self.root.clone(),
            pattern: LoadPattern::Directory(dir.to_path_buf()),
            overrides: self.ctx.overrides.snapshot(),
        };
        let units = self.ctx.loader.load(request).await?;
        self.metrics.directory_loads.fetch_add(1, Ordering::SeqCst);

        let publishable: Vec<Arc<UnitRecord>> = units
            .iter()
            .filter(|u| !u.files.iter().any(|f| self.ctx.overrides.contains(f)))
            .cloned()
            .collect();
        if !publishable.is_empty() {
            self.ctx.store.put_all(publishable);
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageLevel;
    use crate::test_utils::{StaticModules, ToyLoader};

    fn context(
        loader: Arc<ToyLoader>,
        metadata: Arc<StaticModules>,
    ) -> (BuilderContext, tokio::sync::mpsc::UnboundedReceiver<crate::messages::Notification>) {
        let (notifier, rx) = Notifier::channel();
        let ctx = BuilderContext {
            config: Arc::new(WorkspaceConfig::default()),
            store: Arc::new(UnitStore::default()),
            loader,
            metadata,
            overrides: SourceOverrides::new(),
            notifier,
        };
        (ctx, rx)
    }

    fn module_info(path: &str, dir: &Path) -> ModuleInfo {
        ModuleInfo {
            path: path.to_string(),
            main: false,
            dir: Some(dir.to_path_buf()),
            version: Some("v1.0.0".to_string()),
        }
    }

    #[test]
    fn test_parse_module_path() {
        assert_eq!(
            parse_module_path("// comment\nmodule example.com/m\n\ngo 1.21\n"),
            Some("example.com/m".to_string())
        );
        assert_eq!(
            parse_module_path("module \"quoted/m\" // trailing\n"),
            Some("quoted/m".to_string())
        );
        assert_eq!(parse_module_path("go 1.21\nrequire x v1\n"), None);
    }

    #[test]
    fn test_legacy_import_prefix() {
        let search = vec![PathBuf::from("/gopath")];
        assert_eq!(
            legacy_import_prefix(Path::new("/gopath/src/github.com/u/p"), &search),
            Some("github.com/u/p".to_string())
        );
        assert_eq!(legacy_import_prefix(Path::new("/elsewhere/p"), &search), None);
    }

    #[test]
    fn test_fingerprint_additions_only() {
        let old = DependencyFingerprint::from_modules(&[
            module_info("a", Path::new("/mod/a")),
            module_info("b", Path::new("/mod/b")),
        ]);
        let removed = DependencyFingerprint::from_modules(&[module_info("a", Path::new("/mod/a"))]);
        let added = DependencyFingerprint::from_modules(&[
            module_info("a", Path::new("/mod/a")),
            module_info("b", Path::new("/mod/b")),
            module_info("c", Path::new("/mod/c")),
        ]);

        assert!(!removed.is_relevant_change(&old, StalePolicy::AdditionsOnly));
        assert!(removed.is_relevant_change(&old, StalePolicy::AnyChange));
        assert!(added.is_relevant_change(&old, StalePolicy::AdditionsOnly));
        assert_eq!(added.added_since(&old).collect::<Vec<_>>(), vec![Path::new("/mod/c")]);
    }

    #[test]
    fn test_fingerprint_ignores_main_and_unresolved() {
        let fp = DependencyFingerprint::from_modules(&[
            ModuleInfo {
                path: "m".into(),
                main: true,
                dir: Some(PathBuf::from("/w")),
                version: None,
            },
            ModuleInfo {
                path: "gone".into(),
                main: false,
                dir: None,
                version: Some("v0.1.0".into()),
            },
        ]);
        assert!(fp.is_empty());
    }

    #[test]
    fn test_flatten_units_diamond_and_cycle() {
        let d = Arc::new(UnitRecord::builder("d", "d").build());
        let b = Arc::new(UnitRecord::builder("b", "b").import(d.clone()).build());
        let c = Arc::new(UnitRecord::builder("c", "c").import(d.clone()).build());
        let a = Arc::new(
            UnitRecord::builder("a", "a")
                .import(b.clone())
                .import(c.clone())
                .build(),
        );
        // Another record with id "c" importing `a` closes a cycle
        let c_cycle = Arc::new(UnitRecord::builder("c", "c").import(a.clone()).build());

        let ids: Vec<String> = flatten_units(&[a.clone(), c_cycle])
            .iter()
            .map(|u| u.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "d", "c"]);
    }

    #[tokio::test]
    async fn test_module_init_and_idempotent_rebuild() {
        let ws = crate::test_utils::ToyWorkspace::new("example.com/m")
            .package("a", &["package a", "import \"example.com/m/b\"", "func A"])
            .package("b", &["package b", "func B"])
            .write();
        let loader = Arc::new(ToyLoader::new());
        let metadata = Arc::new(StaticModules::new());
        let (ctx, mut rx) = context(loader.clone(), metadata.clone());
        let store = ctx.store.clone();

        let builder = RootBuilder::new(ws.root().to_path_buf(), RootKind::Module, ctx);
        let count = builder.init().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(builder.state(), BuilderState::Ready);
        assert_eq!(builder.import_prefix().as_deref(), Some("example.com/m"));
        assert!(store.get_by_import_path("example.com/m/b").is_some());

        let levels: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.level)
            .collect();
        assert_eq!(levels.iter().filter(|l| **l == MessageLevel::Log).count(), 2);
        assert_eq!(levels.last(), Some(&MessageLevel::Info));

        assert_eq!(
            builder.rebuild(RebuildMode::IfStale).await.unwrap(),
            RebuildOutcome::NotStale
        );
        assert_eq!(
            builder.rebuild(RebuildMode::IfStale).await.unwrap(),
            RebuildOutcome::NotStale
        );
        assert_eq!(builder.metrics().cache_builds(), 1);

        // A new dependency directory makes the root stale exactly once
        metadata.set(ws.root(), vec![module_info("dep", Path::new("/mod/dep"))]);
        assert!(matches!(
            builder.rebuild(RebuildMode::IfStale).await.unwrap(),
            RebuildOutcome::Rebuilt(_)
        ));
        assert_eq!(
            builder.rebuild(RebuildMode::IfStale).await.unwrap(),
            RebuildOutcome::NotStale
        );
        assert_eq!(builder.metrics().cache_builds(), 2);
    }

    #[tokio::test]
    async fn test_module_path_change_is_stale() {
        let ws = crate::test_utils::ToyWorkspace::new("example.com/m")
            .package("a", &["package a"])
            .write();
        let (ctx, _rx) = context(Arc::new(ToyLoader::new()), Arc::new(StaticModules::new()));
        let builder = RootBuilder::new(ws.root().to_path_buf(), RootKind::Module, ctx);
        builder.init().await.unwrap();

        std::fs::write(ws.root().join("go.mod"), "module example.com/renamed\n").unwrap();
        assert!(builder.check_stale().await.unwrap());
        assert_eq!(builder.state(), BuilderState::Stale);
    }

    #[tokio::test]
    async fn test_loader_failure_keeps_previous_snapshot() {
        let ws = crate::test_utils::ToyWorkspace::new("example.com/m")
            .package("a", &["package a"])
            .write();
        let loader = Arc::new(ToyLoader::new());
        let (ctx, mut rx) = context(loader.clone(), Arc::new(StaticModules::new()));
        let store = ctx.store.clone();
        let builder = RootBuilder::new(ws.root().to_path_buf(), RootKind::Module, ctx);
        builder.init().await.unwrap();

        loader.fail_next_loads(true);
        assert!(builder.rebuild(RebuildMode::Force).await.is_err());
        assert_eq!(builder.state(), BuilderState::Failed);
        assert!(store.get_by_import_path("example.com/m/a").is_some());
        assert!(std::iter::from_fn(|| rx.try_recv().ok())
            .any(|n| n.level == MessageLevel::Error && n.message.starts_with("rebuild failed")));

        // A failed builder is retried from scratch
        loader.fail_next_loads(false);
        assert!(matches!(
            builder.rebuild(RebuildMode::IfStale).await.unwrap(),
            RebuildOutcome::Rebuilt(_)
        ));
        assert_eq!(builder.state(), BuilderState::Ready);
    }

    #[tokio::test]
    async fn test_build_cache_before_init_resolves_root() {
        let ws = crate::test_utils::ToyWorkspace::new("example.com/m")
            .package("a", &["package a", "func A"])
            .write();
        let (ctx, _rx) = context(Arc::new(ToyLoader::new()), Arc::new(StaticModules::new()));
        let store = ctx.store.clone();
        let builder = RootBuilder::new(ws.root().to_path_buf(), RootKind::Module, ctx);
        assert_eq!(builder.state(), BuilderState::Uninitialized);

        assert_eq!(builder.build_cache().await.unwrap(), 1);
        assert_eq!(builder.state(), BuilderState::Ready);
        assert_eq!(builder.import_prefix().as_deref(), Some("example.com/m"));
        assert_eq!(
            builder.descriptor().map(|d| d.path),
            Some("example.com/m".to_string())
        );
        assert!(store.get_by_import_path("example.com/m/a").is_some());

        // Nothing changed since, so the next stale check is a no-op
        assert_eq!(
            builder.rebuild(RebuildMode::IfStale).await.unwrap(),
            RebuildOutcome::NotStale
        );
    }

    #[tokio::test]
    async fn test_malformed_module_file_fails_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "go 1.21\n").unwrap();
        let (ctx, _rx) = context(Arc::new(ToyLoader::new()), Arc::new(StaticModules::new()));
        let builder = RootBuilder::new(dir.path().to_path_buf(), RootKind::Module, ctx);

        let err = builder.init().await.unwrap_err();
        assert!(err.downcast_ref::<LayoutError>().is_some());
        assert_eq!(builder.state(), BuilderState::Failed);
    }

    #[tokio::test]
    async fn test_load_directory_skips_overlaid_units() {
        let ws = crate::test_utils::ToyWorkspace::new("example.com/m")
            .package("a", &["package a", "func A"])
            .package("b", &["package b", "func B"])
            .write();
        let (ctx, _rx) = context(Arc::new(ToyLoader::new()), Arc::new(StaticModules::new()));
        let store = ctx.store.clone();
        let overrides = ctx.overrides.clone();
        let builder = RootBuilder::new(ws.root().to_path_buf(), RootKind::Module, ctx);

        overrides.set(ws.file("a"), Arc::from("package a\nfunc Edited\n"));
        let units = builder.load_directory(&ws.root().join("a")).await.unwrap();
        assert_eq!(units.len(), 1);
        assert!(store.get_by_import_path("example.com/m/a").is_none());

        builder.load_directory(&ws.root().join("b")).await.unwrap();
        assert!(store.get_by_import_path("example.com/m/b").is_some());
        assert_eq!(builder.metrics().directory_loads(), 2);
    }
}
