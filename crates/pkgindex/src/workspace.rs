//! Workspace session: root discovery, builder ownership, filesystem event
//! handling and the query surface used by the protocol layer.
//!
//! # Design
//! - One session per opened workspace; nothing is global
//! - Builders are kept deepest root first so nested modules own their files
//! - A single worker task serializes watch events, throttled rebuilds and the
//!   periodic loader list-cache refresh
//! - Source-file events only invalidate file state; module-file events
//!   schedule rebuilds of the owning roots, at most once per cooldown

use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::Result;
use rayon::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;
use walkdir::WalkDir;

use crate::builder::{
    legacy_import_prefix, BuilderContext, RebuildMode, RebuildOutcome, RootBuilder, RootKind,
};
use crate::config::WorkspaceConfig;
use crate::error::{LayoutError, QueryError, QueryResult};
use crate::file_state::{
    path_to_uri, uri_to_path, DirectoryLoader, FileStateTable, FileView, Provenance,
};
use crate::loader::{ModuleMetadataSource, PackageLoader, SourceOverrides};
use crate::messages::Notifier;
use crate::navigator::{self, Definition, Enclosing};
use crate::perf::{Phase, TimingGuard};
use crate::store::UnitStore;
use crate::unit::{Span, Symbol, UnitId, UnitRecord};
use crate::watcher::{FsWatcher, WatchEvent, WatchEventKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// One or more module roots, sorted by path
    Modules(Vec<PathBuf>),
    /// A single project under a legacy search path
    Legacy,
    /// The root matched no known layout; only builtins are available
    Unrecognized,
}

/// Directories under `root` that contain a module-defining file.
pub fn discover_module_roots(root: &Path, config: &WorkspaceConfig) -> Vec<PathBuf> {
    let _timing = TimingGuard::new(Phase::Discovery, root.display());
    let mut roots: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(config.max_discovery_depth)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !config.is_excluded_dir(&e.file_name().to_string_lossy())
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy() == config.module_file_name)
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect();
    roots.sort();
    roots
}

/// Pick the workspace mode for `root`.
pub fn detect_mode(root: &Path, config: &WorkspaceConfig) -> Result<WorkspaceMode, LayoutError> {
    let modules = discover_module_roots(root, config);
    if !modules.is_empty() {
        return Ok(WorkspaceMode::Modules(modules));
    }
    if legacy_import_prefix(root, &config.search_paths).is_some() {
        return Ok(WorkspaceMode::Legacy);
    }
    Err(LayoutError::OutsideKnownLayout(root.to_path_buf()))
}

/// External collaborators a session is opened with.
#[derive(Clone)]
pub struct Collaborators {
    pub loader: Arc<dyn PackageLoader>,
    pub metadata: Arc<dyn ModuleMetadataSource>,
    pub notifier: Notifier,
}

/// One match from a workspace symbol search.
#[derive(Debug, Clone)]
pub struct SymbolMatch {
    pub unit: UnitId,
    pub symbol: Symbol,
}

/// Rebuild throttle: at most one round of rebuilds per cooldown.
#[derive(Debug)]
struct RebuildThrottle {
    last_rebuild: Instant,
    /// Builder roots waiting for the next allowed round
    pending: BTreeSet<PathBuf>,
    deadline: Option<Instant>,
}

pub struct WorkspaceSession {
    root: PathBuf,
    config: Arc<WorkspaceConfig>,
    mode: WorkspaceMode,
    ctx: BuilderContext,
    files: FileStateTable,
    /// Deepest root first
    builders: RwLock<Vec<Arc<RootBuilder>>>,
    builtin: Option<Arc<RootBuilder>>,
    throttle: Mutex<RebuildThrottle>,
    token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<FsWatcher>>,
}

impl std::fmt::Debug for WorkspaceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceSession")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn sort_deepest_first(builders: &mut [Arc<RootBuilder>]) {
    builders.sort_by(|a, b| {
        b.depth()
            .cmp(&a.depth())
            .then_with(|| a.root().cmp(b.root()))
    });
}

impl WorkspaceSession {
    /// Discover roots under `root` and build their caches.
    ///
    /// Layout and build failures are reported through the notifier and
    /// leave the session usable; the builtin root is built regardless.
    pub async fn open(
        root: PathBuf,
        config: WorkspaceConfig,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let _timing = TimingGuard::new(Phase::Open, root.display());
        let config = Arc::new(config);
        let store = Arc::new(UnitStore::new(
            config.store_mode,
            config.case_insensitive_paths,
        ));
        let overrides = SourceOverrides::new();
        let ctx = BuilderContext {
            config: config.clone(),
            store,
            loader: collaborators.loader,
            metadata: collaborators.metadata,
            overrides: overrides.clone(),
            notifier: collaborators.notifier,
        };

        let mode = match detect_mode(&root, &config) {
            Ok(mode) => mode,
            Err(e) => {
                ctx.notifier.error(e.to_string());
                WorkspaceMode::Unrecognized
            }
        };
        log::info!("Workspace {} opened in mode {:?}", root.display(), mode);

        let mut builders: Vec<Arc<RootBuilder>> = match &mode {
            WorkspaceMode::Modules(roots) => roots
                .iter()
                .map(|r| Arc::new(RootBuilder::new(r.clone(), RootKind::Module, ctx.clone())))
                .collect(),
            WorkspaceMode::Legacy => vec![Arc::new(RootBuilder::new(
                root.clone(),
                RootKind::Legacy,
                ctx.clone(),
            ))],
            WorkspaceMode::Unrecognized => Vec::new(),
        };
        sort_deepest_first(&mut builders);

        let builtin = config
            .builtin_root
            .clone()
            .map(|r| Arc::new(RootBuilder::new(r, RootKind::Builtin, ctx.clone())));

        for builder in builders.iter().chain(builtin.iter()) {
            // Failures are already notified by the builder
            if let Err(e) = builder.init().await {
                log::trace!("Initial build of {} failed: {e:#}", builder.root().display());
            }
        }

        Arc::new(Self {
            root,
            files: FileStateTable::new(overrides),
            mode,
            ctx,
            builders: RwLock::new(builders),
            builtin,
            throttle: Mutex::new(RebuildThrottle {
                last_rebuild: Instant::now(),
                pending: BTreeSet::new(),
                deadline: None,
            }),
            token: CancellationToken::new(),
            worker: Mutex::new(None),
            watcher: Mutex::new(None),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> &WorkspaceMode {
        &self.mode
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn store(&self) -> &UnitStore {
        &self.ctx.store
    }

    pub fn files(&self) -> &FileStateTable {
        &self.files
    }

    /// Workspace builders, deepest root first. Excludes the builtin root.
    pub fn builders(&self) -> Vec<Arc<RootBuilder>> {
        self.builders
            .read()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn builtin(&self) -> Option<&Arc<RootBuilder>> {
        self.builtin.as_ref()
    }

    pub fn builder_for_root(&self, root: &Path) -> Option<Arc<RootBuilder>> {
        self.builders().into_iter().find(|b| b.root() == root)
    }

    /// The builder owning `path`: the deepest workspace root containing it,
    /// else the builtin root.
    pub fn builder_for_path(&self, path: &Path) -> Option<Arc<RootBuilder>> {
        self.builders()
            .into_iter()
            .find(|b| b.owns_path(path))
            .or_else(|| self.builtin.clone().filter(|b| b.owns_path(path)))
    }

    /// Import prefixes of the workspace's own roots, outermost first.
    pub fn priority_prefixes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.builders()
            .iter()
            .rev()
            .filter_map(|b| b.import_prefix())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    // ---- queries ----

    pub fn get_file(&self, uri: &Url) -> QueryResult<FileView> {
        self.files.get_file(uri)
    }

    pub fn set_overlay(&self, uri: &Url, content: Option<String>) -> QueryResult<()> {
        self.files.set_overlay(uri, content)
    }

    pub fn read(&self, uri: &Url) -> QueryResult<Arc<str>> {
        self.files.read(uri)
    }

    /// The unit owning the file at `uri`.
    ///
    /// Files with an editor overlay or an invalidated state are reloaded
    /// through their builder; everything else is served from the store.
    pub async fn get_unit_for_file(&self, uri: &Url) -> QueryResult<Arc<UnitRecord>> {
        let path = uri_to_path(uri)?;
        let view = self.files.get_file(uri)?;
        if let Some(parsed) = view.parsed {
            return Ok(parsed.unit);
        }
        if view.provenance == Provenance::FromCache {
            if let Some(unit) = self.ctx.store.get_by_file(&path) {
                return Ok(unit);
            }
        }

        let builder = self
            .builder_for_path(&path)
            .ok_or_else(|| QueryError::NoBuildUnit(path.clone()))?;
        let parsed = self.files.ensure_parsed(uri, builder.as_ref()).await?;
        Ok(parsed.unit)
    }

    pub fn get_unit_for_import_path(&self, import_path: &str) -> Option<Arc<UnitRecord>> {
        self.ctx.store.get_by_import_path(import_path)
    }

    /// Visit stored units, own code first, until `visit` breaks.
    pub fn search<F>(&self, visit: F)
    where
        F: FnMut(&Arc<UnitRecord>) -> ControlFlow<()>,
    {
        self.ctx.store.walk(&self.priority_prefixes(), visit);
    }

    /// Symbols whose name contains `query` (case-insensitive), in walk
    /// order, at most `limit` of them.
    pub fn search_symbols(&self, query: &str, limit: usize) -> Vec<SymbolMatch> {
        let _timing = TimingGuard::new(Phase::SymbolSearch, query);
        let needle = query.to_lowercase();
        let units = self.ctx.store.ordered_units(&self.priority_prefixes());

        let per_unit: Vec<Vec<SymbolMatch>> = units
            .par_iter()
            .map(|unit| {
                let mut found: Vec<SymbolMatch> = unit
                    .symbols
                    .declared_in(&unit.import_path)
                    .filter(|s| s.name.to_lowercase().contains(&needle))
                    .map(|s| SymbolMatch {
                        unit: unit.id.clone(),
                        symbol: s.clone(),
                    })
                    .collect();
                found.sort_by(|a, b| {
                    a.symbol
                        .name
                        .cmp(&b.symbol.name)
                        .then_with(|| a.symbol.id.cmp(&b.symbol.id))
                });
                found
            })
            .collect();

        per_unit.into_iter().flatten().take(limit).collect()
    }

    /// Narrowest syntax node enclosing `range` in the file at `uri`.
    pub async fn enclosing_node_at(&self, uri: &Url, range: Span) -> QueryResult<Enclosing> {
        let path = uri_to_path(uri)?;
        let unit = self.get_unit_for_file(uri).await?;
        navigator::enclosing_node(&unit, &path, range, self.config.enclosing_search_depth)
    }

    /// Declaration of the identifier at `range` in the file at `uri`.
    pub async fn definition_at(&self, uri: &Url, range: Span) -> QueryResult<Definition> {
        let path = uri_to_path(uri)?;
        let unit = self.get_unit_for_file(uri).await?;
        let ident =
            navigator::identifier_at(&unit, &path, range, self.config.enclosing_search_depth)?;
        let symbol = navigator::symbol_for_node(&ident).ok_or_else(|| {
            QueryError::SymbolNotFound(ident.syntax().text.clone().unwrap_or_default())
        })?;

        match navigator::resolve_symbol_definition(&ident.unit, &symbol) {
            Ok(def) => Ok(def),
            Err(e) => match self.ctx.store.get_by_import_path(&symbol.package) {
                // The owner may be outside the loaded import graph
                Some(owner) => navigator::resolve_symbol_definition(&owner, &symbol),
                None => Err(e),
            },
        }
    }

    // ---- rebuilds ----

    /// Rebuild every root now, bypassing the throttle.
    pub async fn rebuild(&self, mode: RebuildMode) -> Vec<(PathBuf, Result<RebuildOutcome>)> {
        if let Ok(mut throttle) = self.throttle.lock() {
            throttle.last_rebuild = Instant::now();
            throttle.pending.clear();
            throttle.deadline = None;
        }
        let mut results = Vec::new();
        for builder in self.builders().iter().chain(self.builtin.iter()) {
            let outcome = builder.rebuild(mode).await;
            if let Ok(RebuildOutcome::Rebuilt(_)) = outcome {
                self.files.forget_parsed_under(builder.root());
            }
            results.push((builder.root().to_path_buf(), outcome));
        }
        results
    }

    /// Queue `roots` for rebuild, running now if the cooldown has passed.
    async fn schedule_rebuild(&self, roots: impl IntoIterator<Item = PathBuf>) {
        let run_now = {
            let Ok(mut throttle) = self.throttle.lock() else {
                return;
            };
            throttle.pending.extend(roots);
            if throttle.pending.is_empty() {
                return;
            }
            let ready_at = throttle.last_rebuild + self.config.rebuild_cooldown();
            if Instant::now() >= ready_at {
                true
            } else {
                if throttle.deadline.is_none() {
                    log::trace!(
                        "Rebuild of {} roots deferred by cooldown",
                        throttle.pending.len()
                    );
                }
                throttle.deadline = Some(ready_at);
                false
            }
        };
        if run_now {
            self.run_pending_rebuilds().await;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.throttle.lock().ok().and_then(|t| t.deadline)
    }

    /// Run every queued rebuild, deepest root first.
    pub async fn run_pending_rebuilds(&self) {
        let pending: Vec<PathBuf> = {
            let Ok(mut throttle) = self.throttle.lock() else {
                return;
            };
            throttle.deadline = None;
            throttle.last_rebuild = Instant::now();
            std::mem::take(&mut throttle.pending).into_iter().collect()
        };
        if pending.is_empty() {
            return;
        }

        for builder in self.builders() {
            if !pending.iter().any(|p| p == builder.root()) {
                continue;
            }
            match builder.rebuild(RebuildMode::IfStale).await {
                Ok(RebuildOutcome::Rebuilt(count)) => {
                    let dropped = self.files.forget_parsed_under(builder.root());
                    log::info!(
                        "Rebuilt {} ({} units, {} parsed files dropped)",
                        builder.root().display(),
                        count,
                        dropped
                    );
                }
                Ok(RebuildOutcome::NotStale) => {
                    log::trace!("{} unchanged, rebuild skipped", builder.root().display())
                }
                // Already notified by the builder
                Err(_) => {}
            }
        }
    }

    // ---- filesystem events ----

    fn is_module_file(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy() == self.config.module_file_name)
            .unwrap_or(false)
    }

    /// Apply one filesystem event.
    pub async fn handle_event(&self, event: WatchEvent) {
        log::trace!("Watch event {:?} for {}", event.kind, event.path.display());
        let kind = match event.kind {
            WatchEventKind::Renamed if !event.path.exists() => WatchEventKind::Removed,
            WatchEventKind::Renamed => WatchEventKind::Modified,
            other => other,
        };

        if self.is_module_file(&event.path) {
            self.handle_module_file_event(&event.path, kind).await;
            return;
        }

        if let Some(uri) = path_to_uri(&event.path) {
            // A stored but never queried file gets tracked here, otherwise
            // its next query would be answered by the pre-change store entry.
            let stored = self.ctx.store.get_by_file(&event.path).is_some();
            if stored && !self.files.is_tracked(&uri) {
                let _ = self.files.get_file(&uri);
            }
            if self.files.invalidate(&uri) {
                log::trace!("Invalidated file state for {}", uri);
            }
        }

        if kind == WatchEventKind::Removed {
            let ids = self.ctx.store.ids_under(&event.path);
            for id in &ids {
                self.ctx.store.delete(id);
            }
            if !ids.is_empty() {
                log::trace!(
                    "Dropped {} units under removed {}",
                    ids.len(),
                    event.path.display()
                );
            }
        }
    }

    async fn handle_module_file_event(&self, path: &Path, kind: WatchEventKind) {
        self.ctx.loader.invalidate_list_cache();

        if let Some(dir) = path.parent() {
            if kind != WatchEventKind::Removed
                && path.exists()
                && dir.starts_with(&self.root)
                && self.builder_for_root(dir).is_none()
            {
                log::info!("New module root discovered at {}", dir.display());
                let builder = Arc::new(RootBuilder::new(
                    dir.to_path_buf(),
                    RootKind::Module,
                    self.ctx.clone(),
                ));
                if let Ok(mut builders) = self.builders.write() {
                    builders.push(builder);
                    sort_deepest_first(&mut builders);
                }
            }
        }

        let owners: Vec<PathBuf> = self
            .builders()
            .iter()
            .filter(|b| b.kind() == RootKind::Module && path.starts_with(b.root()))
            .map(|b| b.root().to_path_buf())
            .collect();
        self.schedule_rebuild(owners).await;
    }

    /// Drop the loader's list cache and re-load directories whose contents
    /// changed since their units were stored.
    pub async fn refresh(&self) {
        self.ctx.loader.invalidate_list_cache();

        let stale = self.ctx.store.stale_entries();
        if stale.is_empty() {
            return;
        }
        let dirs: BTreeSet<PathBuf> = stale
            .iter()
            .filter(|u| !u.files.iter().any(|f| self.files.has_overlay(f)))
            .filter_map(|u| u.primary_dir().map(Path::to_path_buf))
            .collect();
        log::trace!("Refreshing {} changed directories", dirs.len());

        for dir in dirs {
            let Some(builder) = self.builder_for_path(&dir) else {
                continue;
            };
            let reloaded = match builder.load_directory(&dir).await {
                Ok(units) => units,
                Err(e) => {
                    log::warn!("Refreshing {} failed: {e:#}", dir.display());
                    continue;
                }
            };
            let live: HashSet<UnitId> = reloaded.iter().map(|u| u.id.clone()).collect();
            for unit in stale.iter().filter(|u| u.primary_dir() == Some(dir.as_path())) {
                if !live.contains(&unit.id) {
                    self.ctx.store.delete(&unit.id);
                }
            }
        }
    }

    // ---- lifecycle ----

    /// Start the background worker consuming `events`.
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<WatchEvent>) {
        let handle = tokio::spawn(run_worker(
            Arc::downgrade(self),
            events,
            self.token.clone(),
            self.config.list_cache_refresh(),
        ));
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(old) = worker.replace(handle) {
                old.abort();
            }
        }
    }

    /// Start the worker fed by a recursive watcher on the workspace root.
    ///
    /// With `watch_files` off the worker still runs the periodic refresh.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.config.watch_files {
            let watcher = FsWatcher::spawn(
                self.root.clone(),
                self.config.excluded_dirs.clone(),
                tx,
                self.token.child_token(),
            )?;
            if let Ok(mut slot) = self.watcher.lock() {
                *slot = Some(watcher);
            }
        }
        self.start(rx);
        Ok(())
    }

    /// Stop the watcher and the worker. No callbacks run afterwards.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(watcher) = watcher {
            let _ = tokio::task::spawn_blocking(move || watcher.close()).await;
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        log::info!("Workspace {} closed", self.root.display());
    }
}

impl Drop for WorkspaceSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_worker(
    session: Weak<WorkspaceSession>,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    token: CancellationToken,
    refresh_period: Duration,
) {
    log::info!("Workspace worker started");
    let mut refresh = tokio::time::interval_at(Instant::now() + refresh_period, refresh_period);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut events_open = true;

    loop {
        let Some(deadline) = session.upgrade().map(|s| s.next_deadline()) else {
            break;
        };
        let wake_at = deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    let Some(session) = session.upgrade() else { break };
                    session.handle_event(event).await;
                }
                None => events_open = false,
            },
            _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                let Some(session) = session.upgrade() else { break };
                session.run_pending_rebuilds().await;
            }
            _ = refresh.tick() => {
                let Some(session) = session.upgrade() else { break };
                session.refresh().await;
            }
        }
    }
    log::info!("Workspace worker stopped");
}
