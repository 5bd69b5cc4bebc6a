//
// store.rs
//
// Multi-key in-memory index of unit records
//

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::config::StoreMode;
use crate::unit::{UnitId, UnitRecord};

/// A stored unit plus the mtime of its primary directory when stored
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub unit: Arc<UnitRecord>,
    pub dir_mtime: Option<SystemTime>,
}

/// The three key views. Only ever mutated together, under one write lock.
///
/// Import paths and files may be shared by several live units (test
/// variants); the last unit put under a key answers lookups for it.
#[derive(Debug, Default)]
struct Indexes {
    by_id: HashMap<UnitId, StoreEntry>,
    by_import_path: HashMap<String, Vec<UnitId>>,
    by_file: HashMap<PathBuf, Vec<UnitId>>,
}

impl Indexes {
    fn remove(&mut self, id: &UnitId, case_insensitive: bool) -> Option<StoreEntry> {
        let old = self.by_id.remove(id)?;
        detach(&mut self.by_import_path, &old.unit.import_path, id);
        for file in &old.unit.files {
            let key = normalize_path(file, case_insensitive);
            detach(&mut self.by_file, &key, id);
        }
        Some(old)
    }

    fn insert(&mut self, entry: StoreEntry, case_insensitive: bool) {
        let id = entry.unit.id.clone();
        self.remove(&id, case_insensitive);

        self.by_import_path
            .entry(entry.unit.import_path.clone())
            .or_default()
            .push(id.clone());
        for file in &entry.unit.files {
            self.by_file
                .entry(normalize_path(file, case_insensitive))
                .or_default()
                .push(id.clone());
        }
        self.by_id.insert(id, entry);
    }

    fn resolve<K>(&self, map: &HashMap<K, Vec<UnitId>>, key: &K) -> Option<Arc<UnitRecord>>
    where
        K: std::hash::Hash + Eq,
    {
        let id = map.get(key)?.last()?;
        self.by_id.get(id).map(|e| e.unit.clone())
    }
}

fn detach<K>(map: &mut HashMap<K, Vec<UnitId>>, key: &K, id: &UnitId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(ids) = map.get_mut(key) {
        ids.retain(|i| i != id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

/// Normalize a file path for use as a store key.
pub fn normalize_path(path: &Path, case_insensitive: bool) -> PathBuf {
    if case_insensitive {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path.to_path_buf()
    }
}

fn dir_mtime(unit: &UnitRecord) -> Option<SystemTime> {
    let dir = unit.primary_dir()?;
    std::fs::metadata(dir).ok()?.modified().ok()
}

/// Walk tier of an import path: own code, then hosted, then builtin.
fn walk_rank(import_path: &str, priority_prefixes: &[String]) -> (usize, usize) {
    if let Some(i) = priority_prefixes
        .iter()
        .position(|p| has_path_prefix(import_path, p))
    {
        return (0, i);
    }
    if import_path.contains('.') {
        (1, 0)
    } else {
        (2, 0)
    }
}

/// `path` equals `prefix` or lies beneath it on a `/` boundary.
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Multi-key unit store.
///
/// Reads take the shared lock; every mutation takes the exclusive lock.
/// A store built with `StoreMode::Disabled` keeps nothing: mutations are
/// no-ops and lookups miss.
#[derive(Debug)]
pub struct UnitStore {
    inner: Option<RwLock<Indexes>>,
    case_insensitive: bool,
}

impl Default for UnitStore {
    fn default() -> Self {
        Self::new(StoreMode::Enabled, false)
    }
}

impl UnitStore {
    pub fn new(mode: StoreMode, case_insensitive: bool) -> Self {
        let inner = match mode {
            StoreMode::Enabled => Some(RwLock::new(Indexes::default())),
            StoreMode::Disabled => None,
        };
        Self {
            inner,
            case_insensitive,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Insert or replace a unit under all three keys.
    pub fn put(&self, unit: Arc<UnitRecord>) {
        self.put_all(std::iter::once(unit));
    }

    /// Insert or replace a batch of units under a single write lock.
    ///
    /// Directory mtimes are read before the lock is taken. Returns the
    /// number of units stored.
    pub fn put_all(&self, units: impl IntoIterator<Item = Arc<UnitRecord>>) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let entries: Vec<StoreEntry> = units
            .into_iter()
            .map(|unit| StoreEntry {
                dir_mtime: dir_mtime(&unit),
                unit,
            })
            .collect();

        let Ok(mut guard) = inner.write() else {
            return 0;
        };
        let count = entries.len();
        for entry in entries {
            guard.insert(entry, self.case_insensitive);
        }
        count
    }

    pub fn get(&self, id: &UnitId) -> Option<Arc<UnitRecord>> {
        let guard = self.inner.as_ref()?.read().ok()?;
        guard.by_id.get(id).map(|e| e.unit.clone())
    }

    pub fn get_entry(&self, id: &UnitId) -> Option<StoreEntry> {
        let guard = self.inner.as_ref()?.read().ok()?;
        guard.by_id.get(id).cloned()
    }

    pub fn get_by_import_path(&self, import_path: &str) -> Option<Arc<UnitRecord>> {
        let guard = self.inner.as_ref()?.read().ok()?;
        guard.resolve(&guard.by_import_path, &import_path.to_string())
    }

    pub fn get_by_file(&self, path: &Path) -> Option<Arc<UnitRecord>> {
        let key = normalize_path(path, self.case_insensitive);
        let guard = self.inner.as_ref()?.read().ok()?;
        guard.resolve(&guard.by_file, &key)
    }

    /// Remove a unit from all three maps. Returns true if it was present.
    pub fn delete(&self, id: &UnitId) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        let Ok(mut guard) = inner.write() else {
            return false;
        };
        guard.remove(id, self.case_insensitive).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .and_then(|inner| inner.read().ok().map(|g| g.by_id.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of units whose primary directory lies under `dir`.
    pub fn ids_under(&self, dir: &Path) -> Vec<UnitId> {
        let Some(guard) = self.inner.as_ref().and_then(|i| i.read().ok()) else {
            return Vec::new();
        };
        let dir = normalize_path(dir, self.case_insensitive);
        guard
            .by_id
            .values()
            .filter(|e| {
                e.unit
                    .primary_dir()
                    .map(|d| normalize_path(d, self.case_insensitive).starts_with(&dir))
                    .unwrap_or(false)
            })
            .map(|e| e.unit.id.clone())
            .collect()
    }

    /// Units whose primary directory mtime no longer matches the one seen
    /// when they were stored.
    pub fn stale_entries(&self) -> Vec<Arc<UnitRecord>> {
        let observed: Vec<StoreEntry> = match self.inner.as_ref().and_then(|i| i.read().ok()) {
            Some(guard) => guard.by_id.values().cloned().collect(),
            None => return Vec::new(),
        };
        observed
            .into_iter()
            .filter(|e| e.dir_mtime.is_some() && dir_mtime(&e.unit) != e.dir_mtime)
            .map(|e| e.unit)
            .collect()
    }

    /// Snapshot of all units in walk order.
    ///
    /// Units under a priority prefix come first (in prefix order), then
    /// units whose import path contains a `.`, then everything else. Ties
    /// break by id.
    pub fn ordered_units(&self, priority_prefixes: &[String]) -> Vec<Arc<UnitRecord>> {
        let mut units: Vec<Arc<UnitRecord>> = match self.inner.as_ref().and_then(|i| i.read().ok())
        {
            Some(guard) => guard.by_id.values().map(|e| e.unit.clone()).collect(),
            None => return Vec::new(),
        };
        units.sort_by(|a, b| {
            walk_rank(&a.import_path, priority_prefixes)
                .cmp(&walk_rank(&b.import_path, priority_prefixes))
                .then_with(|| a.id.cmp(&b.id))
        });
        units
    }

    /// Visit every unit in walk order until `visit` breaks.
    ///
    /// The lock is released before the first visit, so visitors may call
    /// back into the store.
    pub fn walk<F>(&self, priority_prefixes: &[String], mut visit: F)
    where
        F: FnMut(&Arc<UnitRecord>) -> ControlFlow<()>,
    {
        for unit in self.ordered_units(priority_prefixes) {
            if visit(&unit).is_break() {
                break;
            }
        }
    }
}
