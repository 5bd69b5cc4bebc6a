//
// file_state.rs
//
// Per-file state backing open-document semantics
//

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ropey::Rope;
use url::Url;

use crate::error::{QueryError, QueryResult};
use crate::loader::SourceOverrides;
use crate::unit::{SyntaxTree, UnitRecord};

/// Where a file's current state came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The editor holds the authoritative content
    OpenedByEditor,
    /// Populated from a cache build or directory load
    FromCache,
    /// Invalidated by a filesystem event; reload on next use
    NeedsReload,
}

/// A file's syntax tree within its owning unit.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub unit: Arc<UnitRecord>,
    pub tree_index: usize,
}

impl ParsedFile {
    pub fn tree(&self) -> &SyntaxTree {
        &self.unit.syntax[self.tree_index]
    }
}

/// Read-only copy of a tracked file's state
#[derive(Debug, Clone)]
pub struct FileView {
    pub uri: Url,
    pub path: PathBuf,
    pub content: Option<Arc<str>>,
    pub provenance: Provenance,
    pub parsed: Option<ParsedFile>,
}

#[derive(Debug)]
struct FileState {
    path: PathBuf,
    content: Option<Arc<str>>,
    provenance: Provenance,
    parsed: Option<ParsedFile>,
    /// Line index over `content`, built on first position conversion
    lines: Option<Rope>,
    /// Table revision at which content last changed
    changed_at: u64,
}

impl FileState {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            content: None,
            provenance: Provenance::FromCache,
            parsed: None,
            lines: None,
            changed_at: 0,
        }
    }

    fn has_overlay(&self) -> bool {
        self.provenance == Provenance::OpenedByEditor && self.content.is_some()
    }

    fn view(&self, uri: &Url) -> FileView {
        FileView {
            uri: uri.clone(),
            path: self.path.clone(),
            content: self.content.clone(),
            provenance: self.provenance,
            parsed: self.parsed.clone(),
        }
    }
}

/// Loads the units of a single directory on behalf of the file table.
#[async_trait]
pub trait DirectoryLoader: Send + Sync {
    async fn load_directory(&self, dir: &Path) -> anyhow::Result<Vec<Arc<UnitRecord>>>;
}

pub fn uri_to_path(uri: &Url) -> QueryResult<PathBuf> {
    uri.to_file_path()
        .map_err(|_| QueryError::NotAFileUri(uri.to_string()))
}

pub fn path_to_uri(path: &Path) -> Option<Url> {
    Url::from_file_path(path).ok()
}

/// Table of per-file state keyed by URI.
pub struct FileStateTable {
    files: RwLock<HashMap<Url, FileState>>,
    overrides: SourceOverrides,
    /// Bumped on every content change or invalidation
    revision: AtomicU64,
}

impl std::fmt::Debug for FileStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateTable")
            .field("overrides", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

impl FileStateTable {
    pub fn new(overrides: SourceOverrides) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            overrides,
            revision: AtomicU64::new(0),
        }
    }

    pub fn overrides(&self) -> &SourceOverrides {
        &self.overrides
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn bump_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// State of `uri`, tracking it from now on if it was unknown.
    ///
    /// Only fails for URIs that do not name a local file.
    pub fn get_file(&self, uri: &Url) -> QueryResult<FileView> {
        if let Some(view) = self
            .files
            .read()
            .ok()
            .and_then(|g| g.get(uri).map(|s| s.view(uri)))
        {
            return Ok(view);
        }

        let path = uri_to_path(uri)?;
        let mut guard = self
            .files
            .write()
            .map_err(|_| QueryError::NoBuildUnit(path.clone()))?;
        let state = guard
            .entry(uri.clone())
            .or_insert_with(|| FileState::new(path));
        Ok(state.view(uri))
    }

    pub fn is_tracked(&self, uri: &Url) -> bool {
        self.files
            .read()
            .map(|g| g.contains_key(uri))
            .unwrap_or(false)
    }

    /// Set (`Some`) or clear (`None`) the editor overlay for `uri`.
    ///
    /// The overlay is mirrored into the loader's override map so that any
    /// later load sees the edited text. Parse state is dropped either way.
    pub fn set_overlay(&self, uri: &Url, content: Option<String>) -> QueryResult<()> {
        let path = uri_to_path(uri)?;
        let revision = self.bump_revision();

        let Ok(mut guard) = self.files.write() else {
            return Ok(());
        };
        let state = guard
            .entry(uri.clone())
            .or_insert_with(|| FileState::new(path.clone()));

        match content {
            Some(text) => {
                let text: Arc<str> = Arc::from(text);
                self.overrides.set(path, text.clone());
                state.content = Some(text);
                state.provenance = Provenance::OpenedByEditor;
            }
            None => {
                self.overrides.remove(&path);
                state.content = None;
                state.provenance = Provenance::NeedsReload;
            }
        }
        state.parsed = None;
        state.lines = None;
        state.changed_at = revision;
        log::trace!("Overlay updated for {}", uri);
        Ok(())
    }

    /// Current content: the overlay if any, else disk content (cached).
    pub fn read(&self, uri: &Url) -> QueryResult<Arc<str>> {
        if let Some(content) = self
            .files
            .read()
            .ok()
            .and_then(|g| g.get(uri).and_then(|s| s.content.clone()))
        {
            return Ok(content);
        }

        let path = uri_to_path(uri)?;
        let text = std::fs::read_to_string(&path).map_err(|source| QueryError::FileRead {
            path: path.clone(),
            source,
        })?;
        let text: Arc<str> = Arc::from(text);

        if let Ok(mut guard) = self.files.write() {
            let state = guard
                .entry(uri.clone())
                .or_insert_with(|| FileState::new(path));
            // An overlay set while we were reading wins
            if let Some(existing) = &state.content {
                return Ok(existing.clone());
            }
            state.content = Some(text.clone());
        }
        Ok(text)
    }

    /// Drop derived state for `uri` after an on-disk change.
    ///
    /// Editor overlays keep their content; everything else reverts to
    /// "read from disk on demand". Returns true if the file was tracked.
    pub fn invalidate(&self, uri: &Url) -> bool {
        let revision = self.bump_revision();
        let Ok(mut guard) = self.files.write() else {
            return false;
        };
        let Some(state) = guard.get_mut(uri) else {
            return false;
        };
        state.parsed = None;
        state.lines = None;
        if state.provenance != Provenance::OpenedByEditor {
            state.content = None;
            state.provenance = Provenance::NeedsReload;
            state.changed_at = revision;
        }
        true
    }

    /// Drop parse results of files under `dir` after their root was rebuilt.
    ///
    /// Disk-backed files keep `FromCache` provenance so the next query is
    /// answered by the freshly published store entry. Returns the number of
    /// files whose parse state was dropped.
    pub fn forget_parsed_under(&self, dir: &Path) -> usize {
        let Ok(mut guard) = self.files.write() else {
            return 0;
        };
        let mut dropped = 0;
        for state in guard.values_mut().filter(|s| s.path.starts_with(dir)) {
            if state.parsed.take().is_some() {
                dropped += 1;
            }
            if !state.has_overlay() {
                state.content = None;
                state.lines = None;
            }
        }
        dropped
    }

    pub fn parsed(&self, uri: &Url) -> Option<ParsedFile> {
        self.files
            .read()
            .ok()?
            .get(uri)
            .and_then(|s| s.parsed.clone())
    }

    pub fn has_overlay(&self, path: &Path) -> bool {
        self.overrides.contains(path)
    }

    pub fn open_uris(&self) -> Vec<Url> {
        self.files
            .read()
            .map(|g| {
                g.iter()
                    .filter(|(_, s)| s.provenance == Provenance::OpenedByEditor)
                    .map(|(uri, _)| uri.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Attach parse results for every file of `units`.
    ///
    /// Files whose content changed after `since` are skipped, since the
    /// load that produced `units` did not see that change. Disk-derived
    /// content is only applied to files without an overlay. Returns the
    /// number of files populated.
    pub fn populate(&self, units: &[Arc<UnitRecord>], since: u64) -> usize {
        let Ok(mut guard) = self.files.write() else {
            return 0;
        };
        let mut seen: HashSet<Url> = HashSet::new();
        for unit in units {
            for (tree_index, tree) in unit.syntax.iter().enumerate() {
                let Some(uri) = path_to_uri(&tree.path) else {
                    continue;
                };
                if seen.contains(&uri) {
                    continue;
                }
                let state = guard
                    .entry(uri.clone())
                    .or_insert_with(|| FileState::new(tree.path.clone()));
                if state.changed_at > since {
                    log::trace!("Skipping populate for {}: changed during load", uri);
                    continue;
                }
                state.parsed = Some(ParsedFile {
                    unit: unit.clone(),
                    tree_index,
                });
                if !state.has_overlay() {
                    if let Some(source) = &tree.source {
                        state.content = Some(source.clone());
                        state.lines = None;
                    }
                    state.provenance = Provenance::FromCache;
                }
                seen.insert(uri);
            }
        }
        seen.len()
    }

    /// Parse state for `uri`, loading its directory if needed.
    ///
    /// A single directory load typically resolves many files; all of them
    /// are populated, not just `uri`.
    pub async fn ensure_parsed(
        &self,
        uri: &Url,
        loader: &dyn DirectoryLoader,
    ) -> QueryResult<ParsedFile> {
        if let Some(parsed) = self.parsed(uri) {
            return Ok(parsed);
        }

        let path = uri_to_path(uri)?;
        self.get_file(uri)?;
        let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let since = self.revision();

        let units = loader
            .load_directory(&dir)
            .await
            .map_err(|e| QueryError::LoadFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if units.is_empty() {
            return Err(QueryError::NoBuildUnit(path));
        }

        let populated = self.populate(&units, since);
        log::trace!(
            "Directory load for {} populated {} files from {} units",
            dir.display(),
            populated,
            units.len()
        );

        if let Some(parsed) = self.parsed(uri) {
            return Ok(parsed);
        }
        match units.iter().find(|u| u.owns_file(&path)) {
            Some(_) => Err(QueryError::NoSyntaxTrees(path)),
            None => Err(QueryError::NoBuildUnit(path)),
        }
    }

    /// Byte offset of a (line, UTF-16 column) position, clamped to the text.
    pub fn offset_at(&self, uri: &Url, line: usize, utf16_col: usize) -> QueryResult<usize> {
        self.with_lines(uri, |rope| {
            if line >= rope.len_lines() {
                return rope.len_bytes();
            }
            let line_start = rope.line_to_char(line);
            let line_end = if line + 1 < rope.len_lines() {
                rope.line_to_char(line + 1)
            } else {
                rope.len_chars()
            };
            let base = rope.char_to_utf16_cu(line_start);
            let limit = rope.char_to_utf16_cu(line_end);
            let target = rope.utf16_cu_to_char((base + utf16_col).min(limit));
            rope.char_to_byte(target.min(line_end))
        })
    }

    /// (line, UTF-16 column) of a byte offset, clamped to the text.
    pub fn position_at(&self, uri: &Url, offset: usize) -> QueryResult<(usize, usize)> {
        self.with_lines(uri, |rope| {
            let char_idx = rope.byte_to_char(offset.min(rope.len_bytes()));
            let line = rope.char_to_line(char_idx);
            let col = rope.char_to_utf16_cu(char_idx)
                - rope.char_to_utf16_cu(rope.line_to_char(line));
            (line, col)
        })
    }

    fn with_lines<R>(&self, uri: &Url, f: impl FnOnce(&Rope) -> R) -> QueryResult<R> {
        let content = self.read(uri)?;
        if let Ok(mut guard) = self.files.write() {
            if let Some(state) = guard.get_mut(uri) {
                let current = state
                    .content
                    .as_ref()
                    .map(|c| Arc::ptr_eq(c, &content))
                    .unwrap_or(false);
                if current {
                    let rope = state
                        .lines
                        .get_or_insert_with(|| Rope::from_str(&content));
                    return Ok(f(rope));
                }
            }
        }
        Ok(f(&Rope::from_str(&content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Span;
    use std::sync::atomic::AtomicUsize;

    struct FixedLoader {
        units: Vec<Arc<UnitRecord>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryLoader for FixedLoader {
        async fn load_directory(&self, _dir: &Path) -> anyhow::Result<Vec<Arc<UnitRecord>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.units.clone())
        }
    }

    fn loader(units: Vec<Arc<UnitRecord>>) -> FixedLoader {
        FixedLoader {
            units,
            calls: AtomicUsize::new(0),
        }
    }

    fn unit_with_trees(dir: &Path, names: &[&str]) -> Arc<UnitRecord> {
        let mut b = UnitRecord::builder("M/a", "M/a");
        for name in names {
            let source = format!("package a // {}\n", name);
            let tree = SyntaxTree::new(dir.join(name), Span::new(0, source.len()))
                .with_source(source);
            b = b.tree(tree);
        }
        Arc::new(b.build())
    }

    fn uri(path: &Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[test]
    fn test_get_file_creates_entry() {
        let table = FileStateTable::new(SourceOverrides::new());
        let u = Url::parse("file:///w/a/a.toy").unwrap();
        assert!(!table.is_tracked(&u));

        let view = table.get_file(&u).unwrap();
        assert!(table.is_tracked(&u));
        assert!(view.content.is_none());
        assert_eq!(view.provenance, Provenance::FromCache);
    }

    #[test]
    fn test_non_file_uri_rejected() {
        let table = FileStateTable::new(SourceOverrides::new());
        let u = Url::parse("untitled:Untitled-1").unwrap();
        assert!(matches!(table.get_file(&u), Err(QueryError::NotAFileUri(_))));
    }

    #[test]
    fn test_overlay_precedence_over_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.toy");
        std::fs::write(&path, "on disk").unwrap();
        let u = uri(&path);
        let table = FileStateTable::new(SourceOverrides::new());

        table.set_overlay(&u, Some("in editor".into())).unwrap();
        std::fs::write(&path, "changed on disk").unwrap();
        assert_eq!(&*table.read(&u).unwrap(), "in editor");
        assert!(table.overrides().contains(&path));
        assert_eq!(table.open_uris(), vec![u.clone()]);

        table.set_overlay(&u, None).unwrap();
        assert_eq!(&*table.read(&u).unwrap(), "changed on disk");
        assert!(!table.overrides().contains(&path));
        assert!(table.open_uris().is_empty());
    }

    #[test]
    fn test_read_missing_file_errors() {
        let table = FileStateTable::new(SourceOverrides::new());
        let u = Url::parse("file:///definitely/not/here.toy").unwrap();
        assert!(matches!(table.read(&u), Err(QueryError::FileRead { .. })));
    }

    #[test]
    fn test_invalidate_keeps_overlay() {
        let table = FileStateTable::new(SourceOverrides::new());
        let u = Url::parse("file:///w/a/a.toy").unwrap();
        table.set_overlay(&u, Some("edited".into())).unwrap();

        assert!(table.invalidate(&u));
        let view = table.get_file(&u).unwrap();
        assert_eq!(view.content.as_deref(), Some("edited"));
        assert_eq!(view.provenance, Provenance::OpenedByEditor);

        let untracked = Url::parse("file:///w/a/other.toy").unwrap();
        assert!(!table.invalidate(&untracked));
    }

    #[tokio::test]
    async fn test_ensure_parsed_populates_all_files_of_load() {
        let dir = tempfile::tempdir().unwrap();
        let unit = unit_with_trees(dir.path(), &["a.toy", "b.toy", "c.toy"]);
        let loader = loader(vec![unit]);
        let table = FileStateTable::new(SourceOverrides::new());

        let parsed = table
            .ensure_parsed(&uri(&dir.path().join("a.toy")), &loader)
            .await
            .unwrap();
        assert_eq!(parsed.tree().path, dir.path().join("a.toy"));

        // Siblings were populated by the same load
        let b = table.parsed(&uri(&dir.path().join("b.toy"))).unwrap();
        assert_eq!(b.tree_index, 1);
        table
            .ensure_parsed(&uri(&dir.path().join("c.toy")), &loader)
            .await
            .unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        let view = table.get_file(&uri(&dir.path().join("b.toy"))).unwrap();
        assert_eq!(view.provenance, Provenance::FromCache);
        assert_eq!(view.content.as_deref(), Some("package a // b.toy\n"));
    }

    #[tokio::test]
    async fn test_forget_parsed_under_keeps_overlays_and_cache_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let unit = unit_with_trees(dir.path(), &["a.toy", "b.toy"]);
        let loader = loader(vec![unit]);
        let table = FileStateTable::new(SourceOverrides::new());
        let a = uri(&dir.path().join("a.toy"));
        let b = uri(&dir.path().join("b.toy"));
        let outside = Url::parse("file:///elsewhere/c.toy").unwrap();

        table.set_overlay(&b, Some("package a // edited".into())).unwrap();
        table.ensure_parsed(&a, &loader).await.unwrap();
        table.get_file(&outside).unwrap();

        assert_eq!(table.forget_parsed_under(dir.path()), 2);
        assert!(table.parsed(&a).is_none());
        assert!(table.parsed(&b).is_none());

        let view = table.get_file(&a).unwrap();
        assert_eq!(view.provenance, Provenance::FromCache);
        assert!(view.content.is_none());
        let view = table.get_file(&b).unwrap();
        assert_eq!(view.provenance, Provenance::OpenedByEditor);
        assert_eq!(view.content.as_deref(), Some("package a // edited"));

        assert_eq!(table.forget_parsed_under(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_populate_does_not_clobber_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let unit = unit_with_trees(dir.path(), &["a.toy"]);
        let table = FileStateTable::new(SourceOverrides::new());
        let u = uri(&dir.path().join("a.toy"));

        table.set_overlay(&u, Some("package a // edited".into())).unwrap();
        table.populate(&[unit], table.revision());

        let view = table.get_file(&u).unwrap();
        assert_eq!(view.content.as_deref(), Some("package a // edited"));
        assert_eq!(view.provenance, Provenance::OpenedByEditor);
        assert!(view.parsed.is_some());
    }

    #[tokio::test]
    async fn test_populate_skips_files_changed_during_load() {
        let dir = tempfile::tempdir().unwrap();
        let unit = unit_with_trees(dir.path(), &["a.toy"]);
        let table = FileStateTable::new(SourceOverrides::new());
        let u = uri(&dir.path().join("a.toy"));

        let since = table.revision();
        table.set_overlay(&u, Some("newer".into())).unwrap();
        assert_eq!(table.populate(&[unit], since), 0);
        assert!(table.parsed(&u).is_none());
    }

    #[tokio::test]
    async fn test_ensure_parsed_no_units() {
        let table = FileStateTable::new(SourceOverrides::new());
        let u = Url::parse("file:///w/a/a.toy").unwrap();
        let err = table.ensure_parsed(&u, &loader(Vec::new())).await.unwrap_err();
        assert!(matches!(err, QueryError::NoBuildUnit(_)));
    }

    #[tokio::test]
    async fn test_ensure_parsed_unit_without_trees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.toy");
        let unit = Arc::new(UnitRecord::builder("M/a", "M/a").file(path.clone()).build());
        let table = FileStateTable::new(SourceOverrides::new());

        let err = table
            .ensure_parsed(&uri(&path), &loader(vec![unit]))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NoSyntaxTrees(_)));
    }

    #[test]
    fn test_offset_and_position_conversion() {
        let table = FileStateTable::new(SourceOverrides::new());
        let u = Url::parse("file:///w/a/a.toy").unwrap();
        // "é" is two UTF-8 bytes and one UTF-16 unit; "😀" is four and two
        table
            .set_overlay(&u, Some("package a\nvar é = 1\n😀x\n".into()))
            .unwrap();

        assert_eq!(table.offset_at(&u, 0, 0).unwrap(), 0);
        assert_eq!(table.offset_at(&u, 1, 4).unwrap(), 14);
        assert_eq!(table.offset_at(&u, 1, 6).unwrap(), 17);
        assert_eq!(table.offset_at(&u, 2, 2).unwrap(), 25);
        assert_eq!(table.position_at(&u, 25).unwrap(), (2, 2));
        assert_eq!(table.position_at(&u, 17).unwrap(), (1, 6));
        // Past the end clamps
        assert_eq!(table.offset_at(&u, 99, 0).unwrap(), 27);
    }
}
