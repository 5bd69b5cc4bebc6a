//! Toy compiler front end for tests and benchmarks.
//!
//! The language is line based, one statement per line:
//!
//! ```text
//! package a
//! import "example.com/m/b"
//! func Hello
//! var X = b.Hello
//! ```
//!
//! Every directory holding `.toy` files is one unit; `_test.toy` files add a
//! test variant sharing the import path. Import paths come from the nearest
//! `go.mod` (module path plus relative directory), from the builtin root, or
//! from the path below a legacy `src` directory. A malformed line stops
//! parsing of its file: later lines produce no nodes and the root node ends
//! at the last good statement. Import cycles are cut with a shallow record
//! of the unit already being built.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

use crate::builder::parse_module_path;
use crate::config::{DEFAULT_EXCLUDED_DIRS, DEFAULT_MODULE_FILE};
use crate::loader::{LoadPattern, LoadRequest, ModuleInfo, ModuleMetadataSource, PackageLoader};
use crate::unit::{
    DiagnosticSeverity, Location, NodeKind, Span, Symbol, SymbolId, SymbolKind, SymbolTable,
    SyntaxTree, UnitDiagnostic, UnitRecord,
};

pub const TOY_EXTENSION: &str = "toy";
pub const BUILTIN_IMPORT: &str = "builtin";

type Token = (usize, String);

#[derive(Debug, Clone)]
enum Expr {
    Qualified { pkg: Token, name: Token },
    Name(Token),
    Number(Token),
}

#[derive(Debug, Clone)]
enum Stmt {
    Package { kw: usize, name: Token },
    Import { kw: usize, path: Token },
    Func { kw: usize, name: Token },
    Var { kw: usize, name: Token, eq: usize, value: Expr },
}

#[derive(Debug)]
struct Line {
    span: Span,
    stmt: Stmt,
}

#[derive(Debug)]
struct ParsedFile {
    path: PathBuf,
    source: Arc<str>,
    lines: Vec<Line>,
    error: Option<(Span, String)>,
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn tokenize(text: &str, base: usize) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                tokens.push((base + s, text[s..i].to_string()));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push((base + s, text[s..].to_string()));
    }
    tokens
}

fn parse_expr(token: &Token) -> Option<Expr> {
    let (off, text) = token;
    if let Some((pkg, name)) = text.split_once('.') {
        if is_ident(pkg) && is_ident(name) {
            return Some(Expr::Qualified {
                pkg: (*off, pkg.to_string()),
                name: (off + pkg.len() + 1, name.to_string()),
            });
        }
        return None;
    }
    if is_ident(text) {
        return Some(Expr::Name(token.clone()));
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        return Some(Expr::Number(token.clone()));
    }
    None
}

fn parse_stmt(tokens: &[Token]) -> Option<Stmt> {
    match tokens {
        [(kw, k), name] if k == "package" && is_ident(&name.1) => Some(Stmt::Package {
            kw: *kw,
            name: name.clone(),
        }),
        [(kw, k), path] if k == "import" => {
            let lit = &path.1;
            if lit.len() >= 2 && lit.starts_with('"') && lit.ends_with('"') {
                Some(Stmt::Import {
                    kw: *kw,
                    path: path.clone(),
                })
            } else {
                None
            }
        }
        [(kw, k), name] if k == "func" && is_ident(&name.1) => Some(Stmt::Func {
            kw: *kw,
            name: name.clone(),
        }),
        [(kw, k), name, (eq, e), value] if k == "var" && e == "=" && is_ident(&name.1) => {
            Some(Stmt::Var {
                kw: *kw,
                name: name.clone(),
                eq: *eq,
                value: parse_expr(value)?,
            })
        }
        _ => None,
    }
}

fn parse_file(path: &Path, source: Arc<str>) -> ParsedFile {
    let mut lines = Vec::new();
    let mut error = None;
    let mut offset = 0;

    for raw in source.split_inclusive('\n') {
        let line_start = offset;
        offset += raw.len();
        let text = raw.trim_end_matches(['\n', '\r']);
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        let tokens = tokenize(text, line_start);
        match parse_stmt(&tokens) {
            Some(stmt) => {
                let start = tokens.first().map(|t| t.0).unwrap_or(line_start);
                let end = tokens.last().map(|t| t.0 + t.1.len()).unwrap_or(line_start);
                lines.push(Line {
                    span: Span::new(start, end),
                    stmt,
                });
            }
            None => {
                error = Some((
                    Span::new(line_start, line_start + text.len()),
                    format!("syntax error: unexpected {:?}", trimmed),
                ));
                break;
            }
        }
    }

    ParsedFile {
        path: path.to_path_buf(),
        source,
        lines,
        error,
    }
}

fn token_span(token: &Token) -> Span {
    Span::new(token.0, token.0 + token.1.len())
}

fn build_tree(file: &ParsedFile) -> SyntaxTree {
    let end = file.lines.last().map(|l| l.span.end).unwrap_or(0);
    let mut tree =
        SyntaxTree::new(file.path.clone(), Span::new(0, end)).with_source(file.source.clone());
    let root = tree.root();

    for line in &file.lines {
        let decl = tree.push(root, NodeKind::Decl, line.span, None);
        let keyword = |tree: &mut SyntaxTree, kw: usize, len: usize| {
            tree.push(decl, NodeKind::Keyword, Span::new(kw, kw + len), None);
        };
        let ident = |tree: &mut SyntaxTree, parent, token: &Token| {
            tree.push(parent, NodeKind::Ident, token_span(token), Some(token.1.clone()));
        };
        match &line.stmt {
            Stmt::Package { kw, name } => {
                keyword(&mut tree, *kw, "package".len());
                ident(&mut tree, decl, name);
            }
            Stmt::Import { kw, path } => {
                keyword(&mut tree, *kw, "import".len());
                tree.push(decl, NodeKind::Literal, token_span(path), Some(path.1.clone()));
            }
            Stmt::Func { kw, name } => {
                keyword(&mut tree, *kw, "func".len());
                ident(&mut tree, decl, name);
            }
            Stmt::Var {
                kw,
                name,
                eq,
                value,
            } => {
                keyword(&mut tree, *kw, "var".len());
                ident(&mut tree, decl, name);
                tree.push(decl, NodeKind::Punct, Span::new(*eq, eq + 1), None);
                match value {
                    Expr::Qualified { pkg, name } => {
                        let span = Span::new(pkg.0, name.0 + name.1.len());
                        let expr = tree.push(decl, NodeKind::Expr, span, None);
                        ident(&mut tree, expr, pkg);
                        let dot = pkg.0 + pkg.1.len();
                        tree.push(expr, NodeKind::Punct, Span::new(dot, dot + 1), None);
                        ident(&mut tree, expr, name);
                    }
                    Expr::Name(token) => ident(&mut tree, decl, token),
                    Expr::Number(token) => {
                        tree.push(decl, NodeKind::Literal, token_span(token), Some(token.1.clone()));
                    }
                }
            }
        }
    }
    tree
}

fn join_import(base: &str, rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        parts.join("/")
    } else {
        format!("{}/{}", base, parts.join("/"))
    }
}

fn is_excluded_name(name: &str) -> bool {
    DEFAULT_EXCLUDED_DIRS.contains(&name)
}

fn toy_files(dir: &Path, include_tests: bool) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == TOY_EXTENSION).unwrap_or(false))
        .filter(|p| include_tests || !is_test_file(p))
        .collect();
    files.sort();
    files
}

fn is_test_file(path: &Path) -> bool {
    path.file_stem()
        .map(|s| s.to_string_lossy().ends_with("_test"))
        .unwrap_or(false)
}

/// Directories under `root` holding toy files, skipping nested modules.
fn package_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            !is_excluded_name(&e.file_name().to_string_lossy())
                && !e.path().join(DEFAULT_MODULE_FILE).is_file()
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .filter(|d| !toy_files(d, true).is_empty())
        .collect();
    dirs.sort();
    dirs
}

/// Per-load state: parsed packages by import path and the build stack.
struct LoadSession<'a> {
    builtin_root: Option<&'a Path>,
    overrides: &'a HashMap<PathBuf, Arc<str>>,
    /// (module root, module path), longest module path first
    modules: Vec<(PathBuf, String)>,
    legacy_src: Option<PathBuf>,
    memo: HashMap<String, Arc<UnitRecord>>,
    stack: Vec<String>,
}

impl<'a> LoadSession<'a> {
    fn new(
        root: &Path,
        builtin_root: Option<&'a Path>,
        overrides: &'a HashMap<PathBuf, Arc<str>>,
    ) -> Self {
        let mut modules: Vec<(PathBuf, String)> = Vec::new();
        let mut add_module = |dir: &Path| {
            let Ok(content) = std::fs::read_to_string(dir.join(DEFAULT_MODULE_FILE)) else {
                return;
            };
            if let Some(path) = parse_module_path(&content) {
                if !modules.iter().any(|(d, _)| d == dir) {
                    modules.push((dir.to_path_buf(), path));
                }
            }
        };
        for ancestor in root.ancestors() {
            add_module(ancestor);
        }
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_excluded_name(&e.file_name().to_string_lossy()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy() == DEFAULT_MODULE_FILE)
        {
            if let Some(dir) = entry.path().parent() {
                add_module(dir);
            }
        }
        modules.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));

        let legacy_src = root
            .ancestors()
            .find(|a| a.file_name().map(|n| n == "src").unwrap_or(false))
            .map(Path::to_path_buf);

        Self {
            builtin_root,
            overrides,
            modules,
            legacy_src,
            memo: HashMap::new(),
            stack: Vec::new(),
        }
    }

    fn import_path_for(&self, dir: &Path) -> Option<String> {
        if let Some(builtin) = self.builtin_root {
            if let Ok(rel) = dir.strip_prefix(builtin) {
                return Some(join_import(BUILTIN_IMPORT, rel));
            }
        }
        // Nearest enclosing module wins
        let owner = self
            .modules
            .iter()
            .filter(|(root, _)| dir.starts_with(root))
            .max_by_key(|(root, _)| root.components().count());
        if let Some((root, path)) = owner {
            let rel = dir.strip_prefix(root).ok()?;
            return Some(join_import(path, rel));
        }
        let src = self.legacy_src.as_ref()?;
        let rel = dir.strip_prefix(src).ok()?;
        Some(join_import("", rel)).filter(|p| !p.is_empty())
    }

    fn dir_for_import(&self, import_path: &str) -> Option<PathBuf> {
        if import_path == BUILTIN_IMPORT {
            return self.builtin_root.map(Path::to_path_buf);
        }
        if let Some(rest) = import_path.strip_prefix("builtin/") {
            return self.builtin_root.map(|b| b.join(rest));
        }
        for (root, path) in &self.modules {
            if import_path == path {
                return Some(root.clone());
            }
            if let Some(rest) = import_path.strip_prefix(path.as_str()) {
                if let Some(rest) = rest.strip_prefix('/') {
                    return Some(root.join(rest));
                }
            }
        }
        self.legacy_src.as_ref().map(|src| src.join(import_path))
    }

    fn content(&self, path: &Path) -> Result<Arc<str>> {
        if let Some(content) = self.overrides.get(path) {
            return Ok(content.clone());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Arc::from(text))
    }

    fn builtin_unit(&mut self) -> Result<Option<Arc<UnitRecord>>> {
        match self.builtin_root {
            Some(root) => self.build(root, false, false),
            None => Ok(None),
        }
    }

    /// Build the unit for `dir`.
    ///
    /// `shallow` builds skip import resolution; they stand in for a unit
    /// that is already on the build stack.
    fn build(
        &mut self,
        dir: &Path,
        include_tests: bool,
        shallow: bool,
    ) -> Result<Option<Arc<UnitRecord>>> {
        let Some(import_path) = self.import_path_for(dir) else {
            return Ok(None);
        };
        if !include_tests && !shallow {
            if let Some(unit) = self.memo.get(&import_path) {
                return Ok(Some(unit.clone()));
            }
        }
        let files = toy_files(dir, include_tests);
        if files.is_empty() {
            return Ok(None);
        }

        let mut parsed = Vec::with_capacity(files.len());
        for file in &files {
            parsed.push(parse_file(file, self.content(file)?));
        }

        let mut diagnostics = Vec::new();
        let mut imports: Vec<Arc<UnitRecord>> = Vec::new();
        if !shallow {
            self.stack.push(import_path.clone());
            for file in &parsed {
                for line in &file.lines {
                    let Stmt::Import { path, .. } = &line.stmt else {
                        continue;
                    };
                    let target = path.1.trim_matches('"');
                    let unit = match self.dir_for_import(target) {
                        Some(target_dir) => {
                            let cycle = self.stack.iter().any(|s| s == target);
                            self.build(&target_dir, false, cycle)?
                        }
                        None => None,
                    };
                    match unit {
                        Some(unit) => imports.push(unit),
                        None => diagnostics.push(UnitDiagnostic {
                            location: Some(Location::new(file.path.clone(), token_span(path))),
                            severity: DiagnosticSeverity::Error,
                            message: format!("could not import {}", target),
                        }),
                    }
                }
            }
            if import_path != BUILTIN_IMPORT && !import_path.starts_with("builtin/") {
                if let Some(builtin) = self.builtin_unit()? {
                    imports.push(builtin);
                }
            }
            self.stack.pop();
        }

        let symbols = resolve_symbols(&import_path, &parsed, &imports, &mut diagnostics);

        let id = if include_tests {
            format!("{} [{}.test]", import_path, import_path)
        } else {
            import_path.clone()
        };
        let mut builder = UnitRecord::builder(id, import_path.clone()).symbols(symbols);
        for file in &parsed {
            builder = builder.tree(build_tree(file));
            if let Some((span, message)) = &file.error {
                builder = builder.diagnostic(UnitDiagnostic {
                    location: Some(Location::new(file.path.clone(), *span)),
                    severity: DiagnosticSeverity::Error,
                    message: message.clone(),
                });
            }
        }
        for diagnostic in diagnostics {
            builder = builder.diagnostic(diagnostic);
        }
        for import in imports {
            builder = builder.import(import);
        }

        let unit = Arc::new(builder.build());
        if !include_tests && !shallow {
            self.memo.insert(import_path, unit.clone());
        }
        Ok(Some(unit))
    }

    /// The primary unit of `dir` plus its test variant, if any.
    fn load_dir(&mut self, dir: &Path) -> Result<Vec<Arc<UnitRecord>>> {
        let mut units = Vec::new();
        if let Some(unit) = self.build(dir, false, false)? {
            units.push(unit);
        }
        if toy_files(dir, true).iter().any(|f| is_test_file(f)) {
            if let Some(unit) = self.build(dir, true, false)? {
                units.push(unit);
            }
        }
        Ok(units)
    }
}

fn resolve_symbols(
    import_path: &str,
    files: &[ParsedFile],
    imports: &[Arc<UnitRecord>],
    diagnostics: &mut Vec<UnitDiagnostic>,
) -> SymbolTable {
    let mut table = SymbolTable::new();
    let mut local: HashMap<String, Symbol> = HashMap::new();

    for file in files {
        for line in &file.lines {
            let (name, kind) = match &line.stmt {
                Stmt::Func { name, .. } => (name, SymbolKind::Function),
                Stmt::Var { name, .. } => (name, SymbolKind::Variable),
                _ => continue,
            };
            let symbol = Symbol {
                id: SymbolId(format!("{}.{}", import_path, name.1)),
                name: name.1.clone(),
                kind,
                package: import_path.to_string(),
                decl: Some(Location::new(file.path.clone(), token_span(name))),
            };
            let ty = match &line.stmt {
                Stmt::Func { .. } => "func()",
                Stmt::Var {
                    value: Expr::Number(_),
                    ..
                } => "int",
                _ => "any",
            };
            table.set_type(symbol.id.clone(), ty);
            table.define(symbol.clone());
            local.insert(symbol.name.clone(), symbol);
        }
    }

    let by_alias: HashMap<&str, &Arc<UnitRecord>> = imports
        .iter()
        .map(|u| (u.import_path.rsplit('/').next().unwrap_or(&u.import_path), u))
        .collect();
    let builtin = imports.iter().find(|u| u.import_path == BUILTIN_IMPORT);
    let exported = |unit: &UnitRecord, name: &str| {
        unit.symbols
            .declared_in(&unit.import_path)
            .find(|s| s.name == name)
            .cloned()
    };

    for file in files {
        for line in &file.lines {
            let Stmt::Var { value, .. } = &line.stmt else {
                continue;
            };
            let (token, target) = match value {
                Expr::Qualified { pkg, name } => (
                    name,
                    by_alias
                        .get(pkg.1.as_str())
                        .and_then(|u| exported(u, &name.1)),
                ),
                Expr::Name(token) => (
                    token,
                    local
                        .get(&token.1)
                        .cloned()
                        .or_else(|| builtin.and_then(|b| exported(b, &token.1))),
                ),
                Expr::Number(_) => continue,
            };
            let at = Location::new(file.path.clone(), token_span(token));
            match target {
                Some(symbol) => table.add_use(at, symbol),
                None => diagnostics.push(UnitDiagnostic {
                    location: Some(at),
                    severity: DiagnosticSeverity::Error,
                    message: format!("undefined: {}", token.1),
                }),
            }
        }
    }
    table
}

/// In-process `PackageLoader` over toy sources, with call counters.
#[derive(Debug, Default)]
pub struct ToyLoader {
    builtin_root: Option<PathBuf>,
    loads: AtomicUsize,
    list_invalidations: AtomicUsize,
    fail: AtomicBool,
}

impl ToyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader that adds `root`'s unit as an implicit import of every unit.
    pub fn with_builtin(root: &Path) -> Self {
        Self {
            builtin_root: Some(root.to_path_buf()),
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn list_invalidations(&self) -> usize {
        self.list_invalidations.load(Ordering::SeqCst)
    }

    /// Make every following load fail until reset.
    pub fn fail_next_loads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PackageLoader for ToyLoader {
    async fn load(&self, request: LoadRequest) -> Result<Vec<Arc<UnitRecord>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("toy loader failure for {}", request.pattern));
        }

        let dirs = match &request.pattern {
            LoadPattern::Directory(dir) => vec![dir.clone()],
            LoadPattern::Recursive(dir) => package_dirs(dir),
            LoadPattern::ImportPrefix(_) => package_dirs(&request.root),
        };

        let mut session =
            LoadSession::new(&request.root, self.builtin_root.as_deref(), &request.overrides);
        let mut units = Vec::new();
        for dir in dirs {
            units.extend(session.load_dir(&dir)?);
        }
        Ok(units)
    }

    fn invalidate_list_cache(&self) {
        self.list_invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// `ModuleMetadataSource` answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticModules {
    modules: Mutex<HashMap<PathBuf, Vec<ModuleInfo>>>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, root: &Path, modules: Vec<ModuleInfo>) {
        if let Ok(mut table) = self.modules.lock() {
            table.insert(root.to_path_buf(), modules);
        }
    }
}

#[async_trait]
impl ModuleMetadataSource for StaticModules {
    async fn modules(&self, root: &Path) -> Result<Vec<ModuleInfo>> {
        let table = self
            .modules
            .lock()
            .map_err(|_| anyhow!("module table poisoned"))?;
        Ok(table.get(root).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ToyWorkspace;

    fn request(root: &Path, pattern: LoadPattern) -> LoadRequest {
        LoadRequest {
            root: root.to_path_buf(),
            pattern,
            overrides: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_stops_at_syntax_error() {
        let source: Arc<str> = Arc::from("package a\nfunc A\nfunc (\nfunc B\n");
        let parsed = parse_file(Path::new("/w/a/a.toy"), source);
        assert_eq!(parsed.lines.len(), 2);
        assert!(parsed.error.is_some());

        let tree = build_tree(&parsed);
        assert_eq!(tree.node(tree.root()).span, Span::new(0, 16));
    }

    #[test]
    fn test_tokenize_offsets() {
        let tokens = tokenize("var  X = b.B", 10);
        assert_eq!(
            tokens,
            vec![
                (10, "var".to_string()),
                (15, "X".to_string()),
                (17, "=".to_string()),
                (19, "b.B".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_load_module_graph() {
        let builtin = ToyWorkspace::builtin(&["package builtin", "func len"]);
        let ws = ToyWorkspace::new("example.com/m")
            .package(
                "a",
                &["package a", "import \"example.com/m/b\"", "var X = b.B", "var N = len"],
            )
            .package("b", &["package b", "func B"])
            .write();
        let loader = ToyLoader::with_builtin(builtin.root());

        let units = loader
            .load(request(ws.root(), LoadPattern::Recursive(ws.root().to_path_buf())))
            .await
            .unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["example.com/m/a", "example.com/m/b"]);

        let a = &units[0];
        assert!(a.diagnostics.is_empty(), "{:?}", a.diagnostics);
        assert_eq!(
            a.imports.keys().collect::<Vec<_>>(),
            vec!["example.com/m/b", "builtin"]
        );
        // The same record is shared by both importers
        assert!(Arc::ptr_eq(&a.imports["example.com/m/b"], &units[1]));
        assert!(Arc::ptr_eq(&a.imports["builtin"], &units[1].imports["builtin"]));
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_load_cuts_cycles() {
        let ws = ToyWorkspace::new("example.com/m")
            .package("a", &["package a", "import \"example.com/m/b\"", "func A"])
            .package("b", &["package b", "import \"example.com/m/a\"", "var X = a.A"])
            .write();
        let units = ToyLoader::new()
            .load(request(ws.root(), LoadPattern::Directory(ws.root().join("a"))))
            .await
            .unwrap();

        let a = &units[0];
        let b = &a.imports["example.com/m/b"];
        let a_again = &b.imports["example.com/m/a"];
        assert_eq!(a_again.id, a.id);
        assert!(a_again.imports.is_empty());
        // The use of a.A still resolves through the shallow record
        assert!(b.diagnostics.is_empty(), "{:?}", b.diagnostics);
    }

    #[tokio::test]
    async fn test_overrides_and_test_variants() {
        let ws = ToyWorkspace::new("example.com/m")
            .package("a", &["package a", "func A"])
            .write();
        std::fs::write(ws.root().join("a/a_test.toy"), "package a\nfunc TestA\n").unwrap();

        let mut req = request(ws.root(), LoadPattern::Directory(ws.root().join("a")));
        req.overrides
            .insert(ws.file("a"), Arc::from("package a\nfunc Edited\n"));
        let units = ToyLoader::new().load(req).await.unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[1].id.as_str(), "example.com/m/a [example.com/m/a.test]");
        assert_eq!(units[1].import_path, "example.com/m/a");
        assert_eq!(units[0].files.len(), 1);
        assert_eq!(units[1].files.len(), 2);
        assert!(units[0]
            .symbols
            .declared_in("example.com/m/a")
            .any(|s| s.name == "Edited"));
    }

    #[tokio::test]
    async fn test_unresolved_import_is_diagnostic() {
        let ws = ToyWorkspace::new("example.com/m")
            .package("a", &["package a", "import \"example.com/gone\""])
            .write();
        let units = ToyLoader::new()
            .load(request(ws.root(), LoadPattern::Directory(ws.root().join("a"))))
            .await
            .unwrap();
        assert_eq!(units[0].diagnostics.len(), 1);
        assert!(units[0].diagnostics[0].message.contains("could not import"));
    }
}
