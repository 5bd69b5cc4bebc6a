//
// unit.rs
//
// Immutable build-unit snapshots produced by the external loader
//

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;

/// Opaque unit identity assigned by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(Arc<str>);

impl UnitId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Half-open byte range within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// True if `other` lies entirely within this span.
    pub fn contains(&self, other: Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A span in a specific file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: PathBuf,
    pub span: Span,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            file: file.into(),
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Decl,
    Ident,
    Keyword,
    Punct,
    Literal,
    Expr,
    Other(String),
}

impl NodeKind {
    pub fn is_name(&self) -> bool {
        matches!(self, NodeKind::Ident)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => f.write_str("file"),
            NodeKind::Decl => f.write_str("declaration"),
            NodeKind::Ident => f.write_str("identifier"),
            NodeKind::Keyword => f.write_str("keyword"),
            NodeKind::Punct => f.write_str("punctuation"),
            NodeKind::Literal => f.write_str("literal"),
            NodeKind::Expr => f.write_str("expression"),
            NodeKind::Other(kind) => f.write_str(kind),
        }
    }
}

/// Index of a node within its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    pub span: Span,
    /// Source text for leaf tokens (identifiers, literals)
    pub text: Option<String>,
    pub children: Vec<NodeId>,
}

/// Syntax tree for one file, stored as an arena.
#[derive(Debug, Clone)]
pub struct SyntaxTree {
    pub path: PathBuf,
    nodes: Vec<SyntaxNode>,
    root: NodeId,
    /// Content the tree was parsed from, when the loader supplies it
    pub source: Option<Arc<str>>,
}

impl SyntaxTree {
    /// Create a tree whose root is a `File` node covering `root_span`.
    pub fn new(path: impl Into<PathBuf>, root_span: Span) -> Self {
        Self {
            path: path.into(),
            nodes: vec![SyntaxNode {
                kind: NodeKind::File,
                span: root_span,
                text: None,
                children: Vec::new(),
            }],
            root: NodeId(0),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<Arc<str>>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a child node under `parent` and return its id.
    ///
    /// Children must be added in source order.
    pub fn push(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        span: Span,
        text: Option<String>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(SyntaxNode {
            kind,
            span,
            text,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Widen a node's span, used when a parent is sized after its children.
    pub fn set_span(&mut self, id: NodeId, span: Span) {
        self.nodes[id.0].span = span;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Package,
    Function,
    Variable,
    Constant,
    Type,
    Field,
    Method,
}

/// Identity of a symbol, unique across the loaded graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    pub kind: SymbolKind,
    /// Import path of the unit that declares the symbol
    pub package: String,
    /// Declaration site; `None` for builtins without source
    pub decl: Option<Location>,
}

/// Name/position to symbol mapping for one unit.
///
/// `objects` contains every symbol the unit defines or references,
/// including symbols declared by imported units.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    defs: HashMap<Location, SymbolId>,
    uses: HashMap<Location, SymbolId>,
    objects: HashMap<SymbolId, Symbol>,
    types: HashMap<SymbolId, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declaration; its `decl` location becomes a def key.
    pub fn define(&mut self, symbol: Symbol) {
        if let Some(decl) = &symbol.decl {
            self.defs.insert(decl.clone(), symbol.id.clone());
        }
        self.objects.insert(symbol.id.clone(), symbol);
    }

    /// Record a reference at `at` to `symbol`, which may be foreign.
    pub fn add_use(&mut self, at: Location, symbol: Symbol) {
        self.uses.insert(at, symbol.id.clone());
        self.objects.entry(symbol.id.clone()).or_insert(symbol);
    }

    pub fn set_type(&mut self, id: SymbolId, ty: impl Into<String>) {
        self.types.insert(id, ty.into());
    }

    pub fn def_at(&self, at: &Location) -> Option<&Symbol> {
        self.defs.get(at).and_then(|id| self.objects.get(id))
    }

    pub fn use_at(&self, at: &Location) -> Option<&Symbol> {
        self.uses.get(at).and_then(|id| self.objects.get(id))
    }

    /// Symbol defined or referenced at `at`, defs first.
    pub fn object_at(&self, at: &Location) -> Option<&Symbol> {
        self.def_at(at).or_else(|| self.use_at(at))
    }

    pub fn object(&self, id: &SymbolId) -> Option<&Symbol> {
        self.objects.get(id)
    }

    pub fn type_of(&self, id: &SymbolId) -> Option<&str> {
        self.types.get(id).map(String::as_str)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Symbol> {
        self.objects.values()
    }

    /// Symbols whose declaring package is `package`.
    pub fn declared_in<'a>(&'a self, package: &'a str) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.objects.values().filter(move |s| s.package == package)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDiagnostic {
    pub location: Option<Location>,
    pub severity: DiagnosticSeverity,
    pub message: String,
}

/// Snapshot of one build unit.
///
/// Never mutated after construction: replacing a unit means publishing a
/// new `Arc<UnitRecord>` under the same keys.
#[derive(Debug)]
pub struct UnitRecord {
    pub id: UnitId,
    pub import_path: String,
    pub files: Vec<PathBuf>,
    pub syntax: Vec<SyntaxTree>,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<UnitDiagnostic>,
    /// Direct imports in loader order, shared with every other importer
    pub imports: IndexMap<String, Arc<UnitRecord>>,
}

impl UnitRecord {
    pub fn builder(id: impl Into<UnitId>, import_path: impl Into<String>) -> UnitRecordBuilder {
        UnitRecordBuilder {
            id: id.into(),
            import_path: import_path.into(),
            files: Vec::new(),
            syntax: Vec::new(),
            symbols: SymbolTable::new(),
            diagnostics: Vec::new(),
            imports: IndexMap::new(),
        }
    }

    /// Index of the syntax tree for `path`, if this unit owns that file.
    pub fn tree_index(&self, path: &Path) -> Option<usize> {
        self.syntax.iter().position(|t| t.path == path)
    }

    pub fn tree_for(&self, path: &Path) -> Option<&SyntaxTree> {
        self.tree_index(path).map(|i| &self.syntax[i])
    }

    /// Directory of the first source file.
    pub fn primary_dir(&self) -> Option<&Path> {
        self.files.first().and_then(|f| f.parent())
    }

    pub fn owns_file(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f == path)
    }
}

pub struct UnitRecordBuilder {
    id: UnitId,
    import_path: String,
    files: Vec<PathBuf>,
    syntax: Vec<SyntaxTree>,
    symbols: SymbolTable,
    diagnostics: Vec<UnitDiagnostic>,
    imports: IndexMap<String, Arc<UnitRecord>>,
}

impl UnitRecordBuilder {
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Add a syntax tree; its path is appended to the file list if missing.
    pub fn tree(mut self, tree: SyntaxTree) -> Self {
        if !self.files.contains(&tree.path) {
            self.files.push(tree.path.clone());
        }
        self.syntax.push(tree);
        self
    }

    pub fn symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn diagnostic(mut self, diagnostic: UnitDiagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }

    pub fn import(mut self, unit: Arc<UnitRecord>) -> Self {
        self.imports.insert(unit.import_path.clone(), unit);
        self
    }

    pub fn build(self) -> UnitRecord {
        UnitRecord {
            id: self.id,
            import_path: self.import_path,
            files: self.files,
            syntax: self.syntax,
            symbols: self.symbols,
            diagnostics: self.diagnostics,
            imports: self.imports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, package: &str, decl: Option<Location>) -> Symbol {
        Symbol {
            id: SymbolId(format!("{}.{}", package, name)),
            name: name.to_string(),
            kind: SymbolKind::Function,
            package: package.to_string(),
            decl,
        }
    }

    #[test]
    fn test_span_contains() {
        let outer = Span::new(0, 10);
        assert!(outer.contains(Span::new(0, 10)));
        assert!(outer.contains(Span::new(3, 4)));
        assert!(!outer.contains(Span::new(9, 11)));
        assert!(Span::new(5, 5).is_empty());
    }

    #[test]
    fn test_tree_push_children() {
        let mut tree = SyntaxTree::new("/w/a/a.toy", Span::new(0, 20));
        let decl = tree.push(tree.root(), NodeKind::Decl, Span::new(0, 10), None);
        let ident = tree.push(decl, NodeKind::Ident, Span::new(5, 10), Some("Hello".into()));

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.node(tree.root()).children, vec![decl]);
        assert_eq!(tree.node(decl).children, vec![ident]);
        assert_eq!(tree.node(ident).text.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_symbol_table_defs_win_over_uses() {
        let at = Location::new("/w/a/a.toy", Span::new(5, 10));
        let mut table = SymbolTable::new();
        table.add_use(at.clone(), sym("Other", "M/b", None));
        table.define(sym("Hello", "M/a", Some(at.clone())));

        assert_eq!(table.object_at(&at).map(|s| s.name.as_str()), Some("Hello"));
        assert_eq!(table.use_at(&at).map(|s| s.name.as_str()), Some("Other"));
        assert_eq!(table.declared_in("M/a").count(), 1);
    }

    #[test]
    fn test_builder_tracks_tree_files() {
        let tree = SyntaxTree::new("/w/a/a.toy", Span::new(0, 1));
        let unit = UnitRecord::builder("M/a", "M/a").tree(tree).build();

        assert_eq!(unit.files, vec![PathBuf::from("/w/a/a.toy")]);
        assert_eq!(unit.primary_dir(), Some(Path::new("/w/a")));
        assert_eq!(unit.tree_index(Path::new("/w/a/a.toy")), Some(0));
        assert!(unit.tree_for(Path::new("/w/a/b.toy")).is_none());
    }
}
