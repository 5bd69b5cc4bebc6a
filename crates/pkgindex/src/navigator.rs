//
// navigator.rs
//
// Position and symbol resolution over the unit import graph
//

use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use crate::error::{QueryError, QueryResult};
use crate::unit::{Location, NodeId, NodeKind, Span, Symbol, SyntaxNode, SyntaxTree, UnitId, UnitRecord};

/// A node inside a specific unit's syntax forest.
#[derive(Debug, Clone)]
pub struct NodeRef {
    pub unit: Arc<UnitRecord>,
    pub tree: usize,
    pub node: NodeId,
}

impl NodeRef {
    pub fn tree(&self) -> &SyntaxTree {
        &self.unit.syntax[self.tree]
    }

    pub fn syntax(&self) -> &SyntaxNode {
        self.tree().node(self.node)
    }

    pub fn kind(&self) -> &NodeKind {
        &self.syntax().kind
    }

    pub fn span(&self) -> Span {
        self.syntax().span
    }

    pub fn location(&self) -> Location {
        Location::new(self.tree().path.clone(), self.span())
    }
}

#[derive(Debug, Clone)]
pub struct Enclosing {
    pub node: NodeRef,
    /// The node's span equals the query range exactly
    pub exact: bool,
}

#[derive(Debug, Clone)]
pub struct Definition {
    pub unit: Arc<UnitRecord>,
    pub location: Location,
    pub symbol: Symbol,
}

/// Breadth-first walk over `unit` and its imports, each unit at most once.
///
/// `visit` receives the unit and its import distance from `unit`. Units
/// deeper than `max_depth` are not visited.
pub fn walk_imports<F>(unit: &Arc<UnitRecord>, max_depth: usize, mut visit: F)
where
    F: FnMut(&Arc<UnitRecord>, usize) -> ControlFlow<()>,
{
    let mut seen: HashSet<UnitId> = HashSet::new();
    let mut queue: VecDeque<(Arc<UnitRecord>, usize)> = VecDeque::new();
    seen.insert(unit.id.clone());
    queue.push_back((unit.clone(), 0));

    while let Some((current, depth)) = queue.pop_front() {
        if visit(&current, depth).is_break() {
            return;
        }
        if depth >= max_depth {
            continue;
        }
        for child in current.imports.values() {
            if seen.insert(child.id.clone()) {
                queue.push_back((child.clone(), depth + 1));
            }
        }
    }
}

/// The unit with `import_path` reachable from `unit`, nearest first.
pub fn find_import(unit: &Arc<UnitRecord>, import_path: &str) -> Option<Arc<UnitRecord>> {
    let mut found = None;
    walk_imports(unit, usize::MAX, |u, _| {
        if u.import_path == import_path {
            found = Some(u.clone());
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    found
}

/// Narrowest node of `tree` whose span contains `range`.
fn narrowest_in_tree(tree: &SyntaxTree, range: Span) -> Option<NodeId> {
    let mut current = tree.root();
    if !tree.node(current).span.contains(range) {
        return None;
    }
    // Each step moves strictly deeper, so the arena size bounds the loop
    for _ in 0..tree.len() {
        let next = tree
            .node(current)
            .children
            .iter()
            .copied()
            .find(|c| tree.node(*c).span.contains(range));
        match next {
            Some(child) => current = child,
            None => break,
        }
    }
    Some(current)
}

/// Narrowest node enclosing `range` in `file`.
///
/// Looks in `unit` first, then in its imports up to `max_depth` levels
/// away. Partial trees from files with syntax errors simply have no nodes
/// past the error, so such queries fail with `NoNodeFound`.
pub fn enclosing_node(
    unit: &Arc<UnitRecord>,
    file: &Path,
    range: Span,
    max_depth: usize,
) -> QueryResult<Enclosing> {
    let mut result = None;
    walk_imports(unit, max_depth, |u, _| {
        let Some(tree_index) = u.tree_index(file) else {
            return ControlFlow::Continue(());
        };
        match narrowest_in_tree(&u.syntax[tree_index], range) {
            Some(node) => {
                let node = NodeRef {
                    unit: u.clone(),
                    tree: tree_index,
                    node,
                };
                let exact = node.span() == range;
                result = Some(Enclosing { node, exact });
                ControlFlow::Break(())
            }
            None => ControlFlow::Continue(()),
        }
    });
    result.ok_or(QueryError::NoNodeFound)
}

/// The identifier enclosing `range`, or `InvalidNodeKind` if the position
/// lies on anything else.
pub fn identifier_at(
    unit: &Arc<UnitRecord>,
    file: &Path,
    range: Span,
    max_depth: usize,
) -> QueryResult<NodeRef> {
    let found = enclosing_node(unit, file, range, max_depth)?;
    if found.node.kind().is_name() {
        Ok(found.node)
    } else {
        Err(QueryError::InvalidNodeKind(found.node.kind().clone()))
    }
}

/// Symbol defined or referenced by `node`, defs first.
pub fn symbol_for_node(node: &NodeRef) -> Option<Symbol> {
    node.unit.symbols.object_at(&node.location()).cloned()
}

/// Name-based lookup among the symbols `unit` itself declares.
///
/// Prefers a symbol of the same kind; ties break by symbol id.
pub fn find_object(unit: &UnitRecord, symbol: &Symbol) -> Option<Symbol> {
    unit.symbols
        .declared_in(&unit.import_path)
        .filter(|s| s.name == symbol.name)
        .min_by(|a, b| {
            (a.kind != symbol.kind, &a.id).cmp(&(b.kind != symbol.kind, &b.id))
        })
        .cloned()
}

/// Declaration of `symbol` if `unit` owns its declaring file.
fn declared_here(unit: &Arc<UnitRecord>, symbol: &Symbol) -> Option<Definition> {
    let decl = symbol.decl.as_ref()?;
    unit.tree_index(&decl.file)?;
    Some(Definition {
        unit: unit.clone(),
        location: decl.clone(),
        symbol: symbol.clone(),
    })
}

/// Where `symbol` is declared, starting the search at `unit`.
///
/// Tries the declaration position in `unit`, then the unit owning the
/// symbol's package anywhere in `unit`'s import graph, then a name match
/// in that owner.
pub fn resolve_symbol_definition(unit: &Arc<UnitRecord>, symbol: &Symbol) -> QueryResult<Definition> {
    if let Some(def) = declared_here(unit, symbol) {
        return Ok(def);
    }

    let owner = if symbol.package == unit.import_path {
        Some(unit.clone())
    } else {
        find_import(unit, &symbol.package)
    };
    let Some(owner) = owner else {
        return Err(QueryError::SymbolNotFound(symbol.name.clone()));
    };

    if let Some(def) = declared_here(&owner, symbol) {
        return Ok(def);
    }
    find_object(&owner, symbol)
        .and_then(|found| declared_here(&owner, &found))
        .ok_or_else(|| QueryError::SymbolNotFound(symbol.name.clone()))
}
