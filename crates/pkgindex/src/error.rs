//
// error.rs
//
// Typed errors for workspace layout and per-query resolution
//

use std::path::PathBuf;

use crate::unit::NodeKind;

/// Problems with the shape of a workspace root. Fatal to that root's
/// builder only.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("root {0} is outside any recognized workspace layout")]
    OutsideKnownLayout(PathBuf),
    #[error("malformed module file {path}: {reason}")]
    MalformedModuleFile { path: PathBuf, reason: String },
}

/// Expected failures of a single query. Returned to the caller, never
/// logged as system failures.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no node found at position")]
    NoNodeFound,
    #[error("invalid node kind at position: {0}")]
    InvalidNodeKind(NodeKind),
    #[error("no build unit found for path {0}")]
    NoBuildUnit(PathBuf),
    #[error("file has no syntax trees: {0}")]
    NoSyntaxTrees(PathBuf),
    #[error("not a file URI: {0}")]
    NotAFileUri(String),
    #[error("no symbol {0} found")]
    SymbolNotFound(String),
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("load failed for {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },
}

pub type QueryResult<T> = Result<T, QueryError>;
