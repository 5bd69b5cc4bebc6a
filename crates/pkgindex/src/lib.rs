//
// lib.rs
//
// Workspace package cache and invalidation engine for language servers
//

pub mod builder;
pub mod config;
pub mod error;
pub mod file_state;
pub mod loader;
pub mod messages;
pub mod navigator;
pub mod perf;
pub mod store;
pub mod unit;
pub mod watcher;
pub mod workspace;

// test_utils is available in test builds and when the `test-support` feature is enabled.
// This allows benchmarks to import the toy front end directly.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;


pub use error::{LayoutError, QueryError, QueryResult};
pub use workspace::{Collaborators, WorkspaceMode, WorkspaceSession};
