//! Shared helpers for unit tests and benchmarks.

pub mod fixture_workspace;
pub mod toy_frontend;

pub use fixture_workspace::{
    advance_dir_mtime, create_fixture_workspace, dir_mtime, FixtureConfig, ToyFixture,
    ToyWorkspace,
};
pub use toy_frontend::{StaticModules, ToyLoader};
