//! Deterministic toy workspace generator for tests and benchmarks.
//!
//! `ToyWorkspace` writes hand-described module trees; `FixtureConfig`
//! generates synthetic ones with a controlled package count, functions per
//! package and import fan-out. All output is deterministic, so benchmarks
//! are reproducible.

use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::config::DEFAULT_MODULE_FILE;
use crate::test_utils::toy_frontend::TOY_EXTENSION;

/// A written workspace; the directory is removed on drop.
pub struct ToyFixture {
    _dir: TempDir,
    root: PathBuf,
}

impl ToyFixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory for fixture workspace");
        // Canonical so watcher paths and loader paths agree (e.g. /private/var on macOS)
        let root = dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize fixture root");
        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source file of the package in `rel_dir`, named after its last component.
    pub fn file(&self, rel_dir: &str) -> PathBuf {
        package_file(&self.root, rel_dir)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

fn package_file(root: &Path, rel_dir: &str) -> PathBuf {
    let dir = root.join(rel_dir);
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    dir.join(format!("{}.{}", name, TOY_EXTENSION))
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("Failed to create {}: {}", parent.display(), e));
    }
    std::fs::write(path, content)
        .unwrap_or_else(|e| panic!("Failed to write fixture file {}: {}", path.display(), e));
}

fn lines_to_source(lines: &[&str]) -> String {
    let mut content = String::new();
    for line in lines {
        writeln!(content, "{}", line).unwrap();
    }
    content
}

/// Builder for a module workspace described package by package.
///
/// ```ignore
/// let ws = ToyWorkspace::new("example.com/m")
///     .package("a", &["package a", "func A"])
///     .write();
/// ```
#[derive(Debug, Clone)]
pub struct ToyWorkspace {
    module_path: String,
    modules: Vec<(String, String)>,
    packages: Vec<(String, Vec<String>)>,
}

impl ToyWorkspace {
    pub fn new(module_path: &str) -> Self {
        Self {
            module_path: module_path.to_string(),
            modules: Vec::new(),
            packages: Vec::new(),
        }
    }

    /// Add a nested module root at `rel_dir`.
    pub fn module(mut self, rel_dir: &str, module_path: &str) -> Self {
        self.modules
            .push((rel_dir.to_string(), module_path.to_string()));
        self
    }

    /// Add a package in `rel_dir` with one source file.
    pub fn package(mut self, rel_dir: &str, lines: &[&str]) -> Self {
        self.packages.push((
            rel_dir.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
        self
    }

    pub fn write(self) -> ToyFixture {
        let fixture = ToyFixture::new();
        let root = fixture.root();
        write_file(
            &root.join(DEFAULT_MODULE_FILE),
            &format!("module {}\n", self.module_path),
        );
        for (rel_dir, module_path) in &self.modules {
            write_file(
                &root.join(rel_dir).join(DEFAULT_MODULE_FILE),
                &format!("module {}\n", module_path),
            );
        }
        for (rel_dir, lines) in &self.packages {
            let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
            write_file(&package_file(root, rel_dir), &lines_to_source(&lines));
        }
        fixture
    }

    /// A builtin root holding a single `builtin.toy`.
    pub fn builtin(lines: &[&str]) -> ToyFixture {
        let fixture = ToyFixture::new();
        write_file(
            &fixture.root().join(format!("builtin.{}", TOY_EXTENSION)),
            &lines_to_source(lines),
        );
        fixture
    }
}

/// Configuration for generating a synthetic module workspace.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub package_count: usize,
    pub functions_per_package: usize,
    /// Each package imports this many following packages
    pub import_fan_out: usize,
    pub module_path: String,
}

impl FixtureConfig {
    /// Small workspace: 10 packages, 5 functions each, fan-out 2.
    pub fn small() -> Self {
        Self {
            package_count: 10,
            functions_per_package: 5,
            import_fan_out: 2,
            module_path: "example.com/bench".to_string(),
        }
    }

    /// Medium workspace: 50 packages, 10 functions each, fan-out 3.
    pub fn medium() -> Self {
        Self {
            package_count: 50,
            functions_per_package: 10,
            import_fan_out: 3,
            ..Self::small()
        }
    }

    /// Large workspace: 200 packages, 20 functions each, fan-out 4.
    pub fn large() -> Self {
        Self {
            package_count: 200,
            functions_per_package: 20,
            import_fan_out: 4,
            ..Self::small()
        }
    }
}

/// Generate the source of package `index`.
///
/// Package `p{i}` imports `p{i+1}..p{i+fan_out}` and references the first
/// function of each import.
fn generate_package_source(index: usize, config: &FixtureConfig) -> String {
    let mut content = String::new();
    writeln!(content, "package p{}", index).unwrap();

    let imports: Vec<usize> = (index + 1..config.package_count)
        .take(config.import_fan_out)
        .collect();
    for dep in &imports {
        writeln!(content, "import \"{}/p{}\"", config.module_path, dep).unwrap();
    }
    content.push('\n');

    for func_i in 0..config.functions_per_package {
        writeln!(content, "func F{}_{}", index, func_i).unwrap();
    }
    if config.functions_per_package > 0 {
        for dep in &imports {
            writeln!(content, "var Use{} = p{}.F{}_0", dep, dep, dep).unwrap();
        }
    }
    content
}

/// Create a temporary module workspace from the given configuration.
///
/// Calling this twice with the same `FixtureConfig` produces byte-identical files.
pub fn create_fixture_workspace(config: &FixtureConfig) -> ToyFixture {
    let fixture = ToyFixture::new();
    write_fixture_workspace(fixture.root(), config);
    fixture
}

/// Write fixture files into an existing directory.
pub fn write_fixture_workspace(dir: &Path, config: &FixtureConfig) {
    write_file(
        &dir.join(DEFAULT_MODULE_FILE),
        &format!("module {}\n", config.module_path),
    );
    for i in 0..config.package_count {
        let rel = format!("p{}", i);
        write_file(&package_file(dir, &rel), &generate_package_source(i, config));
    }
}

/// Modification time of `dir`, if it can be read.
pub fn dir_mtime(dir: &Path) -> Option<SystemTime> {
    std::fs::metadata(dir).ok()?.modified().ok()
}

/// Touch `dir` until its modification time differs from `before`.
///
/// Filesystems with coarse timestamps can leave a directory's mtime
/// unchanged across edits made in quick succession.
pub fn advance_dir_mtime(dir: &Path, before: Option<SystemTime>) {
    let marker = dir.join(".mtime-marker");
    for _ in 0..300 {
        if dir_mtime(dir) != before {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
        write_file(&marker, "");
        let _ = std::fs::remove_file(&marker);
    }
    panic!("mtime of {} did not move", dir.display());
}
