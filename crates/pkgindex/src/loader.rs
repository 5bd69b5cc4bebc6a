//
// loader.rs
//
// Interfaces to the external build-graph loader and module metadata source
//

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::process::Command;

use crate::unit::UnitRecord;

/// Which units a load should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPattern {
    /// Every unit under a directory (`dir/...`)
    Recursive(PathBuf),
    /// Every unit whose import path lies under a prefix (`prefix/...`)
    ImportPrefix(String),
    /// Only the unit(s) in exactly this directory
    Directory(PathBuf),
}

impl fmt::Display for LoadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadPattern::Recursive(dir) => write!(f, "{}/...", dir.display()),
            LoadPattern::ImportPrefix(prefix) => write!(f, "{}/...", prefix),
            LoadPattern::Directory(dir) => write!(f, "{}", dir.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Working directory of the load
    pub root: PathBuf,
    pub pattern: LoadPattern,
    /// Editor content that replaces on-disk content for these paths
    pub overrides: HashMap<PathBuf, Arc<str>>,
}

/// The compiler front end: turns a pattern into loaded build units.
///
/// Returned units carry their direct imports; transitive imports are
/// reachable through them.
#[async_trait]
pub trait PackageLoader: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<Vec<Arc<UnitRecord>>>;

    /// Drop the loader's own cached package listings.
    fn invalidate_list_cache(&self);
}

/// One module as reported by the toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleInfo {
    pub path: String,
    #[serde(default)]
    pub main: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Resolves the dependency modules of a module root.
///
/// Used for change fingerprinting only, never for symbol resolution.
#[async_trait]
pub trait ModuleMetadataSource: Send + Sync {
    async fn modules(&self, root: &Path) -> Result<Vec<ModuleInfo>>;
}

/// Per-file content overrides shared between the file table and the loader.
#[derive(Debug, Clone, Default)]
pub struct SourceOverrides {
    inner: Arc<DashMap<PathBuf, Arc<str>>>,
}

impl SourceOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: PathBuf, content: Arc<str>) {
        self.inner.insert(path, content);
    }

    pub fn remove(&self, path: &Path) {
        self.inner.remove(path);
    }

    pub fn get(&self, path: &Path) -> Option<Arc<str>> {
        self.inner.get(path).map(|c| c.value().clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copy of the current overrides, handed to a load request.
    pub fn snapshot(&self) -> HashMap<PathBuf, Arc<str>> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Module metadata from `go list -m -json all`.
pub struct GoListModules {
    go_path: PathBuf,
    timeout: Duration,
}

impl Default for GoListModules {
    fn default() -> Self {
        Self::new(PathBuf::from("go"))
    }
}

impl GoListModules {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(go_path: PathBuf) -> Self {
        Self {
            go_path,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Decode the concatenated JSON objects printed by `go list -json`.
pub fn parse_module_stream(stdout: &str) -> Result<Vec<ModuleInfo>> {
    serde_json::Deserializer::from_str(stdout)
        .into_iter::<ModuleInfo>()
        .map(|m| m.map_err(|e| anyhow!("malformed module metadata: {e}")))
        .collect()
}

#[async_trait]
impl ModuleMetadataSource for GoListModules {
    async fn modules(&self, root: &Path) -> Result<Vec<ModuleInfo>> {
        let _guard = crate::perf::TimingGuard::new(crate::perf::Phase::Metadata, root.display());
        let mut cmd = Command::new(&self.go_path);
        cmd.args(["list", "-m", "-json", "all"])
            .current_dir(root)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {e}", self.go_path.display()))?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow!("Failed to run go list: {e}"))?,
            Err(_) => return Err(anyhow!("go list timed out after {:?}", self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "go list failed with status {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let modules = parse_module_stream(&stdout)?;
        log::trace!(
            "go list reported {} modules for {}",
            modules.len(),
            root.display()
        );
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_module_stream() {
        let stdout = r#"{
    "Path": "example.com/m",
    "Main": true,
    "Dir": "/w/m",
    "GoMod": "/w/m/go.mod"
}
{
    "Path": "golang.org/x/text",
    "Version": "v0.3.0",
    "Dir": "/gopath/pkg/mod/golang.org/x/text@v0.3.0"
}
{
    "Path": "example.com/missing",
    "Version": "v1.0.0"
}
"#;
        let modules = parse_module_stream(stdout).unwrap();
        assert_eq!(modules.len(), 3);
        assert!(modules[0].main);
        assert_eq!(modules[0].dir, Some(PathBuf::from("/w/m")));
        assert!(!modules[1].main);
        assert_eq!(modules[1].version.as_deref(), Some("v0.3.0"));
        assert!(modules[2].dir.is_none());
    }

    #[test]
    fn test_parse_module_stream_rejects_garbage() {
        assert!(parse_module_stream("{\"Path\": \"a\"} not json").is_err());
        assert!(parse_module_stream("").unwrap().is_empty());
    }

    #[test]
    fn test_load_pattern_display() {
        assert_eq!(
            LoadPattern::Recursive(PathBuf::from("/w")).to_string(),
            "/w/..."
        );
        assert_eq!(
            LoadPattern::ImportPrefix("example.com/p".into()).to_string(),
            "example.com/p/..."
        );
        assert_eq!(LoadPattern::Directory(PathBuf::from("/w/a")).to_string(), "/w/a");
    }

    #[test]
    fn test_source_overrides_shared_between_clones() {
        let overrides = SourceOverrides::new();
        let other = overrides.clone();
        overrides.set(PathBuf::from("/w/a.toy"), Arc::from("package a"));

        assert!(other.contains(Path::new("/w/a.toy")));
        assert_eq!(other.snapshot().len(), 1);

        other.remove(Path::new("/w/a.toy"));
        assert!(overrides.is_empty());
    }

    #[tokio::test]
    async fn test_go_list_missing_binary_is_error() {
        let source = GoListModules::new(PathBuf::from("/nonexistent/go-binary"));
        let dir = tempfile::tempdir().unwrap();
        assert!(source.modules(dir.path()).await.is_err());
    }
}
