//
// config.rs
//
// Configuration for the workspace package cache
//

use std::path::PathBuf;
use std::time::Duration;

/// Name of the module-defining file looked for during discovery
pub const DEFAULT_MODULE_FILE: &str = "go.mod";

/// Directories never descended into during discovery or watched
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".bzr",
    ".idea",
    ".vscode",
    "vendor",
    "node_modules",
    "testdata",
];

/// How dependency fingerprint differences are turned into rebuilds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Only newly added dependency directories mark a root stale
    #[default]
    AdditionsOnly,
    /// Any added or removed dependency directory marks a root stale
    AnyChange,
}

/// Whether the unit store keeps anything at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// File name that marks a module root
    pub module_file_name: String,
    /// Legacy search-path roots (each containing a `src` directory)
    pub search_paths: Vec<PathBuf>,
    /// Directory holding the runtime's builtin units
    pub builtin_root: Option<PathBuf>,
    /// Directory names skipped during discovery and watching
    pub excluded_dirs: Vec<String>,
    /// Maximum directory depth scanned for module files
    pub max_discovery_depth: usize,
    /// Minimum time between two full rebuilds
    pub rebuild_cooldown_ms: u64,
    /// Period of the loader list-cache refresh
    pub list_cache_refresh_secs: u64,
    /// Import depth searched by enclosing-node lookups
    pub enclosing_search_depth: usize,
    pub store_mode: StoreMode,
    /// Fold file-path keys to lowercase
    pub case_insensitive_paths: bool,
    pub stale_policy: StalePolicy,
    /// Whether to start the filesystem watcher
    pub watch_files: bool,
}

impl Default for WorkspaceConfig {
    /// Defaults read `GOPATH` and `GOROOT` from the environment for the
    /// legacy search paths and the builtin root.
    fn default() -> Self {
        let search_paths = std::env::var_os("GOPATH")
            .map(|v| std::env::split_paths(&v).collect())
            .unwrap_or_default();
        let builtin_root = std::env::var_os("GOROOT").map(|v| PathBuf::from(v).join("src"));

        Self {
            module_file_name: DEFAULT_MODULE_FILE.to_string(),
            search_paths,
            builtin_root,
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
            max_discovery_depth: 10,
            rebuild_cooldown_ms: 30_000,
            list_cache_refresh_secs: 300,
            enclosing_search_depth: 3,
            store_mode: StoreMode::Enabled,
            case_insensitive_paths: cfg!(any(windows, target_os = "macos")),
            stale_policy: StalePolicy::AdditionsOnly,
            watch_files: true,
        }
    }
}

impl WorkspaceConfig {
    pub fn rebuild_cooldown(&self) -> Duration {
        Duration::from_millis(self.rebuild_cooldown_ms)
    }

    pub fn list_cache_refresh(&self) -> Duration {
        Duration::from_secs(self.list_cache_refresh_secs.max(1))
    }

    pub fn is_excluded_dir(&self, name: &str) -> bool {
        self.excluded_dirs.iter().any(|d| d == name)
    }

    /// Build a configuration from editor settings, starting from defaults.
    ///
    /// Reads the `workspaceCache` object; unknown keys are ignored.
    ///
    /// ```
    /// use pkgindex::config::WorkspaceConfig;
    ///
    /// let settings = serde_json::json!({
    ///     "workspaceCache": { "rebuildCooldownMs": 5000, "caching": false }
    /// });
    /// let cfg = WorkspaceConfig::from_settings(&settings);
    /// assert_eq!(cfg.rebuild_cooldown_ms, 5000);
    /// ```
    pub fn from_settings(settings: &serde_json::Value) -> Self {
        let mut config = Self::default();
        let Some(section) = settings.get("workspaceCache") else {
            return config;
        };

        if let Some(v) = section.get("moduleFileName").and_then(|v| v.as_str()) {
            if !v.is_empty() {
                config.module_file_name = v.to_string();
            }
        }
        if let Some(paths) = section.get("searchPaths").and_then(|v| v.as_array()) {
            config.search_paths = paths
                .iter()
                .filter_map(|p| p.as_str())
                .filter(|s| !s.is_empty() && !s.contains('\0'))
                .map(PathBuf::from)
                .collect();
        }
        if let Some(v) = section.get("builtinRoot").and_then(|v| v.as_str()) {
            if !v.is_empty() && !v.contains('\0') {
                config.builtin_root = Some(PathBuf::from(v));
            }
        }
        if let Some(dirs) = section.get("excludedDirs").and_then(|v| v.as_array()) {
            config.excluded_dirs = dirs
                .iter()
                .filter_map(|d| d.as_str())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = section.get("maxDiscoveryDepth").and_then(|v| v.as_u64()) {
            config.max_discovery_depth = v as usize;
        }
        if let Some(v) = section.get("rebuildCooldownMs").and_then(|v| v.as_u64()) {
            config.rebuild_cooldown_ms = v;
        }
        if let Some(v) = section.get("listCacheRefreshSecs").and_then(|v| v.as_u64()) {
            config.list_cache_refresh_secs = v;
        }
        if let Some(v) = section.get("enclosingSearchDepth").and_then(|v| v.as_u64()) {
            config.enclosing_search_depth = v as usize;
        }
        if let Some(v) = section.get("caching").and_then(|v| v.as_bool()) {
            config.store_mode = if v {
                StoreMode::Enabled
            } else {
                StoreMode::Disabled
            };
        }
        if let Some(v) = section.get("caseInsensitivePaths").and_then(|v| v.as_bool()) {
            config.case_insensitive_paths = v;
        }
        if let Some(v) = section.get("stalePolicy").and_then(|v| v.as_str()) {
            config.stale_policy = match v {
                "anyChange" => StalePolicy::AnyChange,
                _ => StalePolicy::AdditionsOnly,
            };
        }
        if let Some(v) = section.get("watchFiles").and_then(|v| v.as_bool()) {
            config.watch_files = v;
        }

        log::info!("Workspace cache configuration loaded from settings:");
        log::info!("  module_file_name: {}", config.module_file_name);
        log::info!("  search_paths: {:?}", config.search_paths);
        log::info!("  builtin_root: {:?}", config.builtin_root);
        log::info!("  max_discovery_depth: {}", config.max_discovery_depth);
        log::info!("  rebuild_cooldown_ms: {}", config.rebuild_cooldown_ms);
        log::info!("  list_cache_refresh_secs: {}", config.list_cache_refresh_secs);
        log::info!("  enclosing_search_depth: {}", config.enclosing_search_depth);
        log::info!("  store_mode: {:?}", config.store_mode);
        log::info!("  stale_policy: {:?}", config.stale_policy);

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_values() {
        let config = WorkspaceConfig::default();
        assert_eq!(config.module_file_name, "go.mod");
        assert_eq!(config.max_discovery_depth, 10);
        assert_eq!(config.rebuild_cooldown(), Duration::from_secs(30));
        assert_eq!(config.enclosing_search_depth, 3);
        assert_eq!(config.store_mode, StoreMode::Enabled);
        assert_eq!(config.stale_policy, StalePolicy::AdditionsOnly);
        assert!(config.is_excluded_dir(".git"));
        assert!(config.is_excluded_dir("vendor"));
        assert!(!config.is_excluded_dir("src"));
    }

    #[test]
    fn test_from_settings_overrides() {
        let settings = json!({
            "workspaceCache": {
                "moduleFileName": "mod.toml",
                "searchPaths": ["/gopath", "", "/other"],
                "builtinRoot": "/goroot/src",
                "rebuildCooldownMs": 100,
                "caching": false,
                "stalePolicy": "anyChange",
                "enclosingSearchDepth": 5
            }
        });
        let config = WorkspaceConfig::from_settings(&settings);

        assert_eq!(config.module_file_name, "mod.toml");
        assert_eq!(
            config.search_paths,
            vec![PathBuf::from("/gopath"), PathBuf::from("/other")]
        );
        assert_eq!(config.builtin_root, Some(PathBuf::from("/goroot/src")));
        assert_eq!(config.rebuild_cooldown_ms, 100);
        assert_eq!(config.store_mode, StoreMode::Disabled);
        assert_eq!(config.stale_policy, StalePolicy::AnyChange);
        assert_eq!(config.enclosing_search_depth, 5);
    }

    #[test]
    fn test_from_settings_missing_section_keeps_defaults() {
        let config = WorkspaceConfig::from_settings(&json!({ "other": {} }));
        assert_eq!(config.rebuild_cooldown_ms, 30_000);
        assert_eq!(config.module_file_name, "go.mod");
    }

    #[test]
    fn test_refresh_period_never_zero() {
        let config = WorkspaceConfig {
            list_cache_refresh_secs: 0,
            ..WorkspaceConfig::default()
        };
        assert_eq!(config.list_cache_refresh(), Duration::from_secs(1));
    }
}
