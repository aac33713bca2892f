//! Directory scanning and the module cache file
//!
//! A module directory may carry a `giomodule.cache` file listing, for each
//! library, the extension points it implements:
//!
//! ```text
//! # comment
//! libkiln-fam.so: file-monitor,volume-monitor
//! ```
//!
//! Libraries listed in a cache that is at least as new as the library itself
//! are attached to their extension points without being opened. Everything
//! else is loaded once right away so it can register what it really provides.

use std::collections::HashMap;
use std::env;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::scope::{is_valid_module_name, ModuleScope, ModuleScopeFlags};
use super::IoModule;
use crate::config::ModulesConfig;
use crate::extension::ExtensionRegistry;

/// Name of the cache file inside a module directory
pub const MODULE_CACHE_FILENAME: &str = "giomodule.cache";

/// Parsed `giomodule.cache`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleCache {
    entries: HashMap<String, Vec<String>>,
    timestamp: i64,
}

impl ModuleCache {
    /// Parse cache file contents. The timestamp is left at zero.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();

        for line in contents.lines() {
            if line.starts_with('#') {
                continue;
            }

            let Some((file, points)) = line.split_once(':') else {
                continue;
            };
            if file.is_empty() {
                continue;
            }

            let points = points
                .trim_start()
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();

            entries.insert(file.to_string(), points);
        }

        Self {
            entries,
            timestamp: 0,
        }
    }

    /// Read `<dir>/giomodule.cache`, if there is one
    #[must_use]
    pub fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(MODULE_CACHE_FILENAME);

        let contents = fs::read_to_string(&path).ok()?;
        let metadata = fs::metadata(&path).ok()?;

        let mut cache = Self::parse(&contents);
        // Some filesystems reset mtime on copy; the status change time still
        // moves forward
        cache.timestamp = modification_time(&metadata).max(change_time(&metadata));

        debug!(
            "Read module cache {} ({} entries)",
            path.display(),
            cache.entries.len()
        );

        Some(cache)
    }

    /// Extension points recorded for `basename`
    #[must_use]
    pub fn extension_points(&self, basename: &str) -> Option<&[String]> {
        self.entries.get(basename).map(Vec::as_slice)
    }

    /// Effective write time of the cache file, in seconds
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(unix)]
fn change_time(metadata: &Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ctime()
}

#[cfg(not(unix))]
fn change_time(metadata: &Metadata) -> i64 {
    modification_time(metadata)
}

fn modification_time(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

/// What a directory scan did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Modules attached to extension points without being opened
    pub lazy: usize,
    /// Modules opened and loaded once during the scan
    pub loaded: usize,
    /// Modules that failed to load
    pub failed: usize,
}

/// Directories searched by [`ExtensionRegistry::ensure_loaded`]
#[derive(Debug, Clone, Default)]
pub struct ModuleSearchPath {
    extra_modules_env: Option<String>,
    module_dir_env: Option<String>,
    module_dir: Option<PathBuf>,
}

impl ModuleSearchPath {
    /// No directories at all
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: &ModulesConfig) -> Self {
        Self {
            extra_modules_env: Some(config.extra_modules_env.clone()),
            module_dir_env: Some(config.module_dir_env.clone()),
            module_dir: Some(config.module_dir.clone()),
        }
    }

    /// Only `dir`, ignoring the environment
    #[must_use]
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        Self {
            module_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Directories to scan, in order: every entry of the extra-modules
    /// variable, then the module directory. The environment is ignored for
    /// setuid processes.
    #[must_use]
    pub fn directories(&self) -> Vec<PathBuf> {
        let trusted = !is_setuid();
        let mut dirs = Vec::new();

        if trusted {
            if let Some(paths) = self.extra_modules_env.as_deref().and_then(env::var_os) {
                dirs.extend(env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
            }
        }

        let override_dir = self
            .module_dir_env
            .as_deref()
            .filter(|_| trusted)
            .and_then(env::var_os)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if let Some(dir) = override_dir.or_else(|| self.module_dir.clone()) {
            dirs.push(dir);
        }

        dirs
    }
}

/// Whether the process runs with ids different from the invoking user's
#[cfg(unix)]
#[must_use]
pub fn is_setuid() -> bool {
    // Safety: these calls have no preconditions and cannot fail
    unsafe { libc::getuid() != libc::geteuid() || libc::getgid() != libc::getegid() }
}

#[cfg(not(unix))]
#[must_use]
pub fn is_setuid() -> bool {
    false
}

/// Basenames of the candidate modules in `dir`, in directory order
fn module_basenames(dir: &Path, mut scope: Option<&mut ModuleScope>) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Unable to open module directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error reading module directory {}: {}", dir.display(), e);
                continue;
            }
        };

        let Ok(name) = entry.file_name().into_string() else {
            debug!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };

        if is_valid_module_name(&name, scope.as_deref_mut()) {
            names.push(name);
        }
    }

    names
}

impl ExtensionRegistry {
    /// Register the modules in `dir`.
    ///
    /// Modules covered by a fresh cache entry are attached lazily to the
    /// extension points the cache names. Others are loaded once and
    /// released again; they stay in memory for the life of the registry.
    pub fn scan_directory(&self, dir: &Path, mut scope: Option<&mut ModuleScope>) -> ScanSummary {
        let mut summary = ScanSummary::default();

        if !self.opener().is_supported() {
            return summary;
        }

        let cache = ModuleCache::load(dir);

        for name in module_basenames(dir, scope.as_deref_mut()) {
            let path = dir.join(&name);

            let points = cache.as_ref().and_then(|cache| {
                let points = cache.extension_points(&name)?;
                let metadata = match fs::metadata(&path) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("Unable to stat module {}: {}", path.display(), e);
                        return None;
                    }
                };

                (change_time(&metadata) <= cache.timestamp()).then_some(points)
            });

            let module = Arc::new(IoModule::new(&path, self.opener()));

            if let Some(points) = points {
                for point in points {
                    self.register(point).add_lazy_module(Arc::clone(&module));
                }
                debug!("Registered lazy module {}", path.display());
                summary.lazy += 1;
                continue;
            }

            if module.use_module(self) {
                module.unuse_module(self);
                self.retain_module(module);
                summary.loaded += 1;
            } else {
                error!("Failed to load module: {}", path.display());
                summary.failed += 1;
            }
        }

        summary
    }

    /// Load every module in `dir` and return them in use.
    ///
    /// The caller owns one use of each returned module.
    pub fn load_directory(&self, dir: &Path, mut scope: Option<&mut ModuleScope>) -> Vec<Arc<IoModule>> {
        if !self.opener().is_supported() {
            return Vec::new();
        }

        let mut modules = Vec::new();

        for name in module_basenames(dir, scope.as_deref_mut()) {
            let path = dir.join(&name);
            let module = Arc::new(IoModule::new(&path, self.opener()));

            if module.use_module(self) {
                modules.push(module);
            } else {
                error!("Failed to load module: {}", path.display());
            }
        }

        modules
    }

    /// Register built-in extension points, scan the module search path and
    /// run the built-in registration hooks. Runs once per registry.
    pub fn ensure_loaded(&self) {
        self.loaded_once().call_once(|| {
            self.register_builtin_points();

            let mut scope = ModuleScope::new(ModuleScopeFlags::BLOCK_DUPLICATES);
            for dir in self.search_path().directories() {
                let summary = self.scan_directory(&dir, Some(&mut scope));
                debug!(
                    "Scanned {}: {} lazy, {} loaded, {} failed",
                    dir.display(),
                    summary.lazy,
                    summary.loaded,
                    summary.failed
                );
            }

            self.run_builtin_hooks();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cache() {
        let cache = ModuleCache::parse(
            "# generated\n\
             libfoo.so: point-a,point-b\n\
             :orphan\n\
             no colon here\n\
             libbar.so:point-c,, point-d \n\
             libempty.so:\n",
        );

        assert_eq!(cache.len(), 3);
        assert_eq!(
            cache.extension_points("libfoo.so"),
            Some(&["point-a".to_string(), "point-b".to_string()][..])
        );
        assert_eq!(
            cache.extension_points("libbar.so"),
            Some(&["point-c".to_string(), "point-d".to_string()][..])
        );
        assert_eq!(cache.extension_points("libempty.so"), Some(&[][..]));
        assert_eq!(cache.timestamp(), 0);
    }

    #[test]
    fn test_load_missing_cache() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModuleCache::load(dir.path()).is_none());
    }

    #[test]
    fn test_load_cache_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MODULE_CACHE_FILENAME), "libfoo.so: a\n").unwrap();

        let cache = ModuleCache::load(dir.path()).unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        assert!(cache.timestamp() > 0);
        assert!(cache.timestamp() <= now + 1);
    }

    #[test]
    fn test_search_path_single() {
        let search = ModuleSearchPath::single("/opt/kiln/modules");
        assert_eq!(search.directories(), vec![PathBuf::from("/opt/kiln/modules")]);
        assert!(ModuleSearchPath::empty().directories().is_empty());
    }

    #[test]
    fn test_search_path_environment() {
        let config = ModulesConfig {
            module_dir: PathBuf::from("/usr/lib/kiln/modules"),
            extra_modules_env: "KILN_TEST_SCAN_EXTRA".to_string(),
            module_dir_env: "KILN_TEST_SCAN_DIR".to_string(),
        };
        let extra = env::join_paths(["/a", "/b"]).unwrap();
        env::set_var("KILN_TEST_SCAN_EXTRA", &extra);
        env::set_var("KILN_TEST_SCAN_DIR", "/override");

        let dirs = ModuleSearchPath::from_config(&config).directories();

        env::remove_var("KILN_TEST_SCAN_EXTRA");
        env::remove_var("KILN_TEST_SCAN_DIR");

        if is_setuid() {
            assert_eq!(dirs, vec![PathBuf::from("/usr/lib/kiln/modules")]);
        } else {
            assert_eq!(
                dirs,
                vec![
                    PathBuf::from("/a"),
                    PathBuf::from("/b"),
                    PathBuf::from("/override")
                ]
            );
        }
    }
}
