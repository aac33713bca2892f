//! Loadable modules
//!
//! An [`IoModule`] wraps one shared library on disk. Using it the first time
//! opens the library, resolves its entry points and calls the load function,
//! which registers implementations with the [`ExtensionRegistry`]. Releasing
//! the last use calls the unload function. The library itself stays mapped:
//! the types it registered live on in the registry, and their code is in it.
//!
//! Entry points are looked up by module-derived name first
//! (`kiln_<name>_load` / `kiln_<name>_unload`) and then by the legacy fixed
//! names [`LEGACY_LOAD_SYMBOL`] / [`LEGACY_UNLOAD_SYMBOL`].

pub mod scan;
pub mod scope;

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::extension::ExtensionRegistry;

pub use scan::{ModuleCache, ModuleSearchPath, ScanSummary, MODULE_CACHE_FILENAME};
pub use scope::{is_valid_module_name, ModuleScope, ModuleScopeFlags};

/// Symbol name of the fallback load function
pub const LEGACY_LOAD_SYMBOL: &str = "kiln_module_load";

/// Symbol name of the fallback unload function
pub const LEGACY_UNLOAD_SYMBOL: &str = "kiln_module_unload";

/// Signature of a module's load and unload functions
pub type ModuleEntryFn = extern "C" fn(&ExtensionRegistry);

type EntryFn = Box<dyn Fn(&ExtensionRegistry) + Send + Sync>;

/// Errors raised while activating a module
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Failed to open module {}: {reason}", .path.display())]
    Open { path: PathBuf, reason: String },

    #[error(
        "Module {} exports neither {load}/{unload} nor kiln_module_load/kiln_module_unload",
        .path.display()
    )]
    MissingEntryPoints {
        path: PathBuf,
        load: String,
        unload: String,
    },
}

/// Resolved load/unload functions of an opened library
pub struct EntryPoints {
    load: EntryFn,
    unload: EntryFn,
}

impl EntryPoints {
    pub fn new<L, U>(load: L, unload: U) -> Self
    where
        L: Fn(&ExtensionRegistry) + Send + Sync + 'static,
        U: Fn(&ExtensionRegistry) + Send + Sync + 'static,
    {
        Self {
            load: Box::new(load),
            unload: Box::new(unload),
        }
    }
}

/// An opened shared library
pub trait Library: Send + Sync {
    /// Resolve both named symbols, or nothing if either is missing
    fn entry_points(&self, load_symbol: &str, unload_symbol: &str) -> Option<EntryPoints>;
}

/// Opens shared libraries for [`IoModule`]
pub trait LibraryOpener: Send + Sync {
    /// Whether this platform can load code at runtime at all
    fn is_supported(&self) -> bool {
        true
    }

    /// Open the library at `path`
    ///
    /// # Errors
    /// Returns [`ModuleError::Open`] if the file can't be loaded.
    fn open(&self, path: &Path) -> Result<Box<dyn Library>, ModuleError>;
}

/// [`LibraryOpener`] backed by the platform dynamic loader
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLibraryOpener;

struct DynamicLibrary(libloading::Library);

impl LibraryOpener for DynamicLibraryOpener {
    fn is_supported(&self) -> bool {
        cfg!(any(unix, windows))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Library>, ModuleError> {
        // Lazy binding, local symbols: modules must not leak symbols into
        // each other
        #[cfg(unix)]
        let library = unsafe {
            libloading::os::unix::Library::open(
                Some(path),
                libloading::os::unix::RTLD_LAZY | libloading::os::unix::RTLD_LOCAL,
            )
            .map(libloading::Library::from)
        };

        #[cfg(not(unix))]
        let library = unsafe { libloading::Library::new(path) };

        let library = library.map_err(|e| ModuleError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(DynamicLibrary(library)))
    }
}

impl Library for DynamicLibrary {
    fn entry_points(&self, load_symbol: &str, unload_symbol: &str) -> Option<EntryPoints> {
        // Safety: the symbols are declared by `export_module!` with the
        // `ModuleEntryFn` signature. An activated library is never closed,
        // so the plain function pointers stay valid.
        let (load, unload) = unsafe {
            let load = self.0.get::<ModuleEntryFn>(load_symbol.as_bytes()).ok()?;
            let unload = self.0.get::<ModuleEntryFn>(unload_symbol.as_bytes()).ok()?;
            (*load, *unload)
        };

        Some(EntryPoints::new(move |r: &ExtensionRegistry| load(r), move |r: &ExtensionRegistry| unload(r)))
    }
}

struct ModuleState {
    library: Option<Box<dyn Library>>,
    entry_points: Option<EntryPoints>,
    use_count: usize,
}

/// A loadable module backed by one library file
pub struct IoModule {
    path: PathBuf,
    opener: Arc<dyn LibraryOpener>,
    state: Mutex<ModuleState>,
    initialized: AtomicBool,
}

impl IoModule {
    /// Create a module for `path`. Nothing is loaded until first use.
    pub fn new(path: impl Into<PathBuf>, opener: Arc<dyn LibraryOpener>) -> Self {
        Self {
            path: path.into(),
            opener,
            state: Mutex::new(ModuleState {
                library: None,
                entry_points: None,
                use_count: 0,
            }),
            initialized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module name derived from the file name, see [`module_name`]
    #[must_use]
    pub fn name(&self) -> String {
        module_name(&self.path)
    }

    /// Whether the load function has run at least once
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn use_count(&self) -> usize {
        self.state.lock().use_count
    }

    /// Take a use reference, loading the library if it is not loaded.
    ///
    /// Load and unload functions run under the module's lock; they must not
    /// use or release their own module.
    ///
    /// Returns `false` if the library could not be activated.
    pub fn use_module(&self, registry: &ExtensionRegistry) -> bool {
        let mut state = self.state.lock();

        if state.use_count == 0 {
            if let Err(e) = self.activate(&mut state, registry) {
                error!("{}", e);
                return false;
            }
        }

        state.use_count += 1;
        true
    }

    /// Drop a use reference. The last one runs the unload function.
    pub fn unuse_module(&self, registry: &ExtensionRegistry) {
        let mut state = self.state.lock();

        match state.use_count {
            0 => warn!("Module {} released more often than used", self.path.display()),
            1 => {
                state.use_count = 0;
                Self::deactivate(&mut state, registry);
                debug!("Unloaded module {}", self.path.display());
            }
            _ => state.use_count -= 1,
        }
    }

    fn activate(
        &self,
        state: &mut ModuleState,
        registry: &ExtensionRegistry,
    ) -> Result<(), ModuleError> {
        // Reactivation reuses the library mapped by the first load
        let library = match state.library.take() {
            Some(library) => library,
            None => self.opener.open(&self.path)?,
        };

        let name = self.name();
        let load_symbol = format!("kiln_{name}_load");
        let unload_symbol = format!("kiln_{name}_unload");

        let entry_points = library
            .entry_points(&load_symbol, &unload_symbol)
            .or_else(|| library.entry_points(LEGACY_LOAD_SYMBOL, LEGACY_UNLOAD_SYMBOL));

        let Some(entry_points) = entry_points else {
            if self.is_initialized() {
                state.library = Some(library);
            }
            return Err(ModuleError::MissingEntryPoints {
                path: self.path.clone(),
                load: load_symbol,
                unload: unload_symbol,
            });
        };

        debug!("Loading module {}", self.path.display());
        {
            let _loading = LoadingGuard::enter(&self.path);
            (entry_points.load)(registry);
        }

        state.library = Some(library);
        state.entry_points = Some(entry_points);
        self.initialized.store(true, Ordering::Release);

        Ok(())
    }

    fn deactivate(state: &mut ModuleState, registry: &ExtensionRegistry) {
        if let Some(entry_points) = state.entry_points.take() {
            (entry_points.unload)(registry);
        }
    }
}

impl Drop for IoModule {
    fn drop(&mut self) {
        // Registered types may outlive the module and still point into the
        // library, so it is never unmapped
        if let Some(library) = self.state.get_mut().library.take() {
            debug!("Keeping {} resident", self.path.display());
            std::mem::forget(library);
        }
    }
}

thread_local! {
    static LOADING: RefCell<Vec<PathBuf>> = RefCell::new(Vec::new());
}

/// Marks the module whose load function runs on this thread
struct LoadingGuard;

impl LoadingGuard {
    fn enter(path: &Path) -> Self {
        LOADING.with(|loading| loading.borrow_mut().push(path.to_path_buf()));
        LoadingGuard
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        LOADING.with(|loading| {
            loading.borrow_mut().pop();
        });
    }
}

/// Path of the module currently running its load function on this thread
pub(crate) fn loading_module() -> Option<PathBuf> {
    LOADING.with(|loading| loading.borrow().last().cloned())
}

impl fmt::Debug for IoModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoModule")
            .field("path", &self.path)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

/// Derive the module name used for entry point symbols.
///
/// Strips the directory and a leading `lib`, cuts at the first `.` and
/// replaces `-` with `_`: `/x/libkiln-fam.so` becomes `kiln_fam`.
#[must_use]
pub fn module_name(path: &Path) -> String {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stem = basename.strip_prefix("lib").unwrap_or(&basename);
    let stem = stem.split('.').next().unwrap_or(stem);

    stem.replace('-', "_")
}

/// Export the legacy entry points of a module library.
///
/// ```ignore
/// fn load(registry: &kiln::extension::ExtensionRegistry) { /* implement ... */ }
/// fn unload(_registry: &kiln::extension::ExtensionRegistry) {}
///
/// kiln::export_module!(load, unload);
/// ```
#[macro_export]
macro_rules! export_module {
    ($load:path, $unload:path) => {
        #[no_mangle]
        pub extern "C" fn kiln_module_load(registry: &$crate::extension::ExtensionRegistry) {
            $load(registry)
        }

        #[no_mangle]
        pub extern "C" fn kiln_module_unload(registry: &$crate::extension::ExtensionRegistry) {
            $unload(registry)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static LOADS: AtomicUsize = AtomicUsize::new(0);
    static UNLOADS: AtomicUsize = AtomicUsize::new(0);

    fn count_load(_registry: &ExtensionRegistry) {
        LOADS.fetch_add(1, Ordering::SeqCst);
    }

    fn count_unload(_registry: &ExtensionRegistry) {
        UNLOADS.fetch_add(1, Ordering::SeqCst);
    }

    mod exported {
        crate::export_module!(super::count_load, super::count_unload);
    }

    /// Serves the `export_module!` functions under the legacy names only
    struct LegacyLibrary;

    impl Library for LegacyLibrary {
        fn entry_points(&self, load: &str, unload: &str) -> Option<EntryPoints> {
            (load == LEGACY_LOAD_SYMBOL && unload == LEGACY_UNLOAD_SYMBOL).then(|| {
                EntryPoints::new(|r: &ExtensionRegistry| exported::kiln_module_load(r), |r: &ExtensionRegistry| exported::kiln_module_unload(r))
            })
        }
    }

    struct LegacyOpener;

    impl LibraryOpener for LegacyOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn Library>, ModuleError> {
            Ok(Box::new(LegacyLibrary))
        }
    }

    /// Counts how often libraries are opened and closed
    #[derive(Default)]
    struct TrackingOpener {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct TrackedLibrary(Arc<AtomicUsize>);

    impl Library for TrackedLibrary {
        fn entry_points(&self, _: &str, _: &str) -> Option<EntryPoints> {
            Some(EntryPoints::new(|_| {}, |_| {}))
        }
    }

    impl Drop for TrackedLibrary {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl LibraryOpener for TrackingOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn Library>, ModuleError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TrackedLibrary(Arc::clone(&self.closed))))
        }
    }

    struct EmptyOpener;

    impl LibraryOpener for EmptyOpener {
        fn open(&self, _path: &Path) -> Result<Box<dyn Library>, ModuleError> {
            struct Empty;
            impl Library for Empty {
                fn entry_points(&self, _: &str, _: &str) -> Option<EntryPoints> {
                    None
                }
            }
            Ok(Box::new(Empty))
        }
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("/x/libkiln-fam.so")), "kiln_fam");
        assert_eq!(module_name(Path::new("libfoo.so.1")), "foo");
        assert_eq!(module_name(Path::new("bar-baz.dll")), "bar_baz");
        assert_eq!(module_name(Path::new("plain")), "plain");
    }

    #[test]
    fn test_use_and_unuse_legacy_module() {
        let registry = ExtensionRegistry::builder().opener(LegacyOpener).build();
        let module = IoModule::new("/modules/libexported.so", Arc::new(LegacyOpener));

        assert!(!module.is_initialized());
        assert!(module.use_module(&registry));
        assert!(module.use_module(&registry));
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);
        assert_eq!(module.use_count(), 2);

        module.unuse_module(&registry);
        assert_eq!(UNLOADS.load(Ordering::SeqCst), 0);
        module.unuse_module(&registry);
        assert_eq!(UNLOADS.load(Ordering::SeqCst), 1);

        assert!(module.is_initialized());
        assert_eq!(module.use_count(), 0);
    }

    #[test]
    fn test_exported_symbols_match_entry_signature() {
        let load: ModuleEntryFn = exported::kiln_module_load;
        let unload: ModuleEntryFn = exported::kiln_module_unload;

        assert_ne!(load as usize, unload as usize);
    }

    #[test]
    fn test_library_stays_mapped() {
        let opener = TrackingOpener::default();
        let opened = Arc::clone(&opener.opened);
        let closed = Arc::clone(&opener.closed);

        let registry = ExtensionRegistry::new();
        let module = IoModule::new("/modules/libtracked.so", Arc::new(opener));

        assert!(module.use_module(&registry));
        module.unuse_module(&registry);
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        // Reactivation reuses the mapped library
        assert!(module.use_module(&registry));
        module.unuse_module(&registry);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        drop(module);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_entry_points() {
        let registry = ExtensionRegistry::builder().opener(EmptyOpener).build();
        let module = IoModule::new("/modules/libnothing.so", Arc::new(EmptyOpener));

        assert!(!module.use_module(&registry));
        assert!(!module.is_initialized());
        assert_eq!(module.use_count(), 0);
    }

    #[test]
    fn test_dynamic_open_failure() {
        let opener = DynamicLibraryOpener;
        let result = opener.open(Path::new("/nonexistent/libkiln-missing.so"));

        assert!(matches!(result, Err(ModuleError::Open { .. })));
    }
}
