//! Extension points
//!
//! An extension point is a named slot that interchangeable implementations
//! plug into. Each point may require implementations to be of a given
//! [`CapabilityType`], and keeps its [`Extension`]s sorted by descending
//! priority. Modules found by a directory scan can be attached to a point
//! lazily; they are loaded the first time the point's extensions are listed.

pub mod capability;
mod default;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use crate::config::ModulesConfig;
use crate::module::{DynamicLibraryOpener, IoModule, LibraryOpener, ModuleSearchPath};

pub use capability::{CapabilityType, CapabilityTypeBuilder, InitError, Instance};
pub use default::VerifyFn;

use default::DefaultCache;

/// One implementation registered against an extension point
#[derive(Debug)]
pub struct Extension {
    name: String,
    capability_type: CapabilityType,
    priority: i32,
    module: Option<PathBuf>,
}

impl Extension {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capability_type(&self) -> &CapabilityType {
        &self.capability_type
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Library of the module that registered this extension, if any
    #[must_use]
    pub fn module_path(&self) -> Option<&Path> {
        self.module.as_deref()
    }
}

#[derive(Default)]
struct PointState {
    required_type: Option<CapabilityType>,
    extensions: Vec<Arc<Extension>>,
    lazy_modules: Vec<Arc<IoModule>>,
}

/// A named slot for implementations
pub struct ExtensionPoint {
    name: String,
    state: RwLock<PointState>,
}

impl ExtensionPoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(PointState::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Require every implementation to be of `capability_type`
    pub fn set_required_type(&self, capability_type: &CapabilityType) {
        self.state.write().required_type = Some(capability_type.clone());
    }

    #[must_use]
    pub fn required_type(&self) -> Option<CapabilityType> {
        self.state.read().required_type.clone()
    }

    /// Number of modules attached without being loaded yet
    #[must_use]
    pub fn pending_module_count(&self) -> usize {
        self.state
            .read()
            .lazy_modules
            .iter()
            .filter(|m| !m.is_initialized())
            .count()
    }

    pub(crate) fn add_lazy_module(&self, module: Arc<IoModule>) {
        self.state.write().lazy_modules.insert(0, module);
    }
}

impl fmt::Debug for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ExtensionPoint")
            .field("name", &self.name)
            .field("required_type", &state.required_type)
            .field("extensions", &state.extensions)
            .finish_non_exhaustive()
    }
}

type BuiltinHook = Box<dyn Fn(&ExtensionRegistry) + Send + Sync>;

/// Registry of extension points and the modules implementing them
pub struct ExtensionRegistry {
    points: Mutex<HashMap<String, Arc<ExtensionPoint>>>,
    opener: Arc<dyn LibraryOpener>,
    search_path: ModuleSearchPath,
    builtin_points: Vec<(String, Option<CapabilityType>)>,
    builtin_hooks: Vec<BuiltinHook>,
    loaded: Once,
    // Modules loaded eagerly by a scan are kept for the registry's lifetime
    retained: Mutex<Vec<Arc<IoModule>>>,
    defaults: DefaultCache,
}

static GLOBAL: Lazy<ExtensionRegistry> = Lazy::new(|| {
    ExtensionRegistry::builder()
        .search_path(ModuleSearchPath::from_config(&ModulesConfig::default()))
        .build()
});

impl ExtensionRegistry {
    /// The process-wide registry, searching the default module directories
    pub fn global() -> &'static ExtensionRegistry {
        &GLOBAL
    }

    /// An empty registry using the platform loader and no module directories
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder::default()
    }

    /// Get or create the extension point called `name`
    pub fn register(&self, name: &str) -> Arc<ExtensionPoint> {
        let mut points = self.points.lock();
        Arc::clone(
            points
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ExtensionPoint::new(name))),
        )
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<ExtensionPoint>> {
        self.points.lock().get(name).cloned()
    }

    /// Names of every registered extension point, sorted
    #[must_use]
    pub fn point_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.points.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register `capability_type` as an implementation of `point_name`.
    ///
    /// Returns `None` if the point doesn't exist or the type doesn't satisfy
    /// the point's required type. Implementing the same type twice returns the
    /// existing extension. A module that is loaded again builds its types
    /// anew; a type with the same name from the same module counts as the
    /// same type.
    pub fn implement(
        &self,
        point_name: &str,
        capability_type: &CapabilityType,
        name: &str,
        priority: i32,
    ) -> Option<Arc<Extension>> {
        let Some(point) = self.lookup(point_name) else {
            warn!("Tried to implement non-registered extension point {}", point_name);
            return None;
        };

        let mut state = point.state.write();

        if let Some(required) = &state.required_type {
            if !capability_type.is_a(required) {
                warn!(
                    "Tried to register an extension of the type {} to extension point {}. \
                     Expected type is {}.",
                    capability_type, point_name, required
                );
                return None;
            }
        }

        let module = crate::module::loading_module();

        if let Some(existing) = state.extensions.iter().find(|e| {
            e.capability_type == *capability_type
                || (module.is_some()
                    && e.module == module
                    && e.capability_type.name() == capability_type.name())
        }) {
            return Some(Arc::clone(existing));
        }

        let extension = Arc::new(Extension {
            name: name.to_string(),
            capability_type: capability_type.clone(),
            priority,
            module,
        });

        let index = state
            .extensions
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(state.extensions.len());
        state.extensions.insert(index, Arc::clone(&extension));

        Some(extension)
    }

    /// Extensions of `point`, highest priority first.
    ///
    /// Loads any lazily attached modules first.
    pub fn get_extensions(&self, point: &ExtensionPoint) -> Vec<Arc<Extension>> {
        self.load_pending_modules(point);
        point.state.read().extensions.clone()
    }

    pub fn get_extension_by_name(&self, point: &ExtensionPoint, name: &str) -> Option<Arc<Extension>> {
        self.load_pending_modules(point);
        point
            .state
            .read()
            .extensions
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    fn load_pending_modules(&self, point: &ExtensionPoint) {
        // Load functions call back into `implement`, so no point lock may be
        // held while they run
        let modules = point.state.read().lazy_modules.clone();

        for module in modules.iter().filter(|m| !m.is_initialized()) {
            if module.use_module(self) {
                module.unuse_module(self);
            } else {
                error!("Failed to load module: {}", module.path().display());
            }
        }
    }

    /// Number of modules kept alive after an eager load
    #[must_use]
    pub fn retained_module_count(&self) -> usize {
        self.retained.lock().len()
    }

    pub(crate) fn retain_module(&self, module: Arc<IoModule>) {
        self.retained.lock().push(module);
    }

    pub(crate) fn opener(&self) -> Arc<dyn LibraryOpener> {
        Arc::clone(&self.opener)
    }

    pub(crate) fn search_path(&self) -> &ModuleSearchPath {
        &self.search_path
    }

    pub(crate) fn loaded_once(&self) -> &Once {
        &self.loaded
    }

    pub(crate) fn register_builtin_points(&self) {
        for (name, required) in &self.builtin_points {
            let point = self.register(name);
            if let Some(required) = required {
                point.set_required_type(required);
            }
        }
    }

    pub(crate) fn run_builtin_hooks(&self) {
        for hook in &self.builtin_hooks {
            hook(self);
        }
    }

    pub(crate) fn defaults(&self) -> &DefaultCache {
        &self.defaults
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("points", &self.point_names())
            .field("search_path", &self.search_path)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExtensionRegistry`]
#[derive(Default)]
pub struct ExtensionRegistryBuilder {
    opener: Option<Arc<dyn LibraryOpener>>,
    search_path: ModuleSearchPath,
    builtin_points: Vec<(String, Option<CapabilityType>)>,
    builtin_hooks: Vec<BuiltinHook>,
}

impl ExtensionRegistryBuilder {
    /// Open module libraries with `opener` instead of the platform loader
    #[must_use]
    pub fn opener(mut self, opener: impl LibraryOpener + 'static) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    #[must_use]
    pub fn search_path(mut self, search_path: ModuleSearchPath) -> Self {
        self.search_path = search_path;
        self
    }

    /// An extension point registered by `ensure_loaded` before any scan
    #[must_use]
    pub fn builtin_point(mut self, name: &str, required_type: Option<&CapabilityType>) -> Self {
        self.builtin_points
            .push((name.to_string(), required_type.cloned()));
        self
    }

    /// Registration code run by `ensure_loaded` after the scans
    #[must_use]
    pub fn builtin<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionRegistry) + Send + Sync + 'static,
    {
        self.builtin_hooks.push(Box::new(hook));
        self
    }

    #[must_use]
    pub fn build(self) -> ExtensionRegistry {
        ExtensionRegistry {
            points: Mutex::new(HashMap::new()),
            opener: self
                .opener
                .unwrap_or_else(|| Arc::new(DynamicLibraryOpener)),
            search_path: self.search_path,
            builtin_points: self.builtin_points,
            builtin_hooks: self.builtin_hooks,
            loaded: Once::new(),
            retained: Mutex::new(Vec::new()),
            defaults: DefaultCache::default(),
        }
    }
}
