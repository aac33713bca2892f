//! Default implementation selection
//!
//! Picks the best implementation of an extension point: the one named by an
//! environment variable if it works, otherwise the highest priority one that
//! does. The chosen instance is cached weakly, so it is rebuilt only after
//! every caller has dropped it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::io::{self, Write};
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use super::{CapabilityType, Extension, ExtensionPoint, ExtensionRegistry, Instance};

/// Checks whether a freshly built instance is usable here
pub type VerifyFn<'a> = &'a dyn Fn(&Instance) -> bool;

type WeakInstance = Weak<dyn Any + Send + Sync>;

/// Resolved defaults, keyed by extension point name.
///
/// Both maps sit behind re-entrant locks: building one default may resolve
/// another on the same thread.
#[derive(Default)]
pub(crate) struct DefaultCache {
    instances: ReentrantMutex<RefCell<HashMap<String, WeakInstance>>>,
    types: ReentrantMutex<RefCell<HashMap<String, Option<CapabilityType>>>>,
}

fn no_instance() -> WeakInstance {
    Weak::<()>::new()
}

impl ExtensionRegistry {
    /// Get the default implementation of `point_name`.
    ///
    /// `env_var` names an environment variable that may select an
    /// implementation by name, or be `help` to list the candidates. `verify`
    /// rejects instances that were built but can't work here; it is not
    /// consulted for self-initializing types.
    pub fn get_default(
        &self,
        point_name: &str,
        env_var: Option<&str>,
        verify: Option<VerifyFn<'_>>,
    ) -> Option<Instance> {
        let guard = self.defaults().instances.lock();

        let cached = guard.borrow().get(point_name).and_then(Weak::upgrade);
        if cached.is_some() {
            return cached;
        }

        self.ensure_loaded();

        let Some(point) = self.lookup(point_name) else {
            warn!("Extension point {} is not registered", point_name);
            return None;
        };

        let preferred = self.preferred_extension(&point, env_var);

        let mut chosen = preferred
            .as_ref()
            .and_then(|ext| try_instance(point_name, ext, verify).map(|i| (Arc::clone(ext), i)));

        if chosen.is_none() {
            chosen = self
                .get_extensions(&point)
                .into_iter()
                .filter(|ext| !preferred.as_ref().is_some_and(|p| Arc::ptr_eq(p, ext)))
                .find_map(|ext| try_instance(point_name, &ext, verify).map(|i| (ext, i)));
        }

        let weak = chosen
            .as_ref()
            .map_or_else(no_instance, |(_, instance)| Arc::downgrade(instance));
        guard.borrow_mut().insert(point_name.to_string(), weak);

        match &chosen {
            Some((ext, _)) => debug!("Using {} as default for {}", ext.name(), point_name),
            None => debug!("No default implementation for {}", point_name),
        }

        chosen.map(|(_, instance)| instance)
    }

    /// Like [`get_default`](Self::get_default), downcast to the concrete type
    pub fn get_default_as<T>(
        &self,
        point_name: &str,
        env_var: Option<&str>,
        verify: Option<VerifyFn<'_>>,
    ) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_default(point_name, env_var, verify)?
            .downcast::<T>()
            .ok()
    }

    /// Pick the default implementation type of `point_name` without building it.
    ///
    /// With `check_supported`, types whose support probe fails are skipped.
    /// Failed lookups are cached too.
    pub fn get_default_type(
        &self,
        point_name: &str,
        env_var: Option<&str>,
        check_supported: bool,
    ) -> Option<CapabilityType> {
        let guard = self.defaults().types.lock();

        if let Some(cached) = guard.borrow().get(point_name) {
            return cached.clone();
        }

        self.ensure_loaded();

        let Some(point) = self.lookup(point_name) else {
            warn!("Extension point {} is not registered", point_name);
            return None;
        };

        let usable = |ext: &Arc<Extension>| !check_supported || ext.capability_type().is_supported();

        let preferred = self.preferred_extension(&point, env_var);

        let chosen = preferred
            .clone()
            .filter(|ext| usable(ext))
            .map(|ext| ext.capability_type().clone())
            .or_else(|| {
                self.get_extensions(&point)
                    .into_iter()
                    .filter(|ext| !preferred.as_ref().is_some_and(|p| Arc::ptr_eq(p, ext)))
                    .find(|ext| usable(ext))
                    .map(|ext| ext.capability_type().clone())
            });

        guard
            .borrow_mut()
            .insert(point_name.to_string(), chosen.clone());

        chosen
    }

    /// Print the candidates of `point` to stdout
    pub fn print_candidates(&self, env_var: &str, point: &ExtensionPoint) {
        let stdout = io::stdout();
        if let Err(e) = self.write_candidates(env_var, point, &mut stdout.lock()) {
            warn!("Failed to list candidates for {}: {}", env_var, e);
        }
    }

    /// Write the names and priorities of `point`'s extensions, one per line
    pub fn write_candidates<W: Write>(
        &self,
        env_var: &str,
        point: &ExtensionPoint,
        out: &mut W,
    ) -> io::Result<()> {
        let extensions = self.get_extensions(point);

        writeln!(out, "Supported arguments for {} environment variable:", env_var)?;

        if extensions.is_empty() {
            return writeln!(out, " (none)");
        }

        let width = extensions.iter().map(|e| e.name().len()).max().unwrap_or(0);
        for extension in &extensions {
            writeln!(out, " {:>width$} - {}", extension.name(), extension.priority())?;
        }

        Ok(())
    }

    /// The extension named by `env_var`, if it is set and names one
    fn preferred_extension(
        &self,
        point: &ExtensionPoint,
        env_var: Option<&str>,
    ) -> Option<Arc<Extension>> {
        let env_var = env_var?;
        let wanted = env::var(env_var).ok()?;

        if wanted == "help" {
            self.print_candidates(env_var, point);
            return None;
        }

        let found = self.get_extension_by_name(point, &wanted);
        if found.is_none() {
            warn!("Can't find module '{}' specified in {}", wanted, env_var);
        }
        found
    }
}

fn try_instance(point_name: &str, extension: &Extension, verify: Option<VerifyFn<'_>>) -> Option<Instance> {
    let capability_type = extension.capability_type();

    let instance = match capability_type.instantiate() {
        Ok(instance) => instance,
        Err(e) => {
            debug!(
                "Failed to initialize {} ({}) for {}: {}",
                extension.name(),
                capability_type,
                point_name,
                e
            );
            return None;
        }
    };

    if capability_type.is_initable() {
        return Some(instance);
    }

    match verify {
        Some(verify) if !verify(&instance) => None,
        _ => Some(instance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::InitError;
    use crate::module::ModuleSearchPath;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Backend(&'static str);

    fn registry_with(candidates: &[(&'static str, i32, bool)]) -> ExtensionRegistry {
        let registry = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();
        registry.register("backend");

        for &(name, priority, works) in candidates {
            let ty = CapabilityType::builder(name)
                .initable(move || {
                    if works {
                        Ok(Backend(name))
                    } else {
                        Err(InitError::new(format!("{name} unavailable")))
                    }
                })
                .build();
            registry.implement("backend", &ty, name, priority);
        }

        registry
    }

    fn backend_name(instance: &Instance) -> &'static str {
        Arc::clone(instance).downcast::<Backend>().map_or("?", |b| b.0)
    }

    #[test]
    fn test_highest_working_priority_wins() {
        let registry = registry_with(&[("low", 1, true), ("high", 10, false), ("mid", 5, true)]);

        let instance = registry.get_default("backend", None, None).unwrap();
        assert_eq!(backend_name(&instance), "mid");
    }

    #[test]
    fn test_environment_preference() {
        let registry = registry_with(&[("low", 1, true), ("high", 10, true)]);

        env::set_var("KILN_TEST_DEFAULT_PREFERRED", "low");
        let instance = registry.get_default("backend", Some("KILN_TEST_DEFAULT_PREFERRED"), None);
        env::remove_var("KILN_TEST_DEFAULT_PREFERRED");

        assert_eq!(instance.as_ref().map(backend_name), Some("low"));
    }

    #[test]
    fn test_failed_preference_falls_back() {
        let registry = registry_with(&[("broken", 1, false), ("high", 10, true)]);

        env::set_var("KILN_TEST_DEFAULT_BROKEN", "broken");
        let instance = registry.get_default("backend", Some("KILN_TEST_DEFAULT_BROKEN"), None);
        env::remove_var("KILN_TEST_DEFAULT_BROKEN");

        assert_eq!(instance.as_ref().map(backend_name), Some("high"));
    }

    #[test]
    fn test_unknown_preference_is_ignored() {
        let registry = registry_with(&[("high", 10, true)]);

        env::set_var("KILN_TEST_DEFAULT_UNKNOWN", "nonexistent");
        let instance = registry.get_default("backend", Some("KILN_TEST_DEFAULT_UNKNOWN"), None);
        env::remove_var("KILN_TEST_DEFAULT_UNKNOWN");

        assert_eq!(instance.as_ref().map(backend_name), Some("high"));
    }

    #[test]
    fn test_help_lists_candidates_and_keeps_default() {
        let registry = registry_with(&[("low", 1, true), ("high", 10, true)]);

        env::set_var("KILN_TEST_DEFAULT_HELP", "help");
        let instance = registry.get_default("backend", Some("KILN_TEST_DEFAULT_HELP"), None);
        env::remove_var("KILN_TEST_DEFAULT_HELP");

        assert_eq!(instance.as_ref().map(backend_name), Some("high"));
    }

    #[test]
    fn test_write_candidates() {
        let registry = registry_with(&[("low", 1, true), ("highest", 10, true)]);
        let point = registry.lookup("backend").unwrap();

        let mut out = Vec::new();
        registry
            .write_candidates("KILN_BACKEND", &point, &mut out)
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Supported arguments for KILN_BACKEND environment variable:\n \
             highest - 10\n     low - 1\n"
        );

        registry.register("empty");
        let empty = registry.lookup("empty").unwrap();
        let mut out = Vec::new();
        registry.write_candidates("KILN_EMPTY", &empty, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Supported arguments for KILN_EMPTY environment variable:\n (none)\n"
        );
    }

    #[test]
    fn test_weak_cache() {
        static VERIFIED: AtomicUsize = AtomicUsize::new(0);

        let registry = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();
        registry.register("monitor");
        let ty = CapabilityType::builder("PollMonitor")
            .constructor(|| Backend("poll"))
            .build();
        registry.implement("monitor", &ty, "poll", 0);

        let verify = |_: &Instance| {
            VERIFIED.fetch_add(1, Ordering::SeqCst);
            true
        };

        let first = registry.get_default("monitor", None, Some(&verify)).unwrap();
        let second = registry.get_default("monitor", None, Some(&verify)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(VERIFIED.load(Ordering::SeqCst), 1);

        drop(first);
        drop(second);

        let third = registry.get_default("monitor", None, Some(&verify)).unwrap();
        assert_eq!(backend_name(&third), "poll");
        assert_eq!(VERIFIED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_verify_rejects_instance() {
        let registry = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();
        registry.register("monitor");
        for (name, priority) in [("netlink", 20), ("base", 0)] {
            let ty = CapabilityType::builder(name)
                .constructor(move || Backend(name))
                .build();
            registry.implement("monitor", &ty, name, priority);
        }

        let verify = |instance: &Instance| backend_name(instance) != "netlink";
        let instance = registry.get_default("monitor", None, Some(&verify)).unwrap();

        assert_eq!(backend_name(&instance), "base");
    }

    #[test]
    fn test_missing_point() {
        let registry = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();

        assert!(registry.get_default("nowhere", None, None).is_none());
        assert!(registry.get_default_type("nowhere", None, true).is_none());
    }

    #[test]
    fn test_default_type() {
        fn unsupported() -> bool {
            false
        }

        let registry = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();
        registry.register("vfs");

        let gvfs = CapabilityType::builder("DaemonVfs")
            .is_supported(unsupported)
            .build();
        let local = CapabilityType::interface("LocalVfs");
        registry.implement("vfs", &gvfs, "gvfs", 10);
        registry.implement("vfs", &local, "local", 0);

        assert_eq!(registry.get_default_type("vfs", None, true), Some(local));

        let fresh = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();
        fresh.register("vfs");
        fresh.implement("vfs", &gvfs, "gvfs", 10);
        assert_eq!(fresh.get_default_type("vfs", None, false), Some(gvfs));
    }

    #[test]
    fn test_default_type_caches_failure() {
        let registry = ExtensionRegistry::builder()
            .search_path(ModuleSearchPath::empty())
            .build();
        registry.register("empty");

        assert!(registry.get_default_type("empty", None, true).is_none());

        let late = CapabilityType::interface("Late");
        registry.implement("empty", &late, "late", 0);

        assert!(registry.get_default_type("empty", None, true).is_none());
    }
}
