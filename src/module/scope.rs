//! Module scopes: which library basenames a scan may still load

use std::collections::HashSet;

use bitflags::bitflags;

bitflags! {
    /// Behaviour flags for a [`ModuleScope`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleScopeFlags: u32 {
        /// A basename accepted once is blocked for the rest of the scope
        const BLOCK_DUPLICATES = 1 << 0;
    }
}

/// Set of blocked basenames shared across several directory scans
#[derive(Debug, Clone, Default)]
pub struct ModuleScope {
    flags: ModuleScopeFlags,
    blocked: HashSet<String>,
}

impl ModuleScope {
    #[must_use]
    pub fn new(flags: ModuleScopeFlags) -> Self {
        Self {
            flags,
            blocked: HashSet::new(),
        }
    }

    #[must_use]
    pub fn flags(&self) -> ModuleScopeFlags {
        self.flags
    }

    /// Refuse `basename` for the rest of this scope
    pub fn block(&mut self, basename: &str) {
        self.blocked.insert(basename.to_string());
    }

    #[must_use]
    pub fn is_blocked(&self, basename: &str) -> bool {
        self.blocked.contains(basename)
    }

    /// Accept or refuse `basename`, blocking it afterwards when duplicates are
    /// blocked
    pub fn check(&mut self, basename: &str) -> bool {
        if self.is_blocked(basename) {
            return false;
        }

        if self.flags.contains(ModuleScopeFlags::BLOCK_DUPLICATES) {
            self.block(basename);
        }

        true
    }
}

/// Whether `basename` looks like a loadable library on this platform
#[must_use]
pub fn has_module_suffix(basename: &str) -> bool {
    #[cfg(windows)]
    {
        basename.ends_with(".dll")
    }

    #[cfg(not(windows))]
    {
        if !basename.starts_with("lib") {
            return false;
        }

        let dylib = cfg!(target_os = "macos") && basename.ends_with(".dylib");
        dylib || basename.ends_with(".so")
    }
}

/// Whether a directory entry should be considered as a module.
///
/// The name must follow the platform's library naming convention and must
/// not be blocked by `scope`. An accepted name becomes blocked when the
/// scope blocks duplicates.
pub fn is_valid_module_name(basename: &str, scope: Option<&mut ModuleScope>) -> bool {
    if !has_module_suffix(basename) {
        return false;
    }

    match scope {
        Some(scope) => scope.check(basename),
        None => true,
    }
}
