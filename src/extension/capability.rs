//! Capability types
//!
//! A [`CapabilityType`] is the runtime descriptor an extension point is keyed on:
//! it has a name, an optional parent, a list of implemented interfaces (used for
//! "is-a" checks when implementations are registered), an optional constructor
//! and an optional "is this usable here" probe.
//!
//! Types compare by identity, like the type handles of a runtime type system:
//! two descriptors built from the same name are still different types.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;

/// A constructed implementation object.
///
/// Callers recover the concrete type with [`Arc::downcast`].
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Returned by a self-initializing implementation that cannot work in the
/// current environment.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InitError(pub String);

impl InitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type PlainFactory = Arc<dyn Fn() -> Instance + Send + Sync>;
type FallibleFactory = Arc<dyn Fn() -> Result<Instance, InitError> + Send + Sync>;

/// How instances of a type are created
#[derive(Clone)]
enum Constructor {
    /// Construction always succeeds; usability is checked afterwards by the
    /// caller's verify function
    Plain(PlainFactory),
    /// Construction runs the type's own initialization, which may refuse
    Initable(FallibleFactory),
}

struct TypeInfo {
    name: String,
    parent: Option<CapabilityType>,
    interfaces: Vec<CapabilityType>,
    constructor: Option<Constructor>,
    is_supported: Option<fn() -> bool>,
}

/// Runtime type descriptor used for extension points and their implementations
#[derive(Clone)]
pub struct CapabilityType(Arc<TypeInfo>);

impl CapabilityType {
    /// Start describing a new type
    pub fn builder(name: impl Into<String>) -> CapabilityTypeBuilder {
        CapabilityTypeBuilder {
            name: name.into(),
            parent: None,
            interfaces: Vec::new(),
            constructor: None,
            is_supported: None,
        }
    }

    /// A type with no constructor, used as a required type for extension points
    pub fn interface(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<&CapabilityType> {
        self.0.parent.as_ref()
    }

    /// Whether this type is `other`, derives from it, or implements it
    #[must_use]
    pub fn is_a(&self, other: &CapabilityType) -> bool {
        if self == other {
            return true;
        }

        if self.0.interfaces.iter().any(|iface| iface.is_a(other)) {
            return true;
        }

        match &self.0.parent {
            Some(parent) => parent.is_a(other),
            None => false,
        }
    }

    /// Whether construction goes through the type's own fallible initialization
    #[must_use]
    pub fn is_initable(&self) -> bool {
        matches!(self.0.constructor, Some(Constructor::Initable(_)))
    }

    /// Whether the type can be instantiated at all
    #[must_use]
    pub fn is_instantiable(&self) -> bool {
        self.0.constructor.is_some()
    }

    /// Run the type's "usable in this environment" probe.
    ///
    /// Types without a probe are always considered usable.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.0.is_supported.map_or(true, |probe| probe())
    }

    /// Create a new instance of this type
    ///
    /// # Errors
    /// Returns an error if the type has no constructor, or if a
    /// self-initializing type refuses to initialize.
    pub fn instantiate(&self) -> Result<Instance, InitError> {
        match &self.0.constructor {
            Some(Constructor::Plain(factory)) => Ok(factory()),
            Some(Constructor::Initable(factory)) => factory(),
            None => Err(InitError(format!(
                "type {} cannot be instantiated",
                self.name()
            ))),
        }
    }
}

impl PartialEq for CapabilityType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CapabilityType {}

impl Hash for CapabilityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CapabilityType").field(&self.0.name).finish()
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Builder for [`CapabilityType`]
pub struct CapabilityTypeBuilder {
    name: String,
    parent: Option<CapabilityType>,
    interfaces: Vec<CapabilityType>,
    constructor: Option<Constructor>,
    is_supported: Option<fn() -> bool>,
}

impl CapabilityTypeBuilder {
    #[must_use]
    pub fn parent(mut self, parent: &CapabilityType) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    #[must_use]
    pub fn implements(mut self, interface: &CapabilityType) -> Self {
        self.interfaces.push(interface.clone());
        self
    }

    /// Instances are built with `factory` and checked by the caller afterwards
    #[must_use]
    pub fn constructor<T, F>(mut self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.constructor = Some(Constructor::Plain(Arc::new(move || {
            Arc::new(factory()) as Instance
        })));
        self
    }

    /// Instances are built with `factory`, which may refuse to initialize
    #[must_use]
    pub fn initable<T, F>(mut self, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> Result<T, InitError> + Send + Sync + 'static,
    {
        self.constructor = Some(Constructor::Initable(Arc::new(move || {
            factory().map(|value| Arc::new(value) as Instance)
        })));
        self
    }

    /// Probe consulted by class-only default resolution
    #[must_use]
    pub fn is_supported(mut self, probe: fn() -> bool) -> Self {
        self.is_supported = Some(probe);
        self
    }

    #[must_use]
    pub fn build(self) -> CapabilityType {
        CapabilityType(Arc::new(TypeInfo {
            name: self.name,
            parent: self.parent,
            interfaces: self.interfaces,
            constructor: self.constructor,
            is_supported: self.is_supported,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = CapabilityType::interface("Vfs");
        let b = CapabilityType::interface("Vfs");

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_a_follows_parents_and_interfaces() {
        let object = CapabilityType::interface("Object");
        let monitor = CapabilityType::interface("VolumeMonitor");
        let native = CapabilityType::builder("NativeVolumeMonitor")
            .parent(&object)
            .implements(&monitor)
            .build();
        let unix = CapabilityType::builder("UnixVolumeMonitor")
            .parent(&native)
            .build();

        assert!(unix.is_a(&native));
        assert!(unix.is_a(&monitor));
        assert!(unix.is_a(&object));
        assert!(!monitor.is_a(&unix));
    }

    #[test]
    fn test_instantiate() {
        let plain = CapabilityType::builder("Plain").constructor(|| 42u32).build();
        let refusing = CapabilityType::builder("Refusing")
            .initable(|| Err::<u32, _>(InitError::new("no backend here")))
            .build();
        let abstract_type = CapabilityType::interface("Abstract");

        let value = plain.instantiate().unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 42);
        assert!(!plain.is_initable());

        assert!(refusing.is_initable());
        assert_eq!(
            refusing.instantiate().err().map(|e| e.to_string()),
            Some("no backend here".to_string())
        );

        assert!(!abstract_type.is_instantiable());
        assert!(abstract_type.instantiate().is_err());
    }

    #[test]
    fn test_supported_probe() {
        fn never() -> bool {
            false
        }

        let unprobed = CapabilityType::interface("Unprobed");
        let unsupported = CapabilityType::builder("Unsupported")
            .is_supported(never)
            .build();

        assert!(unprobed.is_supported());
        assert!(!unsupported.is_supported());
    }
}
