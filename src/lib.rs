//! Kiln - extension points, loadable modules and Unix mount tables
//!
//! This library provides a registry of named extension points that loadable
//! modules plug implementations into, and a view of the mount tables of the
//! running system with change notifications.
//!
//! # Modules
//!
//! - [`config`]: Configuration management and serialization
//! - [`extension`]: Extension points, implementations and default selection
//! - [`module`]: Loadable modules, module directories and their caches
//! - [`mounts`]: Active mounts, configured mount points and their monitor

pub mod config;
pub mod extension;
pub mod module;
pub mod mounts;
