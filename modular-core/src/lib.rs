//! # Modular Core
//!
//! The pure, I/O-free heart of the modular API facade: the resource-pattern
//! grammar, the policy evaluation engine, the command catalog model, and the
//! module descriptor types.
//!
//! Everything in this crate is deterministic and unit-testable. Patterns are
//! parsed once at load time into tagged variants; evaluation never touches a
//! string parser again.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible)]

pub mod catalog;
pub mod descriptor;
pub mod pattern;
pub mod policy;

pub use catalog::{Catalog, CatalogBuilder, CommandMeta, Parameter, ParamType, Route};
pub use descriptor::{Dependency, ModuleDescriptor};
pub use pattern::{CommandPath, ResourcePattern};
pub use policy::{Decision, Effect, Statement};

/// Current version of the modular-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::const_is_empty)]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
