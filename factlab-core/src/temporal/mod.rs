//! Temporal resolution: what was known, and when.

pub mod resolver;
pub mod store;

pub use resolver::{ResolveError, Resolver};
pub use store::FactStore;
