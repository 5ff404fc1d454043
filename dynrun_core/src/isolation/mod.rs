//! Isolation units: private, collectible execution contexts.

mod resolver;
mod unit;

pub use resolver::DependencyResolver;
pub use unit::{IsolationUnit, UnitOptions, UnitState};

pub(crate) use unit::UnitInner;
