//! # Routing Module
//!
//! Route patterns, routes, the loaders that describe them and the ordered collection
//! the dispatcher matches requests against.

pub mod collection;
pub mod loaders;
pub mod pattern;
pub mod route;

pub use collection::RouteCollection;
pub use loaders::{FileLoader, RouteLoader, StaticLoader};
pub use pattern::RoutePattern;
pub use route::{Route, RouteDescriptor, RouteMatch};
