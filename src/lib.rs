//! # Route Dispatcher - Core Library Crate
//!
//! An embeddable reverse-proxy dispatcher. Requests are matched against an ordered set of
//! routes, run through a priority-sorted middleware chain and forwarded to the route's
//! backend. When nothing matches, the dispatcher says so and the host carries on.
//!
//! ## Request flow
//! 1. [`RouteCollection`] finds the first route whose pattern accepts the method and path
//! 2. The request is rewritten to the route's target URL
//! 3. Global and route middleware are merged and stable-sorted by priority
//! 4. The chain runs, ending in the backend [`Transport`](protocols::Transport)
//! 5. The host receives a response, "not handled", or an error
//!
//! Stateful middleware (circuit breaker, rate limiter, response cache) keep their state in
//! a shared [`KvStore`](caching::KvStore) so several dispatcher processes can cooperate.

/// Core functionality: error types, configuration, request/response types, clocks
pub mod core;

/// Dispatcher entry point and the axum host
pub mod gateway;

/// Middleware chain, spec normalization, factory and built-in middleware
pub mod middleware;

/// Backend transport
pub mod protocols;

/// Route patterns, routes, loaders and the route collection
pub mod routing;

/// Key-value stores and the response cache middleware
pub mod caching;

/// Main error type used throughout the dispatcher
pub use core::error::{GatewayError, GatewayResult};

/// Host configuration
pub use core::config::DispatcherConfig;

pub use core::types::{GatewayResponse, IncomingRequest, RequestContext};

pub use gateway::{Dispatcher, DispatcherServer};
pub use middleware::{Middleware, MiddlewareFactory, MiddlewareRegistry, Outcome, SharedState};
pub use routing::{FileLoader, Route, RouteCollection, RouteLoader, RoutePattern, StaticLoader};
