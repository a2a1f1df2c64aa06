//! # Middleware Module
//!
//! The onion-style chain, the spec normalization and factory that build middleware from
//! route descriptors, and every built-in middleware.

pub mod access_control;
pub mod circuit_breaker;
pub mod cors;
pub mod error_handling;
pub mod factory;
pub mod pipeline;
pub mod rate_limiting;
pub mod request_id;
pub mod request_logging;
pub mod retry;
pub mod spec;
pub mod timeout;
pub mod transformation;

pub use access_control::{AllowMethodsMiddleware, IpFilterMiddleware};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitState, CircuitStatus};
pub use cors::CorsMiddleware;
pub use error_handling::{ErrorHandlingMiddleware, FallbackMiddleware};
pub use factory::{FnConstructor, MiddlewareConstructor, MiddlewareFactory, MiddlewareRegistry, SharedState};
pub use pipeline::{Endpoint, Middleware, MiddlewareChain, Next, Outcome, WithPriority};
pub use rate_limiting::{RateLimitConfig, RateLimitKey, RateLimitMiddleware, RateLimitResult};
pub use request_id::RequestIdMiddleware;
pub use request_logging::RequestLoggingMiddleware;
pub use retry::{RetryConfig, RetryMiddleware};
pub use spec::{normalize, normalize_many, MiddlewareArgs};
pub use timeout::TimeoutMiddleware;
pub use transformation::{
    BodyRewriteMiddleware, Direction, HeaderMiddleware, PathRewriteMiddleware, SanitizeHeadersMiddleware,
};
