//! # Middleware Factory
//!
//! Turns middleware specifications into middleware instances. The [`MiddlewareRegistry`]
//! maps aliases to constructors and is handed to the [`MiddlewareFactory`] explicitly, so
//! two factories never share registrations by accident.
//!
//! Constructors that keep state across requests (circuit breaker, rate limiter, response
//! cache) declare it through [`MiddlewareConstructor::requires_store`]; the factory hands
//! them the [`SharedState`] it was built with, and refuses to build them without one.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::caching::{ResponseCacheMiddleware, SharedStore};
use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{GatewayError, GatewayResult};
use crate::middleware::access_control::{AllowMethodsMiddleware, IpFilterMiddleware};
use crate::middleware::circuit_breaker::CircuitBreakerMiddleware;
use crate::middleware::cors::CorsMiddleware;
use crate::middleware::error_handling::{ErrorHandlingMiddleware, FallbackMiddleware};
use crate::middleware::pipeline::{Middleware, WithPriority};
use crate::middleware::rate_limiting::RateLimitMiddleware;
use crate::middleware::request_id::RequestIdMiddleware;
use crate::middleware::request_logging::RequestLoggingMiddleware;
use crate::middleware::retry::RetryMiddleware;
use crate::middleware::spec::{normalize, normalize_many, MiddlewareArgs};
use crate::middleware::timeout::TimeoutMiddleware;
use crate::middleware::transformation::{
    BodyRewriteMiddleware, HeaderMiddleware, PathRewriteMiddleware, SanitizeHeadersMiddleware,
};

/// State shared by every stateful middleware built by one factory
#[derive(Debug, Clone)]
pub struct SharedState {
    pub store: SharedStore,
    pub clock: Arc<dyn Clock>,
}

impl SharedState {
    /// Shared state using the system clock
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Trait for middleware constructors
pub trait MiddlewareConstructor: Send + Sync + fmt::Debug {
    fn create(&self, args: &MiddlewareArgs, shared: Option<&SharedState>) -> GatewayResult<Arc<dyn Middleware>>;

    /// Whether the middleware keeps state in the shared store
    fn requires_store(&self) -> bool {
        false
    }
}

type BuildFn = dyn Fn(&MiddlewareArgs, Option<&SharedState>) -> GatewayResult<Arc<dyn Middleware>> + Send + Sync;

/// A constructor backed by a closure
pub struct FnConstructor {
    build: Box<BuildFn>,
    requires_store: bool,
}

impl FnConstructor {
    /// Constructor for a middleware that needs nothing but its options
    pub fn stateless<F, M>(build: F) -> Self
    where
        F: Fn(&MiddlewareArgs) -> GatewayResult<M> + Send + Sync + 'static,
        M: Middleware + 'static,
    {
        Self {
            build: Box::new(move |args, _| Ok(Arc::new(build(args)?) as Arc<dyn Middleware>)),
            requires_store: false,
        }
    }

    /// Constructor for a middleware that keeps state in the shared store
    pub fn stateful<F, M>(build: F) -> Self
    where
        F: Fn(&MiddlewareArgs, &SharedState) -> GatewayResult<M> + Send + Sync + 'static,
        M: Middleware + 'static,
    {
        Self {
            build: Box::new(move |args, shared| {
                let shared = shared.ok_or_else(|| missing_store(&args.name))?;
                Ok(Arc::new(build(args, shared)?) as Arc<dyn Middleware>)
            }),
            requires_store: true,
        }
    }
}

impl fmt::Debug for FnConstructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConstructor")
            .field("requires_store", &self.requires_store)
            .finish()
    }
}

impl MiddlewareConstructor for FnConstructor {
    fn create(&self, args: &MiddlewareArgs, shared: Option<&SharedState>) -> GatewayResult<Arc<dyn Middleware>> {
        (self.build)(args, shared)
    }

    fn requires_store(&self) -> bool {
        self.requires_store
    }
}

fn missing_store(name: &str) -> GatewayError {
    GatewayError::config(format!(
        "Middleware '{}' requires a shared store but the factory has none",
        name
    ))
}

/// Alias table for middleware constructors
#[derive(Debug, Clone, Default)]
pub struct MiddlewareRegistry {
    constructors: HashMap<String, Arc<dyn MiddlewareConstructor>>,
}

impl MiddlewareRegistry {
    /// A registry with no aliases
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry seeded with every built-in middleware
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();

        registry.register("request_logging", FnConstructor::stateless(RequestLoggingMiddleware::from_args));
        registry.register("log", FnConstructor::stateless(RequestLoggingMiddleware::from_args));
        registry.register("request_id", FnConstructor::stateless(RequestIdMiddleware::from_args));
        registry.register("cors", FnConstructor::stateless(CorsMiddleware::from_args));
        registry.register("ip_filter", FnConstructor::stateless(IpFilterMiddleware::from_args));
        registry.register("allow_methods", FnConstructor::stateless(AllowMethodsMiddleware::from_args));
        registry.register("error_handling", FnConstructor::stateless(ErrorHandlingMiddleware::from_args));
        registry.register("fallback", FnConstructor::stateless(FallbackMiddleware::from_args));
        registry.register("rate_limit", FnConstructor::stateful(RateLimitMiddleware::from_args));
        registry.register("sanitize_headers", FnConstructor::stateless(SanitizeHeadersMiddleware::from_args));
        registry.register("cache", FnConstructor::stateful(ResponseCacheMiddleware::from_args));
        registry.register("retry", FnConstructor::stateless(RetryMiddleware::from_args));
        registry.register("timeout", FnConstructor::stateless(TimeoutMiddleware::from_args));
        registry.register("circuit_breaker", FnConstructor::stateful(CircuitBreakerMiddleware::from_args));
        registry.register("request_headers", FnConstructor::stateless(HeaderMiddleware::request_from_args));
        registry.register("response_headers", FnConstructor::stateless(HeaderMiddleware::response_from_args));
        registry.register("path_rewrite", FnConstructor::stateless(PathRewriteMiddleware::from_args));
        registry.register("body_rewrite", FnConstructor::stateless(BodyRewriteMiddleware::from_args));

        debug!("Registered {} built-in middleware constructors", registry.constructors.len());
        registry
    }

    /// Register a constructor under `alias`; a later registration for the same alias wins
    pub fn register<C>(&mut self, alias: impl Into<String>, constructor: C) -> &mut Self
    where
        C: MiddlewareConstructor + 'static,
    {
        let alias = alias.into();
        debug!("Registered middleware alias: {}", alias);
        self.constructors.insert(alias, Arc::new(constructor));
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<C>(mut self, alias: impl Into<String>, constructor: C) -> Self
    where
        C: MiddlewareConstructor + 'static,
    {
        self.register(alias, constructor);
        self
    }

    /// Look up a constructor by alias or by a qualified type name.
    ///
    /// `"circuit_breaker"`, `"CircuitBreaker"`, `"circuit-breaker"` and
    /// `"middleware::CircuitBreakerMiddleware"` all resolve to the same alias.
    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn MiddlewareConstructor>> {
        self.constructors
            .get(name)
            .or_else(|| self.constructors.get(&canonical_alias(name)))
    }

    /// Registered aliases, sorted
    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }
}

/// Reduce a qualified or CamelCase identifier to snake_case alias form
fn canonical_alias(name: &str) -> String {
    let last = name.rsplit("::").next().unwrap_or(name);
    let last = last.rsplit('\\').next().unwrap_or(last);
    let last = last.strip_suffix("Middleware").unwrap_or(last);

    let mut alias = String::with_capacity(last.len() + 4);
    let mut previous_lower = false;
    for ch in last.chars() {
        if ch == '-' || ch == ' ' {
            alias.push('_');
            previous_lower = false;
        } else if ch.is_ascii_uppercase() {
            if previous_lower {
                alias.push('_');
            }
            alias.push(ch.to_ascii_lowercase());
            previous_lower = false;
        } else {
            alias.push(ch);
            previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    alias.trim_end_matches('_').to_string()
}

/// Middleware factory for creating middleware instances
#[derive(Debug, Clone)]
pub struct MiddlewareFactory {
    registry: Arc<MiddlewareRegistry>,
    shared: Option<SharedState>,
}

impl Default for MiddlewareFactory {
    fn default() -> Self {
        Self::new(MiddlewareRegistry::with_builtin())
    }
}

impl MiddlewareFactory {
    pub fn new(registry: MiddlewareRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            shared: None,
        }
    }

    /// Provide the store and clock handed to stateful middleware
    pub fn with_shared(mut self, shared: SharedState) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn registry(&self) -> &MiddlewareRegistry {
        &self.registry
    }

    pub fn shared(&self) -> Option<&SharedState> {
        self.shared.as_ref()
    }

    /// Create a middleware from a single spec of any shape
    pub fn create(&self, spec: &Value) -> GatewayResult<Arc<dyn Middleware>> {
        self.create_from_args(&normalize(spec)?)
    }

    /// Create a middleware from a normalized spec
    pub fn create_from_args(&self, args: &MiddlewareArgs) -> GatewayResult<Arc<dyn Middleware>> {
        let constructor = self.registry.resolve(&args.name).ok_or_else(|| {
            GatewayError::config(format!("Unknown middleware type: {}", args.name))
        })?;

        if constructor.requires_store() && self.shared.is_none() {
            return Err(missing_store(&args.name));
        }

        let middleware = constructor.create(args, self.shared.as_ref())?;
        debug!(
            "Created middleware '{}' with priority {}",
            middleware.name(),
            middleware.priority()
        );

        match args.priority()? {
            Some(priority) => Ok(Arc::new(WithPriority::new(middleware, priority))),
            None => Ok(middleware),
        }
    }

    /// Create every middleware of a spec list, in declaration order
    pub fn create_many(&self, specs: &Value) -> GatewayResult<Vec<Arc<dyn Middleware>>> {
        normalize_many(specs)?
            .iter()
            .map(|args| self.create_from_args(args))
            .collect()
    }
}
