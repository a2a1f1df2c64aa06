//! # Middleware Pipeline System
//!
//! Onion-style middleware chain. Each middleware receives the outgoing request and a
//! [`Next`] handle; it may rewrite the request before calling `next.run(..)`, rewrite the
//! outcome afterwards, or answer on its own without calling `next` at all. The innermost
//! `next` is the [`Endpoint`], normally the backend transport.
//!
//! ## Ordering
//! Middleware run in ascending [`Middleware::priority`] order: the lowest value is the
//! outermost layer. The sort is stable, so equal priorities keep declaration order.
//!
//! ## Outcomes
//! A chain produces [`Outcome::Response`] or [`Outcome::Fallback`]. The fallback is a
//! control-flow result meaning "let the host handle this request"; it is not an error and
//! is never logged as one. Errors travel separately as
//! [`GatewayError`](crate::core::error::GatewayError).

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};

/// Result of running a request through a chain
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A response for the client
    Response(GatewayResponse),
    /// The dispatcher should report "not handled" to the host
    Fallback,
}

impl Outcome {
    /// The response, if any
    pub fn into_response(self) -> Option<GatewayResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Fallback => None,
        }
    }

    /// Borrow the response, if any
    pub fn response(&self) -> Option<&GatewayResponse> {
        match self {
            Self::Response(response) => Some(response),
            Self::Fallback => None,
        }
    }

    /// Transform the response, leaving a fallback untouched
    pub fn map_response<F>(self, f: F) -> Self
    where
        F: FnOnce(GatewayResponse) -> GatewayResponse,
    {
        match self {
            Self::Response(response) => Self::Response(f(response)),
            Self::Fallback => Self::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }
}

impl From<GatewayResponse> for Outcome {
    fn from(response: GatewayResponse) -> Self {
        Self::Response(response)
    }
}

/// Core middleware trait that all middleware must implement
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Get the middleware name for identification and logging
    fn name(&self) -> &str;

    /// Get the middleware priority (lower numbers run first, i.e. further out)
    fn priority(&self) -> i32 {
        0
    }

    /// Process the request, calling `next` zero or more times
    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome>;
}

/// The innermost handler of a chain
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, request: IncomingRequest, context: &RequestContext) -> GatewayResult<Outcome>;
}

/// Handle to the remainder of the chain.
///
/// `Next` is `Copy`, so a middleware such as retry may run the remainder several times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self {
            middlewares,
            endpoint,
        }
    }

    /// Run the remainder of the chain
    pub fn run<'c>(self, request: IncomingRequest, context: &'c RequestContext) -> BoxFuture<'c, GatewayResult<Outcome>>
    where
        'a: 'c,
    {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((current, rest)) => {
                    debug!(middleware = current.name(), "Entering middleware");
                    let next = Next {
                        middlewares: rest,
                        endpoint: self.endpoint,
                    };
                    current.process(request, context, next).await
                }
                None => self.endpoint.call(request, context).await,
            }
        })
    }

    /// Number of middleware still ahead of the endpoint
    pub fn remaining(&self) -> usize {
        self.middlewares.len()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.middlewares.len())
            .finish()
    }
}

/// Stable sort by ascending priority
pub fn sort_by_priority(middlewares: &mut [Arc<dyn Middleware>]) {
    middlewares.sort_by_key(|middleware| middleware.priority());
}

/// An ordered middleware list ready to execute
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Build a chain, sorting the given middleware by priority
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        sort_by_priority(&mut middlewares);
        Self { middlewares }
    }

    /// Merge global and route middleware; on equal priority globals come first
    pub fn assemble(global: &[Arc<dyn Middleware>], route: &[Arc<dyn Middleware>]) -> Self {
        let combined = global.iter().chain(route.iter()).cloned().collect();
        Self::new(combined)
    }

    /// Drive a request through the chain into `endpoint`
    pub async fn execute(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        endpoint: &dyn Endpoint,
    ) -> GatewayResult<Outcome> {
        debug!(
            request_id = %context.request_id,
            middlewares = self.middlewares.len(),
            "Executing middleware chain"
        );
        Next::new(&self.middlewares, endpoint).run(request, context).await
    }

    /// Middleware names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// Overrides the priority of another middleware
#[derive(Debug)]
pub struct WithPriority {
    inner: Arc<dyn Middleware>,
    priority: i32,
}

impl WithPriority {
    pub fn new(inner: Arc<dyn Middleware>, priority: i32) -> Self {
        Self { inner, priority }
    }
}

#[async_trait]
impl Middleware for WithPriority {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        self.inner.process(request, context, next).await
    }
}
