//! # Dispatcher
//!
//! Entry point of the engine. `handle` finds the first matching route, rewrites the
//! request to its target, runs the merged global + route middleware chain and reports
//! one of three results to the host:
//!
//! - `Ok(Some(response))`: the request was handled
//! - `Ok(None)`: no route matched, or a middleware asked for the host to take over
//! - `Err(error)`: an error nothing in the chain recovered from

use axum::http::header::HOST;
use axum::http::Uri;
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Endpoint, Middleware, MiddlewareChain, Outcome};
use crate::protocols::http::{Transport, TransportEndpoint};
use crate::routing::collection::RouteCollection;

pub struct Dispatcher {
    collection: RwLock<RouteCollection>,
    global: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Endpoint>,
}

impl Dispatcher {
    /// Dispatcher forwarding matched requests through `transport`
    pub fn new(collection: RouteCollection, transport: Arc<dyn Transport>) -> Self {
        Self::with_endpoint(collection, Arc::new(TransportEndpoint::new(transport)))
    }

    /// Dispatcher terminating every chain in a custom endpoint
    pub fn with_endpoint(collection: RouteCollection, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            collection: RwLock::new(collection),
            global: Vec::new(),
            endpoint,
        }
    }

    /// Middleware applied to every route
    pub fn with_global_middlewares(mut self, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        self.global = middlewares;
        self
    }

    pub fn global_middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.global
    }

    /// Number of currently loaded routes
    pub async fn route_count(&self) -> usize {
        self.collection.read().await.len()
    }

    /// Reload routes from every loader
    pub async fn reload(&self) -> GatewayResult<usize> {
        self.collection.write().await.load().await
    }

    /// Drop cached loader output and the loaded routes
    pub async fn clear_cache(&self) -> GatewayResult<()> {
        self.collection.write().await.clear_cache().await
    }

    /// Handle one request
    #[instrument(
        skip(self, request),
        fields(request_id = %request.id, method = %request.method, path = %request.uri.path())
    )]
    pub async fn handle(&self, mut request: IncomingRequest) -> GatewayResult<Option<GatewayResponse>> {
        let matched = self
            .collection
            .read()
            .await
            .find(&request.method, request.path(), request.query());

        let Some(matched) = matched else {
            debug!("No route matched");
            counter!("dispatcher_requests_total", "outcome" => "unmatched").increment(1);
            return Ok(None);
        };

        let context = RequestContext {
            request_id: request.id.clone(),
            incoming_url: request.full_url(),
            client_ip: request.client_ip(),
            route_pattern: matched.route.pattern().as_str().to_string(),
            captures: matched.captures,
            target_url: matched.target_url,
            service: matched.route.service().to_string(),
        };

        request.uri = context.target_url.parse::<Uri>().map_err(|e| {
            GatewayError::invalid_request(format!("Invalid target URL '{}': {}", context.target_url, e))
        })?;
        request.headers.remove(HOST);

        let chain = MiddlewareChain::assemble(&self.global, matched.route.middlewares());
        debug!(
            route = %context.route_pattern,
            target = %context.target_url,
            middlewares = ?chain.names(),
            "Dispatching request"
        );

        match chain.execute(request, &context, self.endpoint.as_ref()).await {
            Ok(Outcome::Response(response)) => {
                counter!("dispatcher_requests_total", "outcome" => "handled").increment(1);
                Ok(Some(response))
            }
            Ok(Outcome::Fallback) => {
                debug!("Middleware deferred the request to the host");
                counter!("dispatcher_requests_total", "outcome" => "fallback").increment(1);
                Ok(None)
            }
            Err(error) => {
                warn!(error = %error, target = %context.target_url, "Request failed");
                counter!("dispatcher_requests_total", "outcome" => "error").increment(1);
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("global", &self.global.iter().map(|m| m.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
