//! Routes and route descriptors.

use axum::http::Method;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};
use crate::middleware::pipeline::{sort_by_priority, Middleware};
use crate::middleware::spec::lenient;
use crate::routing::pattern::RoutePattern;

/// The raw shape every route loader emits
#[derive(Debug, Clone, Deserialize)]
pub struct RouteDescriptor {
    #[serde(deserialize_with = "lenient::string")]
    pub path: String,

    #[serde(deserialize_with = "lenient::string")]
    pub target: String,

    #[serde(default, deserialize_with = "lenient::string_list")]
    pub methods: Vec<String>,

    /// Middleware specs in any supported shape
    #[serde(default)]
    pub middlewares: Value,

    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// A pattern, a backend target and the middleware that wrap calls to it.
///
/// Middleware are kept sorted by priority, declaration order breaking ties.
#[derive(Clone)]
pub struct Route {
    pattern: RoutePattern,
    target: String,
    service: String,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Route {
    /// Build a route; `target` must be an absolute URL
    pub fn new(pattern: RoutePattern, target: impl Into<String>, mut middlewares: Vec<Arc<dyn Middleware>>) -> GatewayResult<Self> {
        let target = target.into();
        let parsed = url::Url::parse(&target)
            .map_err(|e| GatewayError::config(format!("Invalid route target '{}': {}", target, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::config(format!("Route target '{}' has no host", target)))?;
        let service = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        sort_by_priority(&mut middlewares);
        Ok(Self {
            pattern,
            target,
            service,
            middlewares,
        })
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    /// Target base as configured
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Backend identity (`host[:port]` of the target)
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Middleware in execution order
    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Captures when this route accepts the request
    pub fn matches(&self, method: &Method, path: &str) -> Option<Vec<String>> {
        self.pattern.matches(method, path)
    }

    /// Forwarded URL for a request this route matched
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        self.pattern.target_url(&self.target, path, query)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.as_str())
            .field("target", &self.target)
            .field(
                "middlewares",
                &self.middlewares.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A route selected for a request
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub captures: Vec<String>,
    pub target_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayResult;
    use crate::core::types::{IncomingRequest, RequestContext};
    use crate::middleware::pipeline::{Next, Outcome};
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug)]
    struct Ranked(&'static str, i32);

    #[async_trait]
    impl Middleware for Ranked {
        fn name(&self) -> &str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.1
        }

        async fn process(
            &self,
            request: IncomingRequest,
            context: &RequestContext,
            next: Next<'_>,
        ) -> GatewayResult<Outcome> {
            next.run(request, context).await
        }
    }

    #[test]
    fn test_route_sorts_middlewares() {
        let route = Route::new(
            RoutePattern::parse("/api/*").unwrap(),
            "http://backend:8080/",
            vec![
                Arc::new(Ranked("b", 5)),
                Arc::new(Ranked("a", -5)),
                Arc::new(Ranked("c", 5)),
            ],
        )
        .unwrap();

        let names: Vec<_> = route.middlewares().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(route.service(), "backend:8080");
        assert_eq!(route.target_url("/api/x", Some("y=1")), "http://backend:8080/x?y=1");
    }

    #[test]
    fn test_invalid_targets() {
        let pattern = RoutePattern::parse("/x").unwrap();
        assert!(Route::new(pattern.clone(), "not a url", vec![]).is_err());
        assert!(Route::new(pattern, "/relative", vec![]).is_err());
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: RouteDescriptor =
            serde_json::from_value(json!({"path": "/a", "target": "http://b"})).unwrap();
        assert!(descriptor.enabled);
        assert!(descriptor.methods.is_empty());
        assert!(descriptor.middlewares.is_null());

        assert!(serde_json::from_value::<RouteDescriptor>(json!({"path": "/a"})).is_err());
    }
}
