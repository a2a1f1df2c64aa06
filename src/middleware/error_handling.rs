//! # Error Handling Middleware
//!
//! Two outer layers that decide what the host sees when the backend misbehaves:
//!
//! - [`ErrorHandlingMiddleware`] turns transport failures into `502 Bad Gateway` (or
//!   `504 Gateway Timeout` for timeouts) JSON responses. Every other error propagates.
//! - [`FallbackMiddleware`] turns configured response statuses into [`Outcome::Fallback`],
//!   handing the request back to the host instead of returning the backend's answer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingConfig {
    /// Include the transport error text in the response body
    pub expose_errors: bool,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self { expose_errors: true }
    }
}

#[derive(Debug)]
pub struct ErrorHandlingMiddleware {
    config: ErrorHandlingConfig,
}

impl ErrorHandlingMiddleware {
    pub fn new(config: ErrorHandlingConfig) -> Self {
        Self { config }
    }

    /// Build from `error_handling[:expose_errors]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Ok(Self::new(args.into_config(&["expose_errors"])?))
    }
}

#[async_trait]
impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &str {
        "error_handling"
    }

    fn priority(&self) -> i32 {
        -50
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        match next.run(request, context).await {
            Err(err) if err.is_transport() => {
                let status = err.status_code();
                error!(
                    request_id = %context.request_id,
                    target = %context.target_url,
                    status = status.as_u16(),
                    error = %err,
                    "Backend request failed"
                );

                let message = if err.is_timeout() { "Gateway Timeout" } else { "Bad Gateway" };
                let mut body = json!({
                    "error": {
                        "code": status.as_u16(),
                        "message": message,
                    },
                    "request_id": context.request_id,
                });
                if self.config.expose_errors {
                    body["error"]["details"] = json!(err.to_string());
                }
                Ok(Outcome::Response(GatewayResponse::json(status, &body)))
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Backend statuses that hand the request back to the host
    #[serde(deserialize_with = "lenient::status_list")]
    pub statuses: Vec<u16>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { statuses: vec![404] }
    }
}

#[derive(Debug)]
pub struct FallbackMiddleware {
    config: FallbackConfig,
}

impl FallbackMiddleware {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    /// Build from `fallback[:status,...]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Ok(Self::new(args.into_config(&["statuses*"])?))
    }
}

#[async_trait]
impl Middleware for FallbackMiddleware {
    fn name(&self) -> &str {
        "fallback"
    }

    fn priority(&self) -> i32 {
        -40
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let outcome = next.run(request, context).await?;
        match outcome {
            Outcome::Response(response) if self.config.statuses.contains(&response.status.as_u16()) => {
                debug!(
                    request_id = %context.request_id,
                    status = response.status.as_u16(),
                    "Deferring request to host"
                );
                Ok(Outcome::Fallback)
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayError;
    use crate::middleware::pipeline::test_support::*;
    use axum::http::{Method, StatusCode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_transport_errors_become_gateway_responses() {
        let handler = Arc::new(ErrorHandlingMiddleware::new(ErrorHandlingConfig::default()));
        let endpoint = ScriptedEndpoint::scripted(vec![
            Err(GatewayError::transport("connection refused")),
            Err(GatewayError::transport("request timed out")),
        ]);

        let refused = run_one(handler.clone(), request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(refused.status, StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = serde_json::from_slice(&refused.body).unwrap();
        assert_eq!(body["error"]["message"], "Bad Gateway");
        assert!(body["error"]["details"].as_str().unwrap().contains("connection refused"));

        let timed_out = run_one(handler, request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(timed_out.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_swallowed() {
        let handler = Arc::new(ErrorHandlingMiddleware::new(ErrorHandlingConfig { expose_errors: false }));
        let endpoint = ScriptedEndpoint::scripted(vec![Err(GatewayError::config("bad"))]);
        let result = run_one(handler, request(Method::GET, "http://b/"), &context(), &endpoint).await;
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_fallback_on_configured_statuses() {
        let args = crate::middleware::spec::normalize(&serde_json::json!("fallback:404,410")).unwrap();
        let fallback = Arc::new(FallbackMiddleware::from_args(&args).unwrap());
        let endpoint = ScriptedEndpoint::scripted(vec![status(404), status(410), status(500)]);

        for _ in 0..2 {
            let outcome = run_one(fallback.clone(), request(Method::GET, "http://b/"), &context(), &endpoint)
                .await
                .unwrap();
            assert!(outcome.is_fallback());
        }
        let outcome = run_one(fallback, request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap();
        assert_eq!(outcome.response().unwrap().status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_fallback_defaults_to_not_found() {
        let fallback = FallbackMiddleware::from_args(&MiddlewareArgs::new("fallback")).unwrap();
        assert_eq!(fallback.config.statuses, vec![404]);
    }
}
