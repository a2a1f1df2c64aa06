use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use serde::Deserialize;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    #[serde(deserialize_with = "lenient::string")]
    pub header: String,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header: "x-request-id".to_string(),
        }
    }
}

/// Ensures the request carries an ID and echoes it on the response.
///
/// A client-supplied ID is kept; otherwise the dispatcher's request ID is used.
#[derive(Debug)]
pub struct RequestIdMiddleware {
    header: HeaderName,
}

impl RequestIdMiddleware {
    pub fn new(config: RequestIdConfig) -> GatewayResult<Self> {
        let header = HeaderName::from_bytes(config.header.trim().as_bytes()).map_err(|e| {
            GatewayError::config(format!(
                "Invalid request id header '{}': {}",
                config.header, e
            ))
        })?;
        Ok(Self { header })
    }

    /// Build from `request_id[:header]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["header"])?)
    }
}

#[async_trait]
impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &str {
        "request_id"
    }

    fn priority(&self) -> i32 {
        -90
    }

    async fn process(
        &self,
        mut request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let id = match request.headers.get(&self.header) {
            Some(existing) => existing.clone(),
            None => {
                let generated = HeaderValue::from_str(&context.request_id)
                    .or_else(|_| HeaderValue::from_str(&request.id))
                    .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
                request.headers.insert(self.header.clone(), generated.clone());
                generated
            }
        };

        let outcome = next.run(request, context).await?;
        Ok(outcome.map_response(|mut response| {
            response.headers.insert(self.header.clone(), id);
            response
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::pipeline::test_support::*;
    use axum::http::{Method, StatusCode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_generates_and_echoes_id() {
        let middleware = Arc::new(RequestIdMiddleware::new(RequestIdConfig::default()).unwrap());
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let outcome = run_one(middleware, request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap();

        assert_eq!(endpoint.last_request().unwrap().header("x-request-id"), Some("test"));
        assert_eq!(outcome.response().unwrap().header("x-request-id"), Some("test"));
    }

    #[tokio::test]
    async fn test_keeps_client_id() {
        let args = crate::middleware::spec::normalize(&serde_json::json!("request_id:X-Correlation-ID")).unwrap();
        let middleware = Arc::new(RequestIdMiddleware::from_args(&args).unwrap());
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let mut req = request(Method::GET, "http://b/");
        req.headers.insert("x-correlation-id", "abc-123".parse().unwrap());

        let outcome = run_one(middleware, req, &context(), &endpoint).await.unwrap();
        assert_eq!(outcome.response().unwrap().header("x-correlation-id"), Some("abc-123"));
    }
}
