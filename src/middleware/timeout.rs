use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::MiddlewareArgs;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Transport timeout in seconds
    #[serde(alias = "timeout")]
    pub seconds: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { seconds: 30.0 }
    }
}

/// Annotates the outgoing request with a timeout hint and turns transport timeouts into 504.
///
/// The transport enforces the hint; this middleware never races the call itself.
#[derive(Debug)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(config: TimeoutConfig) -> GatewayResult<Self> {
        if !config.seconds.is_finite() || config.seconds <= 0.0 {
            return Err(GatewayError::config(format!(
                "Timeout must be a positive number of seconds, got {}",
                config.seconds
            )));
        }
        Ok(Self {
            timeout: Duration::from_secs_f64(config.seconds),
        })
    }

    /// Build from `timeout[:seconds]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["seconds"])?)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn priority(&self) -> i32 {
        30
    }

    async fn process(
        &self,
        mut request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        // A tighter deadline set by an earlier middleware is kept
        request.timeout = Some(match request.timeout {
            Some(existing) => existing.min(self.timeout),
            None => self.timeout,
        });

        match next.run(request, context).await {
            Err(error) if error.is_timeout() => {
                warn!(
                    request_id = %context.request_id,
                    target = %context.target_url,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Backend timed out"
                );
                Ok(Outcome::Response(GatewayResponse::error(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("Backend did not respond within {:?}", self.timeout),
                )))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::pipeline::test_support::*;
    use axum::http::Method;
    use std::sync::Arc;

    fn timeout(seconds: f64) -> Arc<TimeoutMiddleware> {
        Arc::new(TimeoutMiddleware::new(TimeoutConfig { seconds }).unwrap())
    }

    #[tokio::test]
    async fn test_sets_timeout_hint() {
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        run_one(timeout(2.5), request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap();
        assert_eq!(endpoint.last_request().unwrap().timeout, Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn test_keeps_tighter_outer_deadline() {
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let mut tight = request(Method::GET, "http://b/");
        tight.timeout = Some(Duration::from_secs(1));
        run_one(timeout(5.0), tight, &context(), &endpoint).await.unwrap();
        assert_eq!(endpoint.last_request().unwrap().timeout, Some(Duration::from_secs(1)));

        let mut loose = request(Method::GET, "http://b/");
        loose.timeout = Some(Duration::from_secs(30));
        run_one(timeout(5.0), loose, &context(), &endpoint).await.unwrap();
        assert_eq!(endpoint.last_request().unwrap().timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_timeout_error_becomes_504() {
        let endpoint = ScriptedEndpoint::scripted(vec![Err(GatewayError::transport("operation timed out"))]);
        let outcome = run_one(timeout(1.0), request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap();
        assert_eq!(outcome.response().unwrap().status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_other_transport_errors_propagate() {
        let endpoint = ScriptedEndpoint::scripted(vec![Err(GatewayError::transport("connection refused"))]);
        let result = run_one(timeout(1.0), request(Method::GET, "http://b/"), &context(), &endpoint).await;
        assert!(matches!(result, Err(GatewayError::Transport { .. })));
    }

    #[test]
    fn test_rejects_non_positive_timeouts() {
        assert!(TimeoutMiddleware::new(TimeoutConfig { seconds: 0.0 }).is_err());
        let args = crate::middleware::spec::normalize(&serde_json::json!("timeout:5")).unwrap();
        assert_eq!(TimeoutMiddleware::from_args(&args).unwrap().timeout(), Duration::from_secs(5));
    }
}
