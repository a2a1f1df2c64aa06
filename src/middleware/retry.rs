//! Retry middleware for idempotent requests.
//!
//! Re-runs the rest of the chain while it answers with a retryable status or fails at the
//! transport level. `max_retries` counts total attempts. When attempts run out the last
//! result is returned as it was: a response stays a response, a transport error is raised.

use async_trait::async_trait;
use axum::http::Method;
use metrics::counter;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_retries: u32,

    /// Pause between attempts in milliseconds
    pub delay_ms: u64,

    /// Methods eligible for retry
    #[serde(deserialize_with = "lenient::string_list")]
    pub methods: Vec<String>,

    /// Response statuses that trigger another attempt
    #[serde(deserialize_with = "lenient::status_list")]
    pub statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 0,
            methods: vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()],
            statuses: vec![502, 503, 504],
        }
    }
}

#[derive(Debug)]
pub struct RetryMiddleware {
    config: RetryConfig,
    methods: Vec<Method>,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> GatewayResult<Self> {
        let methods = config
            .methods
            .iter()
            .map(|method| {
                Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| GatewayError::config(format!("Invalid retry method: {}", method)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self { config, methods })
    }

    /// Build from `retry[:max_retries,delay_ms]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["max_retries", "delay_ms"])?)
    }

    fn should_retry(&self, result: &GatewayResult<Outcome>) -> bool {
        match result {
            Ok(Outcome::Response(response)) => self.config.statuses.contains(&response.status.as_u16()),
            Ok(Outcome::Fallback) => false,
            Err(error) => error.is_transport(),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        20
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        if !self.methods.contains(&request.method) {
            return next.run(request, context).await;
        }

        let attempts = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            let result = next.run(request.clone(), context).await;
            if attempt >= attempts || !self.should_retry(&result) {
                return result;
            }

            debug!(
                request_id = %context.request_id,
                attempt,
                max_attempts = attempts,
                "Retrying request"
            );
            counter!("retry_attempts_total").increment(1);
            attempt += 1;

            if self.config.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delay_ms)).await;
            }
        }
    }
}
