use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::core::error::GatewayResult;
use crate::core::types::{IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::MiddlewareArgs;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestLoggingConfig {
    pub log_headers: bool,
}

#[derive(Debug)]
pub struct RequestLoggingMiddleware {
    log_headers: bool,
}

impl RequestLoggingMiddleware {
    pub fn new(config: RequestLoggingConfig) -> Self {
        Self {
            log_headers: config.log_headers,
        }
    }

    /// Build from `request_logging[:log_headers]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Ok(Self::new(args.into_config(&["log_headers"])?))
    }
}

#[async_trait]
impl Middleware for RequestLoggingMiddleware {
    fn name(&self) -> &str {
        "request_logging"
    }

    fn priority(&self) -> i32 {
        -100
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let start_time = Instant::now();
        let method = request.method.clone();

        if self.log_headers {
            debug!(request_id = %context.request_id, headers = ?request.headers, "Outgoing request headers");
        }

        let result = next.run(request, context).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        match &result {
            Ok(Outcome::Response(response)) => info!(
                request_id = %context.request_id,
                method = %method,
                url = %context.incoming_url,
                target = %context.target_url,
                status = response.status.as_u16(),
                duration_ms,
                "Request processed"
            ),
            Ok(Outcome::Fallback) => debug!(
                request_id = %context.request_id,
                method = %method,
                url = %context.incoming_url,
                duration_ms,
                "Request deferred to host"
            ),
            Err(error) => warn!(
                request_id = %context.request_id,
                method = %method,
                url = %context.incoming_url,
                error = %error,
                duration_ms,
                "Request failed"
            ),
        }

        result
    }
}
