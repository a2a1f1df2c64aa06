//! # Rate Limiting Middleware
//!
//! Fixed-window request counter per client key. Each key owns a `{window_start, count}`
//! record in the shared store that expires with the window.
//!
//! ## Keys
//! - `ip` (default): the client address
//! - `header:<name>`: a request header such as an API key, falling back to the client address
//! - `route`: one counter per matched route pattern
//! - `global`: a single counter for everything behind this middleware
//!
//! A custom key function can replace all of these via [`RateLimitMiddleware::with_key_fn`].
//!
//! The counter is read, incremented and written back without locking, so concurrent
//! requests may be under-counted. The window semantics stay fixed either way.

use async_trait::async_trait;
use axum::http::{HeaderName, StatusCode};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::caching::{hashed_key, SharedStore, StoreExt};
use crate::core::clock::Clock;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::factory::SharedState;
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

const KEY_PREFIX: &str = "rate_limit_";

/// Persisted counter for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start: u64,
    pub count: u32,
}

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the current window ends
    pub reset_at: u64,
    /// Seconds the client should wait, at least one
    pub retry_after: u64,
}

/// How the counter key is derived from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitKey {
    ClientIp,
    Header(String),
    Route,
    Global,
}

impl RateLimitKey {
    pub fn parse(spec: &str) -> GatewayResult<Self> {
        let spec = spec.trim();
        match spec.to_ascii_lowercase().as_str() {
            "ip" | "client_ip" => return Ok(Self::ClientIp),
            "route" => return Ok(Self::Route),
            "global" => return Ok(Self::Global),
            _ => {}
        }
        match spec.split_once(':') {
            Some((kind, name)) if kind.eq_ignore_ascii_case("header") && !name.trim().is_empty() => {
                Ok(Self::Header(name.trim().to_ascii_lowercase()))
            }
            _ => Err(GatewayError::config(format!("Invalid rate limit key: {}", spec))),
        }
    }

    fn derive(&self, request: &IncomingRequest, context: &RequestContext) -> String {
        let client = || {
            context
                .client_ip
                .or_else(|| request.client_ip())
                .map(|ip| format!("ip:{}", ip))
                .unwrap_or_else(|| "ip:unknown".to_string())
        };

        match self {
            Self::ClientIp => client(),
            Self::Header(name) => request
                .header(name)
                .map(|value| format!("header:{}:{}", name, value))
                .unwrap_or_else(client),
            Self::Route => format!("route:{}", context.route_pattern),
            Self::Global => "global".to_string(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub limit: u32,

    /// Window length in seconds
    pub window: u64,

    /// Key derivation: `ip`, `header:<name>`, `route` or `global`
    #[serde(deserialize_with = "lenient::string")]
    pub key_by: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: 60,
            key_by: "ip".to_string(),
        }
    }
}

/// Caller-supplied key derivation
pub type KeyFn = Arc<dyn Fn(&IncomingRequest, &RequestContext) -> String + Send + Sync>;

/// Fixed-window rate limiter backed by the shared store
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    key: RateLimitKey,
    key_fn: Option<KeyFn>,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("config", &self.config)
            .field("key", &self.key)
            .field("custom_key_fn", &self.key_fn.is_some())
            .finish()
    }
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig, shared: &SharedState) -> GatewayResult<Self> {
        if config.window == 0 {
            return Err(GatewayError::config("Rate limit window must be at least one second"));
        }
        let key = RateLimitKey::parse(&config.key_by)?;
        Ok(Self {
            config,
            key,
            key_fn: None,
            store: shared.store.clone(),
            clock: shared.clock.clone(),
        })
    }

    /// Build from `rate_limit[:limit,window,key_by]`
    pub fn from_args(args: &MiddlewareArgs, shared: &SharedState) -> GatewayResult<Self> {
        Self::new(args.into_config(&["limit", "window", "key_by"])?, shared)
    }

    /// Replace the configured key derivation
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&IncomingRequest, &RequestContext) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    fn client_key(&self, request: &IncomingRequest, context: &RequestContext) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(request, context),
            None => self.key.derive(request, context),
        }
    }

    /// Count one request against `client_key` and decide whether it may pass
    pub async fn check(&self, client_key: &str) -> GatewayResult<RateLimitResult> {
        let store_key = hashed_key(KEY_PREFIX, client_key);
        let now = self.clock.now();

        let mut window = self
            .store
            .get_json::<RateWindow>(&store_key)
            .await?
            .unwrap_or(RateWindow {
                window_start: now,
                count: 0,
            });

        if now.saturating_sub(window.window_start) >= self.config.window {
            window = RateWindow {
                window_start: now,
                count: 0,
            };
        }
        window.count = window.count.saturating_add(1);

        self.store
            .set_json(&store_key, &window, Duration::from_secs(self.config.window))
            .await?;

        let reset_at = window.window_start + self.config.window;
        Ok(RateLimitResult {
            allowed: window.count <= self.config.limit,
            limit: self.config.limit,
            remaining: self.config.limit.saturating_sub(window.count),
            reset_at,
            retry_after: reset_at.saturating_sub(now).max(1),
        })
    }
}

fn apply_headers(response: &mut GatewayResponse, result: &RateLimitResult) {
    response.set_header(HeaderName::from_static("x-ratelimit-limit"), result.limit.to_string());
    response.set_header(HeaderName::from_static("x-ratelimit-remaining"), result.remaining.to_string());
    response.set_header(HeaderName::from_static("x-ratelimit-reset"), result.reset_at.to_string());
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn priority(&self) -> i32 {
        -30
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let client_key = self.client_key(&request, context);
        let result = self.check(&client_key).await?;

        if !result.allowed {
            debug!(key = %client_key, limit = result.limit, "Rate limit exceeded");
            counter!("rate_limit_rejections_total").increment(1);

            let mut response = GatewayResponse::error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
            response.set_header(axum::http::header::RETRY_AFTER, result.retry_after.to_string());
            apply_headers(&mut response, &result);
            return Ok(Outcome::Response(response));
        }

        let outcome = next.run(request, context).await?;
        Ok(outcome.map_response(|mut response| {
            apply_headers(&mut response, &result);
            response
        }))
    }
}
