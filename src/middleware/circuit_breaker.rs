//! Circuit Breaker Middleware
//!
//! Stops forwarding to a backend that keeps failing, then lets a single trial request
//! through once the cool-down has passed.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open --(now >= reset_at)--> HalfOpen
//!    ^                                  ^                            |
//!    +-------------(success)------------+--------(failure)-----------+
//! ```
//!
//! State lives in the shared store under a key derived from the service name, so each
//! backend has an independent breaker and every worker process sees the same breaker.
//! Updates are read-modify-write without locking; concurrent failures may be under-counted.

use async_trait::async_trait;
use axum::http::{HeaderName, StatusCode};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::caching::{hashed_key, SharedStore, StoreExt};
use crate::core::clock::Clock;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::factory::SharedState;
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

const KEY_PREFIX: &str = "circuit_breaker_";

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation, requests pass through
    #[default]
    Closed,
    /// Backend considered down, requests are rejected
    Open,
    /// Cool-down elapsed, a trial request is allowed
    HalfOpen,
}

/// Persisted breaker state for one service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failures: u32,
    /// Unix seconds after which an open breaker admits a trial request
    pub reset_at: u64,
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that open the breaker
    pub threshold: u32,

    /// Seconds an open breaker waits before allowing a trial request
    pub reset_timeout: u64,

    /// Breaker identity; defaults to the target host of the matched route
    #[serde(deserialize_with = "lenient::optional_string")]
    pub service: Option<String>,

    /// Response statuses counted as failures
    #[serde(deserialize_with = "lenient::status_list")]
    pub failure_statuses: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout: 60,
            service: None,
            failure_statuses: vec![500, 502, 503, 504],
        }
    }
}

/// Per-service circuit breaker backed by the shared store
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerMiddleware {
    pub fn new(config: CircuitBreakerConfig, shared: &SharedState) -> GatewayResult<Self> {
        if config.reset_timeout == 0 {
            return Err(GatewayError::config("Circuit breaker reset_timeout must be at least one second"));
        }
        Ok(Self {
            config,
            store: shared.store.clone(),
            clock: shared.clock.clone(),
        })
    }

    /// Build from `circuit_breaker[:threshold,reset_timeout,service]`
    pub fn from_args(args: &MiddlewareArgs, shared: &SharedState) -> GatewayResult<Self> {
        Self::new(args.into_config(&["threshold", "reset_timeout", "service"])?, shared)
    }

    /// Current state of the breaker for `service`
    pub async fn state(&self, service: &str) -> GatewayResult<CircuitState> {
        Ok(self
            .store
            .get_json(&state_key(service))
            .await?
            .unwrap_or_default())
    }

    fn service<'a>(&'a self, context: &'a RequestContext) -> &'a str {
        self.config.service.as_deref().unwrap_or(&context.service)
    }

    fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.config.reset_timeout.saturating_mul(2))
    }

    async fn save(&self, key: &str, state: &CircuitState) -> GatewayResult<()> {
        self.store.set_json(key, state, self.state_ttl()).await?;
        Ok(())
    }

    async fn record_failure(&self, key: &str, service: &str, mut state: CircuitState) -> GatewayResult<()> {
        state.failures = state.failures.saturating_add(1);

        if state.status == CircuitStatus::HalfOpen || state.failures >= self.config.threshold {
            state.status = CircuitStatus::Open;
            state.reset_at = self.clock.now() + self.config.reset_timeout;
            warn!(
                service,
                failures = state.failures,
                reset_at = state.reset_at,
                "Circuit breaker opened"
            );
        } else {
            debug!(service, failures = state.failures, "Circuit breaker recorded failure");
        }

        self.save(key, &state).await
    }

    async fn record_success(&self, key: &str, service: &str, state: CircuitState) -> GatewayResult<()> {
        if state.status == CircuitStatus::Closed && state.failures == 0 {
            return Ok(());
        }
        if state.status != CircuitStatus::Closed {
            info!(service, "Circuit breaker closed");
        }
        self.save(key, &CircuitState::default()).await
    }

    fn open_response(&self, service: &str, retry_after: u64) -> GatewayResponse {
        let body = json!({
            "error": {
                "code": StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                "message": format!("Service '{}' is temporarily unavailable", service),
            },
            "service": service,
        });
        let mut response = GatewayResponse::json(StatusCode::SERVICE_UNAVAILABLE, &body);
        response.set_header(HeaderName::from_static("x-circuit-breaker"), "open");
        response.set_header(
            axum::http::header::RETRY_AFTER,
            retry_after.max(1).to_string(),
        );
        response
    }
}

fn state_key(service: &str) -> String {
    hashed_key(KEY_PREFIX, service)
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    fn priority(&self) -> i32 {
        40
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let service = self.service(context);
        let key = state_key(service);
        let mut state: CircuitState = self.store.get_json(&key).await?.unwrap_or_default();

        if state.status == CircuitStatus::Open {
            let now = self.clock.now();
            if now < state.reset_at {
                debug!(service, "Circuit open, rejecting request");
                counter!("circuit_breaker_rejections_total", "service" => service.to_string()).increment(1);
                return Ok(Outcome::Response(self.open_response(service, state.reset_at - now)));
            }

            state.status = CircuitStatus::HalfOpen;
            self.save(&key, &state).await?;
            info!(service, "Circuit breaker half-open, allowing trial request");
        }

        match next.run(request, context).await {
            Ok(Outcome::Response(response)) => {
                if self.config.failure_statuses.contains(&response.status.as_u16()) {
                    self.record_failure(&key, service, state).await?;
                } else {
                    self.record_success(&key, service, state).await?;
                }
                Ok(Outcome::Response(response))
            }
            Ok(Outcome::Fallback) => Ok(Outcome::Fallback),
            Err(error) if error.is_transport() => {
                self.record_failure(&key, service, state).await?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::InMemoryStore;
    use crate::core::clock::ManualClock;
    use crate::core::error::GatewayError;
    use crate::middleware::pipeline::test_support::*;
    use axum::http::Method;

    struct Harness {
        clock: Arc<ManualClock>,
        breaker: Arc<CircuitBreakerMiddleware>,
    }

    fn harness(config: CircuitBreakerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let shared = SharedState::new(Arc::new(InMemoryStore::new())).with_clock(clock.clone());
        Harness {
            clock,
            breaker: Arc::new(CircuitBreakerMiddleware::new(config, &shared).unwrap()),
        }
    }

    fn config(threshold: u32, reset_timeout: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold,
            reset_timeout,
            ..Default::default()
        }
    }

    async fn call(h: &Harness, endpoint: &ScriptedEndpoint) -> GatewayResult<Outcome> {
        run_one(h.breaker.clone(), request(Method::GET, "http://backend.local/"), &context(), endpoint).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let h = harness(config(3, 30));
        let endpoint = ScriptedEndpoint::always(StatusCode::BAD_GATEWAY);

        for _ in 0..3 {
            let outcome = call(&h, &endpoint).await.unwrap();
            assert_eq!(outcome.response().unwrap().status, StatusCode::BAD_GATEWAY);
        }
        let state = h.breaker.state("backend.local").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.reset_at, 1_030);

        let rejected = call(&h, &endpoint).await.unwrap().into_response().unwrap();
        assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(rejected.header("x-circuit-breaker"), Some("open"));
        assert_eq!(rejected.header("retry-after"), Some("30"));
        assert!(String::from_utf8_lossy(&rejected.body).contains("backend.local"));
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let h = harness(config(3, 30));
        let endpoint = ScriptedEndpoint::scripted(vec![status(500), status(500), status(200), status(500)]);

        for _ in 0..4 {
            call(&h, &endpoint).await.unwrap();
        }
        let state = h.breaker.state("backend.local").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failures, 1);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout() {
        let h = harness(config(1, 10));
        let endpoint = ScriptedEndpoint::scripted(vec![status(503)]);

        call(&h, &endpoint).await.unwrap();
        assert_eq!(h.breaker.state("backend.local").await.unwrap().status, CircuitStatus::Open);

        h.clock.advance(10);
        let outcome = call(&h, &endpoint).await.unwrap();
        assert_eq!(outcome.response().unwrap().status, StatusCode::OK);
        assert_eq!(endpoint.calls(), 2);
        assert_eq!(h.breaker.state("backend.local").await.unwrap(), CircuitState::default());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let h = harness(config(2, 10));
        let endpoint = ScriptedEndpoint::always(StatusCode::INTERNAL_SERVER_ERROR);

        call(&h, &endpoint).await.unwrap();
        call(&h, &endpoint).await.unwrap();
        h.clock.advance(11);

        call(&h, &endpoint).await.unwrap();
        let state = h.breaker.state("backend.local").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.reset_at, 1_021);
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn test_transport_errors_count_and_propagate() {
        let h = harness(config(2, 10));
        let endpoint = ScriptedEndpoint::scripted(vec![
            Err(GatewayError::transport("connection refused")),
            Err(GatewayError::transport("connection refused")),
        ]);

        for _ in 0..2 {
            assert!(matches!(call(&h, &endpoint).await, Err(GatewayError::Transport { .. })));
        }
        assert_eq!(h.breaker.state("backend.local").await.unwrap().status, CircuitStatus::Open);
    }

    #[tokio::test]
    async fn test_other_errors_and_fallbacks_leave_state_alone() {
        let h = harness(config(1, 10));
        let endpoint = ScriptedEndpoint::scripted(vec![
            Err(GatewayError::internal("bug")),
            Ok(Outcome::Fallback),
        ]);

        assert!(call(&h, &endpoint).await.is_err());
        assert!(call(&h, &endpoint).await.unwrap().is_fallback());
        assert_eq!(h.breaker.state("backend.local").await.unwrap(), CircuitState::default());
    }

    #[tokio::test]
    async fn test_services_are_isolated() {
        let h = harness(config(1, 60));
        let failing = ScriptedEndpoint::always(StatusCode::BAD_GATEWAY);
        call(&h, &failing).await.unwrap();

        let mut other = context();
        other.service = "other.local".to_string();
        let healthy = ScriptedEndpoint::always(StatusCode::OK);
        let outcome = run_one(h.breaker.clone(), request(Method::GET, "http://other.local/"), &other, &healthy)
            .await
            .unwrap();
        assert_eq!(outcome.response().unwrap().status, StatusCode::OK);
        assert_eq!(healthy.calls(), 1);
    }

    #[test]
    fn test_positional_args() {
        let shared = SharedState::new(Arc::new(InMemoryStore::new()));
        let args = crate::middleware::spec::normalize(&serde_json::json!("circuit_breaker:2,15,payments")).unwrap();
        let breaker = CircuitBreakerMiddleware::from_args(&args, &shared).unwrap();
        assert_eq!(breaker.config.threshold, 2);
        assert_eq!(breaker.config.reset_timeout, 15);
        assert_eq!(breaker.config.service.as_deref(), Some("payments"));
        assert_eq!(breaker.config.failure_statuses, vec![500, 502, 503, 504]);
    }

    #[test]
    fn test_zero_reset_timeout_is_rejected() {
        let shared = SharedState::new(Arc::new(InMemoryStore::new()));
        let err = CircuitBreakerMiddleware::new(config(3, 0), &shared).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));

        let args = crate::middleware::spec::normalize(&serde_json::json!("circuit_breaker:3,0")).unwrap();
        assert!(CircuitBreakerMiddleware::from_args(&args, &shared).is_err());
    }
}
