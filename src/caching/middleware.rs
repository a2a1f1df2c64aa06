//! # Response Cache Middleware
//!
//! Replays stored backend responses for `GET` and `HEAD` requests.
//!
//! Entries are keyed by the URL the client requested (scheme, host, path and query of
//! the incoming request), not by the backend target, so two routes pointing at the same
//! backend never share entries. Only `200` responses to `GET` whose `Cache-Control`
//! allows it are stored; a `HEAD` may be answered from a stored `GET` entry with the body
//! stripped.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{hashed_key, SharedStore, StoreExt};
use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::factory::SharedState;
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::MiddlewareArgs;

const KEY_PREFIX: &str = "response_cache_";

/// Response cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseCacheConfig {
    /// Seconds an entry stays valid
    pub ttl: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self { ttl: 300 }
    }
}

/// Stored form of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Base64 encoded body
    pub body: String,
    pub version: String,
    pub reason: Option<String>,
}

impl CachedResponse {
    pub fn from_response(response: &GatewayResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.to_string(), value.to_string()))
                })
                .collect(),
            body: STANDARD.encode(&response.body),
            version: version_label(response.version).to_string(),
            reason: response.reason.clone(),
        }
    }

    /// Rebuild the response; `None` when the entry is corrupt
    pub fn into_response(self) -> Option<GatewayResponse> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let body = STANDARD.decode(self.body.as_bytes()).ok()?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }

        let mut response = GatewayResponse::new(status, headers, Bytes::from(body));
        response.version = parse_version(&self.version);
        response.reason = self.reason;
        Some(response)
    }
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

fn parse_version(label: &str) -> Version {
    match label {
        "HTTP/0.9" => Version::HTTP_09,
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
        "HTTP/3" | "HTTP/3.0" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

/// Whether a backend response may be stored
fn is_storable(response: &GatewayResponse) -> bool {
    if response.status != StatusCode::OK {
        return false;
    }

    !response
        .headers
        .get_all(axum::http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase)
        .any(|value| value.contains("no-cache") || value.contains("no-store") || value.contains("private"))
}

/// Cache middleware backed by the shared store
#[derive(Debug)]
pub struct ResponseCacheMiddleware {
    config: ResponseCacheConfig,
    store: SharedStore,
}

impl ResponseCacheMiddleware {
    pub fn new(config: ResponseCacheConfig, shared: &SharedState) -> Self {
        Self {
            config,
            store: shared.store.clone(),
        }
    }

    /// Build from `cache[:ttl]`
    pub fn from_args(args: &MiddlewareArgs, shared: &SharedState) -> GatewayResult<Self> {
        Ok(Self::new(args.into_config(&["ttl"])?, shared))
    }

    /// Store key for a client-facing URL
    pub fn cache_key(url: &str) -> String {
        hashed_key(KEY_PREFIX, url)
    }

    async fn lookup(&self, key: &str) -> GatewayResult<Option<GatewayResponse>> {
        let Some(entry) = self.store.get_json::<CachedResponse>(key).await? else {
            return Ok(None);
        };

        match entry.into_response() {
            Some(response) => Ok(Some(response)),
            None => {
                warn!(key, "Discarding corrupt cached response");
                self.store.delete(key).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Middleware for ResponseCacheMiddleware {
    fn name(&self) -> &str {
        "cache"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let method = request.method.clone();
        if method != Method::GET && method != Method::HEAD {
            return next.run(request, context).await;
        }

        let key = Self::cache_key(&context.incoming_url);
        if let Some(mut response) = self.lookup(&key).await? {
            debug!(url = %context.incoming_url, "Response cache hit");
            counter!("response_cache_lookups_total", "result" => "hit").increment(1);

            if method == Method::HEAD {
                response.body = Bytes::new();
            }
            response.headers.insert(HeaderName::from_static("x-cache"), HeaderValue::from_static("HIT"));
            return Ok(Outcome::Response(response));
        }

        debug!(url = %context.incoming_url, "Response cache miss");
        counter!("response_cache_lookups_total", "result" => "miss").increment(1);

        let outcome = next.run(request, context).await?;
        let Outcome::Response(mut response) = outcome else {
            return Ok(Outcome::Fallback);
        };

        if method == Method::GET && is_storable(&response) {
            let entry = CachedResponse::from_response(&response);
            self.store
                .set_json(&key, &entry, Duration::from_secs(self.config.ttl))
                .await?;
            debug!(url = %context.incoming_url, ttl = self.config.ttl, "Stored response");
        }

        response.headers.insert(HeaderName::from_static("x-cache"), HeaderValue::from_static("MISS"));
        Ok(Outcome::Response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::InMemoryStore;
    use crate::middleware::pipeline::test_support::*;
    use std::sync::Arc;

    fn cache(ttl: u64) -> Arc<ResponseCacheMiddleware> {
        let shared = SharedState::new(Arc::new(InMemoryStore::new()));
        Arc::new(ResponseCacheMiddleware::new(ResponseCacheConfig { ttl }, &shared))
    }

    fn response_with(status: StatusCode, cache_control: Option<&str>, body: &str) -> GatewayResult<Outcome> {
        let mut response = GatewayResponse::text(status, body);
        if let Some(value) = cache_control {
            response.set_header(axum::http::header::CACHE_CONTROL, value);
        }
        response.set_header(HeaderName::from_static("x-backend"), "b1");
        response.reason = Some("Fine".to_string());
        Ok(Outcome::Response(response))
    }

    async fn call(cache: &Arc<ResponseCacheMiddleware>, method: Method, endpoint: &ScriptedEndpoint) -> GatewayResponse {
        run_one(cache.clone(), request(method, "http://backend.local/items"), &context(), endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_replays_identical_response() {
        let cache = cache(60);
        let endpoint = ScriptedEndpoint::scripted(vec![response_with(StatusCode::OK, None, "payload")]);

        let miss = call(&cache, Method::GET, &endpoint).await;
        assert_eq!(miss.header("x-cache"), Some("MISS"));

        let hit = call(&cache, Method::GET, &endpoint).await;
        assert_eq!(hit.header("x-cache"), Some("HIT"));
        assert_eq!(hit.body, miss.body);
        assert_eq!(hit.header("x-backend"), Some("b1"));
        assert_eq!(hit.reason.as_deref(), Some("Fine"));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_head_served_from_get_entry_without_body() {
        let cache = cache(60);
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);

        call(&cache, Method::GET, &endpoint).await;
        let head = call(&cache, Method::HEAD, &endpoint).await;
        assert_eq!(head.header("x-cache"), Some("HIT"));
        assert!(head.body.is_empty());
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_responses_are_not_stored() {
        let cache = cache(60);
        let endpoint = ScriptedEndpoint::scripted(vec![
            response_with(StatusCode::OK, Some("no-store"), "a"),
            response_with(StatusCode::OK, Some("Private, max-age=60"), "b"),
            response_with(StatusCode::NOT_FOUND, None, "c"),
            response_with(StatusCode::OK, Some("public, no-cache"), "d"),
        ]);

        for _ in 0..4 {
            let response = call(&cache, Method::GET, &endpoint).await;
            assert_eq!(response.header("x-cache"), Some("MISS"));
        }
        assert_eq!(endpoint.calls(), 4);
    }

    #[tokio::test]
    async fn test_other_methods_bypass_cache() {
        let cache = cache(60);
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);

        let post = call(&cache, Method::POST, &endpoint).await;
        assert_eq!(post.header("x-cache"), None);
        call(&cache, Method::POST, &endpoint).await;
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_passes_through() {
        let cache = cache(60);
        let endpoint = ScriptedEndpoint::scripted(vec![Ok(Outcome::Fallback)]);
        let outcome = run_one(cache.clone(), request(Method::GET, "http://b/"), &context(), &endpoint)
            .await
            .unwrap();
        assert!(outcome.is_fallback());
    }

    #[test]
    fn test_cached_response_conversion() {
        let mut response = GatewayResponse::text(StatusCode::OK, "body");
        response.version = Version::HTTP_2;
        let restored = CachedResponse::from_response(&response).into_response().unwrap();
        assert_eq!(restored.version, Version::HTTP_2);
        assert_eq!(restored.body, response.body);
        assert_eq!(restored.header("content-type"), Some("text/plain; charset=utf-8"));

        let corrupt = CachedResponse {
            status: 200,
            headers: vec![],
            body: "%%%".to_string(),
            version: "HTTP/1.1".to_string(),
            reason: None,
        };
        assert!(corrupt.into_response().is_none());
    }
}
