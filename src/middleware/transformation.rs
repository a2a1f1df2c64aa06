//! # Request/Response Transformation Middleware
//!
//! Header, path and body rewrites applied around the backend call.
//!
//! - `request_headers` / `response_headers`: set or remove headers
//! - `sanitize_headers`: drop hop-by-hop headers, `Host`, and any configured extras
//! - `path_rewrite`: replace the forwarded path using a `$1`, `$2`, ... template
//! - `body_rewrite`: literal or regex search/replace on request or response bodies
//!
//! `$N` placeholders refer to the wildcard captures of the matched route.

use async_trait::async_trait;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

/// Which message a transformation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    #[default]
    Response,
    Both,
}

impl Direction {
    fn request(self) -> bool {
        matches!(self, Self::Request | Self::Both)
    }

    fn response(self) -> bool {
        matches!(self, Self::Response | Self::Both)
    }
}

fn header_name(name: &str) -> GatewayResult<HeaderName> {
    HeaderName::from_str(name.trim()).map_err(|e| GatewayError::Configuration {
        message: format!("Invalid header name '{}': {}", name, e),
    })
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Headers to set, replacing existing values
    pub set: BTreeMap<String, JsonValue>,

    /// Headers to remove
    #[serde(deserialize_with = "lenient::string_list")]
    pub remove: Vec<String>,

    /// Single header shorthand: `request_headers:X-Name,value`
    #[serde(deserialize_with = "lenient::optional_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::optional_string")]
    pub value: Option<String>,
}

/// Sets and removes headers on the request or the response
#[derive(Debug)]
pub struct HeaderMiddleware {
    name: &'static str,
    direction: Direction,
    set: Vec<(HeaderName, String)>,
    remove: Vec<HeaderName>,
}

impl HeaderMiddleware {
    pub fn new(direction: Direction, config: HeaderConfig) -> GatewayResult<Self> {
        let mut set = Vec::with_capacity(config.set.len() + 1);
        for (name, value) in &config.set {
            let value = scalar_text(value).ok_or_else(|| {
                GatewayError::config(format!("Header '{}' needs a scalar value", name))
            })?;
            set.push((header_name(name)?, value));
        }

        match (config.name, config.value) {
            (Some(name), Some(value)) => set.push((header_name(&name)?, value)),
            (Some(name), None) => {
                return Err(GatewayError::config(format!("Header '{}' is missing a value", name)))
            }
            _ => {}
        }

        let remove = config
            .remove
            .iter()
            .map(|name| header_name(name))
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            name: if direction == Direction::Request { "request_headers" } else { "response_headers" },
            direction,
            set,
            remove,
        })
    }

    /// Build from `request_headers[:name,value]`
    pub fn request_from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(Direction::Request, args.into_config(&["name", "value"])?)
    }

    /// Build from `response_headers[:name,value]`
    pub fn response_from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(Direction::Response, args.into_config(&["name", "value"])?)
    }

    fn apply(&self, headers: &mut HeaderMap, context: &RequestContext) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, template) in &self.set {
            match HeaderValue::from_str(&context.expand_captures(template)) {
                Ok(value) => {
                    headers.insert(name.clone(), value);
                }
                Err(_) => debug!(header = %name, "Skipping header with invalid value"),
            }
        }
    }
}

#[async_trait]
impl Middleware for HeaderMiddleware {
    fn name(&self) -> &str {
        self.name
    }

    async fn process(
        &self,
        mut request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        if self.direction.request() {
            self.apply(&mut request.headers, context);
        }

        let outcome = next.run(request, context).await?;
        if !self.direction.response() {
            return Ok(outcome);
        }
        Ok(outcome.map_response(|mut response| {
            self.apply(&mut response.headers, context);
            response
        }))
    }
}

/// Hop-by-hop headers that must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SanitizeHeadersConfig {
    /// Extra request headers to strip
    #[serde(deserialize_with = "lenient::string_list")]
    pub headers: Vec<String>,
}

#[derive(Debug)]
pub struct SanitizeHeadersMiddleware {
    extra: Vec<HeaderName>,
}

impl SanitizeHeadersMiddleware {
    pub fn new(config: SanitizeHeadersConfig) -> GatewayResult<Self> {
        let extra = config
            .headers
            .iter()
            .map(|name| header_name(name))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { extra })
    }

    /// Build from `sanitize_headers[:header,...]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["headers*"])?)
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[async_trait]
impl Middleware for SanitizeHeadersMiddleware {
    fn name(&self) -> &str {
        "sanitize_headers"
    }

    fn priority(&self) -> i32 {
        -20
    }

    async fn process(
        &self,
        mut request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        strip_hop_by_hop(&mut request.headers);
        request.headers.remove(HOST);
        for name in &self.extra {
            request.headers.remove(name);
        }

        let outcome = next.run(request, context).await?;
        Ok(outcome.map_response(|mut response| {
            strip_hop_by_hop(&mut response.headers);
            response
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathRewriteConfig {
    #[serde(deserialize_with = "lenient::string")]
    pub template: String,
}

/// Replaces the path of the forwarded URL; the query string is kept
#[derive(Debug)]
pub struct PathRewriteMiddleware {
    template: String,
}

impl PathRewriteMiddleware {
    pub fn new(config: PathRewriteConfig) -> Self {
        Self {
            template: config.template,
        }
    }

    /// Build from `path_rewrite:/new/$1`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Ok(Self::new(args.into_config(&["template"])?))
    }

    fn rewrite(&self, uri: &Uri, context: &RequestContext) -> GatewayResult<Uri> {
        let mut path = context.expand_captures(&self.template);
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(path_and_query.parse().map_err(|e| {
            GatewayError::invalid_request(format!("Invalid path after rewrite: {}", e))
        })?);
        Uri::from_parts(parts)
            .map_err(|e| GatewayError::invalid_request(format!("Failed to reconstruct URI: {}", e)))
    }
}

#[async_trait]
impl Middleware for PathRewriteMiddleware {
    fn name(&self) -> &str {
        "path_rewrite"
    }

    async fn process(
        &self,
        mut request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let rewritten = self.rewrite(&request.uri, context)?;
        debug!(from = %request.uri, to = %rewritten, "Rewrote request path");
        request.uri = rewritten;
        next.run(request, context).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BodyRewriteConfig {
    #[serde(deserialize_with = "lenient::string")]
    pub search: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub replace: String,
    /// Treat `search` as a regular expression; `replace` may then use its groups
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

/// Search/replace on UTF-8 bodies; binary bodies pass untouched
#[derive(Debug)]
pub struct BodyRewriteMiddleware {
    matcher: Matcher,
    replace: String,
    direction: Direction,
}

impl BodyRewriteMiddleware {
    pub fn new(config: BodyRewriteConfig) -> GatewayResult<Self> {
        if config.search.is_empty() {
            return Err(GatewayError::config("body_rewrite needs a non-empty search"));
        }
        let matcher = if config.regex {
            Matcher::Pattern(Regex::new(&config.search).map_err(|e| {
                GatewayError::config(format!("Invalid body_rewrite regex '{}': {}", config.search, e))
            })?)
        } else {
            Matcher::Literal(config.search)
        };
        Ok(Self {
            matcher,
            replace: config.replace,
            direction: config.direction,
        })
    }

    /// Build from `body_rewrite:search,replace`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["search", "replace", "direction"])?)
    }

    fn rewrite(&self, body: &Bytes, context: &RequestContext) -> Option<Bytes> {
        let text = std::str::from_utf8(body).ok()?;
        let rewritten = match &self.matcher {
            Matcher::Literal(search) => {
                let search = context.expand_captures(search);
                if !text.contains(&search) {
                    return None;
                }
                text.replace(&search, &context.expand_captures(&self.replace))
            }
            Matcher::Pattern(regex) => {
                if !regex.is_match(text) {
                    return None;
                }
                regex.replace_all(text, self.replace.as_str()).into_owned()
            }
        };
        Some(Bytes::from(rewritten))
    }
}

#[async_trait]
impl Middleware for BodyRewriteMiddleware {
    fn name(&self) -> &str {
        "body_rewrite"
    }

    async fn process(
        &self,
        mut request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        if self.direction.request() {
            if let Some(body) = self.rewrite(&request.body, context) {
                request.body = body;
                request.headers.remove(CONTENT_LENGTH);
            }
        }

        let outcome = next.run(request, context).await?;
        if !self.direction.response() {
            return Ok(outcome);
        }
        Ok(outcome.map_response(|mut response| {
            if let Some(body) = self.rewrite(&response.body, context) {
                response.body = body;
                response.headers.remove(CONTENT_LENGTH);
            }
            response
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GatewayResponse;
    use crate::middleware::pipeline::test_support::*;
    use crate::middleware::spec::normalize;
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_request_and_response_headers() {
        let req_headers = HeaderMiddleware::request_from_args(
            &normalize(&json!({"request_headers": {"set": {"X-Segment": "$1", "X-Version": 2}, "remove": "cookie"}}))
                .unwrap(),
        )
        .unwrap();
        let resp_headers = HeaderMiddleware::response_from_args(&normalize(&json!("response_headers:X-Served-By,dispatcher")).unwrap()).unwrap();
        assert_eq!(resp_headers.name(), "response_headers");

        let chain = crate::middleware::pipeline::MiddlewareChain::new(vec![
            Arc::new(req_headers) as Arc<dyn Middleware>,
            Arc::new(resp_headers),
        ]);
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let mut req = request(Method::GET, "http://b/");
        req.headers.insert("cookie", "session=1".parse().unwrap());

        let outcome = chain.execute(req, &context(), &endpoint).await.unwrap();
        let seen = endpoint.last_request().unwrap();
        assert_eq!(seen.header("x-segment"), Some("items"));
        assert_eq!(seen.header("x-version"), Some("2"));
        assert_eq!(seen.header("cookie"), None);
        assert_eq!(outcome.response().unwrap().header("x-served-by"), Some("dispatcher"));
    }

    #[tokio::test]
    async fn test_sanitize_headers() {
        let sanitize = Arc::new(SanitizeHeadersMiddleware::from_args(&normalize(&json!("sanitize_headers:x-internal")).unwrap()).unwrap());
        let mut backend = GatewayResponse::text(StatusCode::OK, "ok");
        backend.headers.insert("transfer-encoding", "chunked".parse().unwrap());
        let endpoint = ScriptedEndpoint::scripted(vec![Ok(Outcome::Response(backend))]);

        let mut req = request(Method::GET, "http://b/");
        req.headers.insert("connection", "keep-alive, x-custom-hop".parse().unwrap());
        req.headers.insert("x-custom-hop", "1".parse().unwrap());
        req.headers.insert("host", "proxy.local".parse().unwrap());
        req.headers.insert("x-internal", "secret".parse().unwrap());
        req.headers.insert("accept", "*/*".parse().unwrap());

        let outcome = run_one(sanitize, req, &context(), &endpoint).await.unwrap();
        let seen = endpoint.last_request().unwrap();
        for gone in ["connection", "x-custom-hop", "host", "x-internal"] {
            assert_eq!(seen.header(gone), None, "{gone} should be stripped");
        }
        assert_eq!(seen.header("accept"), Some("*/*"));
        assert_eq!(outcome.response().unwrap().header("transfer-encoding"), None);
    }

    #[tokio::test]
    async fn test_path_rewrite_keeps_query() {
        let rewrite = Arc::new(PathRewriteMiddleware::from_args(&normalize(&json!("path_rewrite:/v2/$1/list")).unwrap()).unwrap());
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        run_one(rewrite, request(Method::GET, "http://backend.local/items?page=2"), &context(), &endpoint)
            .await
            .unwrap();
        assert_eq!(
            endpoint.last_request().unwrap().uri.to_string(),
            "http://backend.local/v2/items/list?page=2"
        );
    }

    #[tokio::test]
    async fn test_body_rewrite_literal_on_response() {
        let rewrite = Arc::new(
            BodyRewriteMiddleware::from_args(&normalize(&json!("body_rewrite:backend.local,proxy.local/$1")).unwrap()).unwrap(),
        );
        let backend = GatewayResponse::text(StatusCode::OK, "see http://backend.local/a");
        let endpoint = ScriptedEndpoint::scripted(vec![Ok(Outcome::Response(backend))]);

        let outcome = run_one(rewrite, request(Method::GET, "http://b/"), &context(), &endpoint).await.unwrap();
        assert_eq!(outcome.response().unwrap().body.as_ref(), b"see http://proxy.local/items/a");
    }

    #[tokio::test]
    async fn test_body_rewrite_regex_on_request() {
        let rewrite = Arc::new(
            BodyRewriteMiddleware::new(BodyRewriteConfig {
                search: r"id=(\d+)".to_string(),
                replace: "ref=$1".to_string(),
                regex: true,
                direction: Direction::Request,
            })
            .unwrap(),
        );
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let mut req = request(Method::POST, "http://b/");
        req.body = Bytes::from_static(b"id=42&id=7");
        req.headers.insert("content-length", "10".parse().unwrap());

        run_one(rewrite, req, &context(), &endpoint).await.unwrap();
        let seen = endpoint.last_request().unwrap();
        assert_eq!(seen.body.as_ref(), b"ref=42&ref=7");
        assert_eq!(seen.header("content-length"), None);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(BodyRewriteMiddleware::from_args(&normalize(&json!({"body_rewrite": {"search": "(", "regex": true}})).unwrap()).is_err());
        assert!(HeaderMiddleware::request_from_args(&normalize(&json!("request_headers:X-Only")).unwrap()).is_err());
        assert!(PathRewriteMiddleware::from_args(&MiddlewareArgs::new("path_rewrite")).is_err());
    }
}
