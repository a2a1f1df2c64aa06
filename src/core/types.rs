//! # Core Types Module
//!
//! Request, response and per-request context types shared by routing, the middleware
//! chain and transports.
//!
//! Bodies are held as [`Bytes`] so cloning a request for a retry attempt or a cached
//! response for replay never copies the payload.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use uuid::Uuid;

/// A request travelling through the dispatcher.
///
/// Before matching, `uri` is whatever the host received (usually origin-form, `/path?q`).
/// Once a route matched, the dispatcher replaces it with the absolute target URL and the
/// middleware chain operates on that outgoing request.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (for tracing and logging)
    pub id: String,

    /// HTTP method
    pub method: Method,

    /// Request URI including path and query
    pub uri: Uri,

    /// HTTP version
    pub version: Version,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body
    pub body: Bytes,

    /// Client's remote address, when the host knows it
    pub remote_addr: Option<SocketAddr>,

    /// Timeout hint for the transport, set by the timeout middleware
    pub timeout: Option<Duration>,
}

impl IncomingRequest {
    /// Create a new request with a generated ID
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            version: Version::HTTP_11,
            headers,
            body: body.into(),
            remote_addr: None,
            timeout: None,
        }
    }

    /// Attach the client's socket address
    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get the query string, if any
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Best-effort client IP: the socket peer, else the first `X-Forwarded-For` hop.
    pub fn client_ip(&self) -> Option<IpAddr> {
        if let Some(addr) = self.remote_addr {
            return Some(addr.ip());
        }

        self.header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok())
    }

    /// Reconstruct `scheme://host/path?query` as the client addressed it.
    ///
    /// Uses the `Host` header, then the URI authority; the scheme defaults to `http`.
    pub fn full_url(&self) -> String {
        let scheme = self.uri.scheme_str().unwrap_or("http");
        let host = self
            .header("host")
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());

        match self.query() {
            Some(query) => format!("{}://{}{}?{}", scheme, host, self.path(), query),
            None => format!("{}://{}{}", scheme, host, self.path()),
        }
    }
}

/// Read-only facts about the current request, built by the dispatcher once a route matched.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Identifier shared with the request
    pub request_id: String,

    /// `scheme://host/path?query` of the request as received
    pub incoming_url: String,

    /// Client address used for rate limiting and IP filtering
    pub client_ip: Option<IpAddr>,

    /// Pattern of the matched route
    pub route_pattern: String,

    /// Wildcard captures, in pattern order
    pub captures: Vec<String>,

    /// Absolute URL the request is forwarded to
    pub target_url: String,

    /// Backend identity (target host) used to isolate circuit breakers
    pub service: String,
}

impl RequestContext {
    /// Substitute `$1`, `$2`, ... in `template` with the wildcard captures.
    ///
    /// The template is scanned once; each `$` takes the longest digit run that names an
    /// existing capture, so `$10` wins over `$1` when ten captures exist. Capture text is
    /// copied verbatim and never rescanned. Placeholders without a capture are left untouched.
    pub fn expand_captures(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(dollar) = rest.find('$') {
            result.push_str(&rest[..dollar]);
            let after = &rest[dollar + 1..];
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();

            let capture = (1..=digits).rev().find_map(|len| {
                let index: usize = after[..len].parse().ok()?;
                let capture = self.captures.get(index.checked_sub(1)?)?;
                Some((len, capture))
            });

            match capture {
                Some((len, capture)) => {
                    result.push_str(capture);
                    rest = &after[len..];
                }
                None => {
                    result.push('$');
                    rest = after;
                }
            }
        }

        result.push_str(rest);
        result
    }
}

/// Response produced by the backend or synthesized by a middleware
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,

    /// Protocol version reported by the backend
    pub version: Version,

    /// Reason phrase, when it differs from the canonical one
    pub reason: Option<String>,
}

impl GatewayResponse {
    /// Create a new response
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            version: Version::HTTP_11,
            reason: None,
        }
    }

    /// Create a simple text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(status, headers, text.into())
    }

    /// Create a JSON response
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, value.to_string())
    }

    /// Create a JSON error response
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        let error_body = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": message.into(),
            }
        });
        Self::json(status, &error_body)
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Insert a header, ignoring values that are not valid header text
    pub fn set_header(&mut self, name: HeaderName, value: impl AsRef<str>) {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(name, value);
        }
    }

    /// Reason phrase to report: the stored one, else the canonical one
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }
}
