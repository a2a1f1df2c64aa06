//! # HTTP Transport
//!
//! The backend call at the end of every middleware chain. [`Transport`] is the minimal
//! contract the dispatcher consumes; [`ReqwestTransport`] implements it with a pooled
//! `reqwest` client.
//!
//! Every network-level failure (connect, timeout, broken body) is reported as
//! [`GatewayError::Transport`], the error that retry, circuit breaker, timeout and error
//! handling middleware react to. Redirects are returned to the client, never followed.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::TransportConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Endpoint, Outcome};

/// Sends a fully prepared request to its absolute URI
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: IncomingRequest) -> GatewayResult<GatewayResponse>;
}

/// Transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn build(&self, request: &IncomingRequest) -> GatewayResult<reqwest::Request> {
        if request.uri.scheme().is_none() || request.uri.authority().is_none() {
            return Err(GatewayError::invalid_request(format!(
                "Outgoing URI must be absolute, got '{}'",
                request.uri
            )));
        }

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::invalid_request(format!("Invalid method: {}", e)))?;

        let mut headers = reqwest::header::HeaderMap::with_capacity(request.headers.len() + 1);
        for (name, value) in request.headers.iter() {
            if name == axum::http::header::HOST {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        if !headers.contains_key(reqwest::header::USER_AGENT) {
            if let Ok(agent) = reqwest::header::HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(reqwest::header::USER_AGENT, agent);
            }
        }

        self.client
            .request(method, request.uri.to_string())
            .headers(headers)
            .timeout(request.timeout.unwrap_or(self.config.timeout))
            .body(request.body.clone())
            .build()
            .map_err(|e| GatewayError::invalid_request(format!("Failed to build backend request: {}", e)))
    }
}

fn transport_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::transport(format!("Backend request timed out: {}", error))
    } else if error.is_connect() {
        GatewayError::transport(format!("Backend connection failed: {}", error))
    } else {
        GatewayError::transport(format!("Backend request failed: {}", error))
    }
}

fn convert_version(version: reqwest::Version) -> Version {
    if version == reqwest::Version::HTTP_09 {
        Version::HTTP_09
    } else if version == reqwest::Version::HTTP_10 {
        Version::HTTP_10
    } else if version == reqwest::Version::HTTP_2 {
        Version::HTTP_2
    } else if version == reqwest::Version::HTTP_3 {
        Version::HTTP_3
    } else {
        Version::HTTP_11
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: IncomingRequest) -> GatewayResult<GatewayResponse> {
        let outgoing = self.build(&request)?;
        debug!(
            request_id = %request.id,
            method = %request.method,
            url = %request.uri,
            timeout = ?outgoing.timeout(),
            "Sending backend request"
        );

        let response = self.client.execute(outgoing).await.map_err(transport_error)?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::transport(format!("Invalid backend status: {}", e)))?;
        let version = convert_version(response.version());

        let mut headers = HeaderMap::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let body = response.bytes().await.map_err(transport_error)?;

        let mut gateway_response = GatewayResponse::new(status, headers, body);
        gateway_response.version = version;
        Ok(gateway_response)
    }
}

/// Chain endpoint that forwards to a [`Transport`]
#[derive(Debug, Clone)]
pub struct TransportEndpoint {
    transport: Arc<dyn Transport>,
}

impl TransportEndpoint {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Endpoint for TransportEndpoint {
    async fn call(&self, request: IncomingRequest, _context: &RequestContext) -> GatewayResult<Outcome> {
        Ok(Outcome::Response(self.transport.send(request).await?))
    }
}
