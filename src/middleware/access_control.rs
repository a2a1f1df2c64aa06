//! Access restrictions evaluated before a request reaches the backend.
//!
//! - `ip_filter`: allow and deny lists of exact addresses or CIDR blocks, answered with 403
//! - `allow_methods`: a method whitelist, answered with 405 and an `Allow` header

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

/// An address or CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRule {
    network: IpAddr,
    prefix: u8,
}

impl IpRule {
    pub fn parse(rule: &str) -> GatewayResult<Self> {
        let invalid = || GatewayError::config(format!("Invalid IP rule: {}", rule));
        let (address, prefix) = match rule.trim().split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (rule.trim(), None),
        };

        let network: IpAddr = address.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                prefix_matches(u32::from(network) as u128, u32::from(ip) as u128, self.prefix, 32)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                prefix_matches(u128::from(network), u128::from(ip), self.prefix, 128)
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .map(|ip| self.contains(IpAddr::V4(ip)))
                .unwrap_or(false),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn prefix_matches(network: u128, ip: u128, prefix: u8, bits: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(bits - prefix);
    (network >> shift) == (ip >> shift)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpFilterConfig {
    /// When non-empty, only these clients pass
    #[serde(deserialize_with = "lenient::string_list")]
    pub allow: Vec<String>,

    /// Clients always rejected
    #[serde(deserialize_with = "lenient::string_list")]
    pub deny: Vec<String>,
}

#[derive(Debug)]
pub struct IpFilterMiddleware {
    allow: Vec<IpRule>,
    deny: Vec<IpRule>,
}

impl IpFilterMiddleware {
    pub fn new(config: IpFilterConfig) -> GatewayResult<Self> {
        let parse = |rules: &[String]| rules.iter().map(|r| IpRule::parse(r)).collect::<GatewayResult<Vec<_>>>();
        Ok(Self {
            allow: parse(&config.allow)?,
            deny: parse(&config.deny)?,
        })
    }

    /// Build from `ip_filter[:allowed,...]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["allow*"])?)
    }

    /// Whether a client may pass; unknown clients only pass when there is no allow list
    pub fn permits(&self, ip: Option<IpAddr>) -> bool {
        match ip {
            Some(ip) => {
                if self.deny.iter().any(|rule| rule.contains(ip)) {
                    return false;
                }
                self.allow.is_empty() || self.allow.iter().any(|rule| rule.contains(ip))
            }
            None => self.allow.is_empty(),
        }
    }
}

#[async_trait]
impl Middleware for IpFilterMiddleware {
    fn name(&self) -> &str {
        "ip_filter"
    }

    fn priority(&self) -> i32 {
        -70
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let ip = context.client_ip.or_else(|| request.client_ip());
        if !self.permits(ip) {
            debug!(client_ip = ?ip, "Client address rejected");
            return Ok(Outcome::Response(GatewayResponse::error(StatusCode::FORBIDDEN, "Forbidden")));
        }
        next.run(request, context).await
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllowMethodsConfig {
    #[serde(deserialize_with = "lenient::string_list")]
    pub methods: Vec<String>,
}

#[derive(Debug)]
pub struct AllowMethodsMiddleware {
    methods: Vec<Method>,
}

impl AllowMethodsMiddleware {
    pub fn new(config: AllowMethodsConfig) -> GatewayResult<Self> {
        if config.methods.is_empty() {
            return Err(GatewayError::config("allow_methods needs at least one method"));
        }
        let methods = config
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| GatewayError::config(format!("Invalid method: {}", m)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { methods })
    }

    /// Build from `allow_methods:GET,POST`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Self::new(args.into_config(&["methods*"])?)
    }
}

#[async_trait]
impl Middleware for AllowMethodsMiddleware {
    fn name(&self) -> &str {
        "allow_methods"
    }

    fn priority(&self) -> i32 {
        -60
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        if self.methods.contains(&request.method) {
            return next.run(request, context).await;
        }

        let mut response = GatewayResponse::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        let allow: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
        response.set_header(axum::http::header::ALLOW, allow.join(", "));
        Ok(Outcome::Response(response))
    }
}
