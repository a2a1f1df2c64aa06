use async_trait::async_trait;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use axum::http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::middleware::pipeline::{Middleware, Next, Outcome};
use crate::middleware::spec::{lenient, MiddlewareArgs};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any
    #[serde(deserialize_with = "lenient::string_list")]
    pub origins: Vec<String>,
    #[serde(deserialize_with = "lenient::string_list")]
    pub methods: Vec<String>,
    #[serde(deserialize_with = "lenient::string_list")]
    pub headers: Vec<String>,
    #[serde(deserialize_with = "lenient::string_list")]
    pub expose_headers: Vec<String>,
    pub credentials: bool,
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
            methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            expose_headers: Vec::new(),
            credentials: false,
            max_age: Some(3600),
        }
    }
}

/// Answers CORS preflights and decorates responses for allowed origins
#[derive(Debug)]
pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    /// Build from `cors[:origin,...]`
    pub fn from_args(args: &MiddlewareArgs) -> GatewayResult<Self> {
        Ok(Self::new(args.into_config(&["origins*"])?))
    }

    fn is_allowed(&self, origin: &str) -> bool {
        self.config
            .origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }

    fn allow_any(&self) -> bool {
        !self.config.credentials && self.config.origins.iter().any(|o| o == "*")
    }

    fn apply_origin_headers(&self, response: &mut GatewayResponse, origin: &str) {
        if self.allow_any() {
            response.set_header(ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        } else {
            response.set_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            response.set_header(VARY, "Origin");
        }
        if self.config.credentials {
            response.set_header(ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
    }

    fn preflight(&self, origin: &str) -> GatewayResponse {
        let mut response = GatewayResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "");
        self.apply_origin_headers(&mut response, origin);
        response.set_header(ACCESS_CONTROL_ALLOW_METHODS, self.config.methods.join(", "));
        response.set_header(ACCESS_CONTROL_ALLOW_HEADERS, self.config.headers.join(", "));
        if let Some(max_age) = self.config.max_age {
            response.set_header(ACCESS_CONTROL_MAX_AGE, max_age.to_string());
        }
        response
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    fn priority(&self) -> i32 {
        -80
    }

    async fn process(
        &self,
        request: IncomingRequest,
        context: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Outcome> {
        let Some(origin) = request.header(ORIGIN.as_str()).map(str::to_string) else {
            return next.run(request, context).await;
        };

        let allowed = self.is_allowed(&origin);
        let is_preflight =
            request.method == Method::OPTIONS && request.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD);

        if is_preflight {
            if !allowed {
                debug!(origin = %origin, "Rejecting CORS preflight");
                return Ok(Outcome::Response(GatewayResponse::error(
                    StatusCode::FORBIDDEN,
                    "Origin not allowed",
                )));
            }
            return Ok(Outcome::Response(self.preflight(&origin)));
        }

        let outcome = next.run(request, context).await?;
        if !allowed {
            return Ok(outcome);
        }

        Ok(outcome.map_response(|mut response| {
            self.apply_origin_headers(&mut response, &origin);
            if !self.config.expose_headers.is_empty() {
                response.set_header(ACCESS_CONTROL_EXPOSE_HEADERS, self.config.expose_headers.join(", "));
            }
            response
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::pipeline::test_support::*;
    use std::sync::Arc;

    fn with_origin(method: Method, origin: &str) -> IncomingRequest {
        let mut request = request(method, "http://b/");
        request.headers.insert(ORIGIN, origin.parse().unwrap());
        request
    }

    #[tokio::test]
    async fn test_preflight_is_answered_locally() {
        let cors = Arc::new(CorsMiddleware::new(CorsConfig::default()));
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let mut preflight = with_origin(Method::OPTIONS, "https://app.example");
        preflight.headers.insert(ACCESS_CONTROL_REQUEST_METHOD, "PUT".parse().unwrap());

        let response = run_one(cors, preflight, &context(), &endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));
        assert!(response.header("access-control-allow-methods").unwrap().contains("PUT"));
        assert_eq!(response.header("access-control-max-age"), Some("3600"));
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_specific_origins() {
        let args = crate::middleware::spec::normalize(&serde_json::json!("cors:https://a.example")).unwrap();
        let cors = Arc::new(CorsMiddleware::from_args(&args).unwrap());
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);

        let allowed = run_one(cors.clone(), with_origin(Method::GET, "https://a.example"), &context(), &endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(allowed.header("access-control-allow-origin"), Some("https://a.example"));
        assert_eq!(allowed.header("vary"), Some("Origin"));

        let denied = run_one(cors, with_origin(Method::GET, "https://evil.example"), &context(), &endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(denied.status, StatusCode::OK);
        assert_eq!(denied.header("access-control-allow-origin"), None);
    }

    #[tokio::test]
    async fn test_requests_without_origin_pass_through() {
        let cors = Arc::new(CorsMiddleware::new(CorsConfig::default()));
        let endpoint = ScriptedEndpoint::always(StatusCode::OK);
        let response = run_one(cors, request(Method::OPTIONS, "http://b/"), &context(), &endpoint)
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(response.header("access-control-allow-origin"), None);
        assert_eq!(endpoint.calls(), 1);
    }
}
