//! # Error Handling Module
//!
//! This module defines every error the dispatcher can produce using the `thiserror` crate,
//! together with the HTTP status code each one maps to when it reaches the host.
//!
//! ## Error Categories
//! - **Transport failures**: the backend could not be reached or timed out. These are the
//!   only errors that retry, circuit breaker, timeout and error handling middleware react to.
//! - **Configuration errors**: unknown middleware aliases, invalid middleware options,
//!   unreadable route files. Raised while routes are loaded, never per request.
//! - **Store errors**: the shared key-value backend failed.
//! - **Everything else**: propagated unchanged to the caller.
//!
//! The "fallback" outcome is deliberately *not* an error. It travels through the chain as
//! [`Outcome::Fallback`](crate::middleware::Outcome) so it can never be mistaken for a
//! transport failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::caching::CacheError;

/// Main result type used throughout the dispatcher
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the dispatcher
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (unknown middleware, invalid options, bad route files)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The backend could not be reached, the connection broke, or the call timed out
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The shared key-value store failed
    #[error("Store error: {message}")]
    Store { message: String },

    /// The incoming request could not be turned into a forwardable request
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors (route files, config files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration and route files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transport error with a custom message
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Whether this is the network-level failure raised by a transport
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether this transport failure was a timeout.
    ///
    /// Classification is done on the message because transports report timeouts
    /// in different ways ("operation timed out", "request timeout", ...).
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport { message } => {
                let message = message.to_ascii_lowercase();
                message.contains("timed out") || message.contains("timeout")
            }
            _ => false,
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Transport { .. } if self.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transport { .. } if self.is_timeout() => "gateway_timeout",
            Self::Transport { .. } => "bad_gateway",
            Self::Configuration { .. } => "configuration_error",
            Self::Store { .. } => "store_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<CacheError> for GatewayError {
    fn from(err: CacheError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Render errors that escape the dispatcher as a JSON error body.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
