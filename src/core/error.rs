//! # Error Handling Module
//!
//! Every failure the gateway can surface lives in [`GatewayError`]. Per-attempt
//! upstream failures are first captured as a [`Failure`] and only become a
//! `GatewayError` once the retry controller has decided that the request is
//! done; callers never see the intermediate attempts.
//!
//! Each variant maps to:
//! - an HTTP status (`status_code`)
//! - a machine-readable reason code (`error_type`)
//! - the id of the instance that produced it, when there is one
//!
//! Upstream addresses never appear in caller-visible messages. The detailed
//! transport error is logged instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::core::types::{Failure, FailureReason};

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the gateway
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Invalid or unreadable configuration. Fatal, startup only.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No route matches the request path
    #[error("No route found for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// No healthy or suspect instance left to try in the group
    #[error("No available instance in upstream group '{group}'")]
    Exhausted { group: String },

    /// TCP connect to the instance failed
    #[error("Connection to upstream instance {instance} failed")]
    ConnectFailed { instance: String, detail: String },

    /// The attempt's own timeout elapsed before response headers arrived
    #[error("Upstream instance {instance} did not respond within {timeout_ms}ms")]
    Timeout { instance: String, timeout_ms: u64 },

    /// The upstream closed or reset the connection mid-exchange
    #[error("Upstream instance {instance} reset the connection")]
    UpstreamReset { instance: String, detail: String },

    /// The upstream spoke invalid HTTP
    #[error("Upstream instance {instance} sent an invalid response")]
    ProtocolError { instance: String, detail: String },

    /// The overall per-request deadline elapsed
    #[error("Request deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded {
        deadline_ms: u64,
        instance: Option<String>,
    },

    /// Concurrency limit reached, request rejected without queueing
    #[error("Gateway overloaded: {limit} requests already in flight")]
    Overloaded { limit: usize },

    /// Inbound body larger than the configured maximum
    #[error("Request body exceeds the maximum of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Inbound body could not be read
    #[error("Failed to read request body: {message}")]
    BadRequest { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (socket binding, file operations)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// JSON serialization errors
    #[error("JSON error: {message}")]
    Json { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a route-not-found error
    pub fn route_not_found<M: Into<String>, P: Into<String>>(method: M, path: P) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create an exhausted-group error
    pub fn exhausted<S: Into<String>>(group: S) -> Self {
        Self::Exhausted {
            group: group.into(),
        }
    }

    /// Turn the last failed attempt into the terminal error returned to the caller
    pub fn from_failure(failure: &Failure) -> Self {
        let instance = failure.instance_id.clone();
        let detail = failure.message.clone();
        match failure.reason {
            FailureReason::ConnectFailed => Self::ConnectFailed { instance, detail },
            FailureReason::Timeout => Self::Timeout {
                instance,
                timeout_ms: failure.elapsed.as_millis() as u64,
            },
            FailureReason::UpstreamReset => Self::UpstreamReset { instance, detail },
            FailureReason::ProtocolError => Self::ProtocolError { instance, detail },
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamReset { .. } => StatusCode::BAD_GATEWAY,
            Self::ProtocolError { .. } => StatusCode::BAD_GATEWAY,
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason code included in every error body
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Exhausted { .. } => "exhausted",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::Timeout { .. } => "timeout",
            Self::UpstreamReset { .. } => "upstream_reset",
            Self::ProtocolError { .. } => "protocol_error",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Overloaded { .. } => "overloaded",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::BadRequest { .. } => "bad_request",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Json { .. } => "json_error",
        }
    }

    /// Instance that produced this error, if any
    pub fn instance(&self) -> Option<&str> {
        match self {
            Self::ConnectFailed { instance, .. }
            | Self::Timeout { instance, .. }
            | Self::UpstreamReset { instance, .. }
            | Self::ProtocolError { instance, .. } => Some(instance),
            Self::DeadlineExceeded { instance, .. } => instance.as_deref(),
            _ => None,
        }
    }

    /// Whether another instance may be tried after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::Timeout { .. })
    }

    /// Whether this error came back from an upstream attempt (as opposed to
    /// being decided locally by the gateway)
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::Timeout { .. }
                | Self::UpstreamReset { .. }
                | Self::ProtocolError { .. }
        )
    }

    /// Build the JSON error body sent to callers
    ///
    /// `message` replaces the default message when the owning route defines
    /// its own error text. `upstream_address` is only passed when the
    /// configuration allows exposing addresses.
    pub fn to_body(
        &self,
        request_id: Option<&str>,
        message: Option<&str>,
        upstream_address: Option<&str>,
    ) -> serde_json::Value {
        let status = self.status_code();
        let mut error = json!({
            "code": status.as_u16(),
            "type": self.error_type(),
            "message": message.map(str::to_string).unwrap_or_else(|| self.to_string()),
        });

        if let Some(instance) = self.instance() {
            error["instance"] = json!(instance);
        }
        if let Some(address) = upstream_address {
            error["upstream"] = json!(address);
        }
        if let Some(request_id) = request_id {
            error["request_id"] = json!(request_id);
        }

        json!({ "error": error })
    }

    /// Convert into an HTTP response with request-scoped details
    pub fn into_response_with(
        self,
        request_id: Option<&str>,
        message: Option<&str>,
        upstream_address: Option<&str>,
    ) -> Response {
        let body = self.to_body(request_id, message, upstream_address);
        (self.status_code(), Json(body)).into_response()
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

/// Lets axum turn a `GatewayError` straight into a structured JSON response
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with(None, None, None)
    }
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
