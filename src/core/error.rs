//! # Error Handling Module
//!
//! This module provides the error types used across the gateway. Every error
//! kind maps to an HTTP status code, and errors that reach the client are
//! rendered as the gateway's JSON error envelope `{"error", "reason"}` --
//! no raw error crosses the process boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error kinds for the gateway core
///
/// Each variant represents a different disposition: policy denials carry the
/// denying policy's status code, upstream failures map to 502/504, breaker
/// rejections to 503, and configuration problems are fatal at load time.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid configuration (bad route definitions, malformed JSON, ...)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A route with the same name is already registered
    #[error("Route already exists: {name}")]
    RouteConflict { name: String },

    /// A policy denied the request
    #[error("Policy '{policy}' denied request: {reason}")]
    PolicyDenied {
        status_code: u16,
        error: String,
        reason: String,
        policy: String,
    },

    /// A policy failed internally while evaluating
    #[error("Policy '{policy}' failed: {message}")]
    PolicyInternal { policy: String, message: String },

    /// Circuit breaker rejected the request
    #[error("Circuit open for service: {service_id}")]
    BreakerOpen { service_id: String },

    /// Connection, DNS, or TLS failure talking to the upstream
    #[error("Upstream transport error for {service_id}: {message}")]
    UpstreamTransport { service_id: String, message: String },

    /// Upstream call exceeded the route's timeout
    #[error("Upstream timeout for {service_id} after {timeout_ms}ms")]
    UpstreamTimeout { service_id: String, timeout_ms: u64 },

    /// Shared store I/O failure
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(#[from] crate::store::StoreError),

    /// routes.json read/write failure
    #[error("File I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    /// JSON serialization/deserialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RouteConflict { .. } => StatusCode::CONFLICT,
            Self::PolicyDenied { status_code, .. } => {
                StatusCode::from_u16(*status_code).unwrap_or(StatusCode::FORBIDDEN)
            }
            Self::PolicyInternal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::FileIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short error label for the JSON envelope
    pub fn error_label(&self) -> String {
        match self {
            Self::PolicyDenied { error, .. } => error.clone(),
            Self::BreakerOpen { .. } => "Service Unavailable".to_string(),
            Self::UpstreamTransport { .. } => "Bad Gateway".to_string(),
            Self::UpstreamTimeout { .. } => "Gateway Timeout".to_string(),
            Self::PolicyInternal { .. } | Self::Internal { .. } => {
                "Internal Server Error".to_string()
            }
            other => other
                .status_code()
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
        }
    }

    /// Human-readable reason for the JSON envelope
    pub fn reason(&self) -> String {
        match self {
            Self::PolicyDenied { reason, .. } => reason.clone(),
            Self::PolicyInternal { .. } => "Error evaluating policy".to_string(),
            Self::BreakerOpen { .. } => "circuit open".to_string(),
            Self::UpstreamTimeout { .. } => "upstream request timed out".to_string(),
            Self::UpstreamTransport { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Error kind label used for breaker failure records and metrics
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::UpstreamTransport { .. } => "transport",
            Self::UpstreamTimeout { .. } => "timeout",
            Self::StoreUnavailable(_) => "store",
            _ => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.error_label(),
            "reason": self.reason(),
        });
        if let Self::PolicyInternal { policy, .. } = &self {
            body["policy"] = json!(policy);
        }
        (status, Json(body)).into_response()
    }
}
