//! Error types for the gateway.
//!
//! Every variant renders as an OpenAI-style error envelope when returned
//! from a handler, so callers see the same shape regardless of whether the
//! failure happened locally or upstream.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("{message}")]
    Auth { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream timed out: {message}")]
    Timeout { message: String },

    #[error("Gateway error: {message}")]
    Gateway { message: String },

    #[error("Resource not found: {path}")]
    NotFound { path: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout {
            message: msg.into(),
        }
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway {
            message: msg.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Classify a transport failure from the upstream client.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || caused_by_timeout(err) {
            Self::timeout(err.to_string())
        } else {
            Self::gateway(err.to_string())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Gateway { .. } => StatusCode::BAD_GATEWAY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Config { .. }
            | Self::Http(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            Self::Auth { .. } => ("authentication_error", "invalid_api_key"),
            Self::InvalidRequest { .. } => ("invalid_request_error", "invalid_request"),
            Self::Upstream { .. } => ("upstream_error", "upstream_failed"),
            Self::Timeout { .. } => ("timeout_error", "upstream_timeout"),
            Self::Gateway { .. } => ("gateway_error", "bad_gateway"),
            Self::NotFound { .. } => ("not_found_error", "not_found"),
            Self::Config { .. }
            | Self::Http(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_) => ("internal_error", "internal_error"),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let (error_type, code) = self.kind();
        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: error_type.to_string(),
                code: code.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Read timeouts can surface as an I/O error nested inside the transport error.
fn caused_by_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = cause.source();
    }
    false
}
