use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType {
        code: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn unsupported_media_type(code: &'static str, message: &'static str) -> Self {
        Self::UnsupportedMediaType { code, message }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            // Non-JSON bodies answer with a server error status.
            Self::UnsupportedMediaType { code, message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, code, message.to_string())
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}

/// Failures of a single watch attempt against the discovery backend.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid discovery endpoint `{0}`, expected host:port")]
    InvalidEndpoint(String),
    #[error("discovery connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("discovery connection failed: {0}")]
    Io(#[from] io::Error),
}

impl WatchError {
    /// Numeric code for log records; OS error number when one is available.
    pub fn code(&self) -> i32 {
        match self {
            Self::Connect { source, .. } | Self::Io(source) => source.raw_os_error().unwrap_or(-1),
            Self::InvalidEndpoint(_) => -2,
        }
    }
}
