//! Error taxonomy and JSON error responses shared by the services

use crate::server::{json_response, HttpResponse};
use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request body or missing upload part
    #[error("{0}")]
    Validation(String),
    /// Unknown cheatsheet identifier or route
    #[error("{0}")]
    NotFound(String),
    /// Operation not allowed in the current worker state
    #[error("{0}")]
    Conflict(String),
    /// Request body over the configured limit
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(u64),
    /// Disk read or write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The worker process could not be spawned
    #[error("Failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),
    /// Serialization of persisted state failed
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Io(_) | ApiError::Launch(_) | ApiError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for faults on our side rather than bad input
    pub fn is_server_fault(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// `{status: "error", message}` body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"status":"error","message":"{}"}}"#,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Render an error as a `{status, message}` JSON response
pub fn json_error_response(error: &ApiError) -> HttpResponse {
    json_response(error.status_code(), ErrorResponse::new(error.to_string()).to_json())
}
