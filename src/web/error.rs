use std::fmt;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

/// Errors surfaced to HTTP callers.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed or out-of-bounds request; rejected before any backend call.
    InvalidRequest(String),
    /// The generation backend failed; never retried by the gateway.
    Backend(anyhow::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InvalidRequest(reason) => write!(f, "Invalid request: {}", reason),
            GatewayError::Backend(e) => write!(f, "Failed to generate response: {}", e),
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::Backend(e)
    }
}
