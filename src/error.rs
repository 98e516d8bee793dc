use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

/// Inbound telemetry that cannot be turned into a reading. The message is dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Failure to get a command onto the transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("no acknowledgement within {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// A request rejected before anything is published.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("deviceId required")]
    MissingDeviceId,

    #[error("rules must be an array")]
    RulesNotSequence,

    #[error("rule {index} is invalid: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RulesError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Errors returned from the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unknown device: {0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Command(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        let message = self.to_string();
        warn!("Request failed ({}): {}", status, message);

        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}
