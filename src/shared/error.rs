use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Failure talking to a collaborator service (vector search, LLM, WeChat).
/// Callers on the chat path degrade instead of propagating these to users.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed upstream payload: {0}")]
    Decode(String),
}

/// Request-path errors that map to an HTTP response.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid credentials")]
    Unauthorized,
    #[error("validation failed")]
    Validation(serde_json::Value),
    #[error("{message}")]
    MalformedLlmOutput { message: String, raw_content: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &str, message: &str) -> Self {
        ApiError::Validation(json!({ field: [message] }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "message": "Invalid credentials" })),
            )
                .into_response(),
            ApiError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "message": "The given data was invalid.", "errors": errors })),
            )
                .into_response(),
            ApiError::MalformedLlmOutput {
                message,
                raw_content,
            } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "message": message,
                    "raw_content": raw_content,
                })),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "message": format!("{} not found", what) })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                log::error!("internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}
