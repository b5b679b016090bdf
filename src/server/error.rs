use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::cache::controller::ControllerError;
use crate::upstream::UpstreamError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Controller(ControllerError::TierNotConfigured(_)) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            ApiError::Controller(ControllerError::Backend(e)) => {
                tracing::warn!(detail = %e, "Backend error");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            ApiError::Upstream(e) => {
                tracing::error!(detail = %e, "Upstream error");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));
        (status, body).into_response()
    }
}
