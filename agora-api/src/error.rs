//! Uniform error envelope
//!
//! Every failure renders as `{ "error": <kind>, "message": <text> }` with
//! the HTTP status implied by the error class.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use agora_core::EconomyError;

pub struct ApiError(pub EconomyError);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

impl From<EconomyError> for ApiError {
    fn from(err: EconomyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            "validation" => StatusCode::BAD_REQUEST,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" | "insufficient_funds" | "escrow_exists" | "duplicate_key" => {
                StatusCode::CONFLICT
            }
            "transient" | "judge_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
