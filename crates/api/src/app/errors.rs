use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use scribe_infra::jobs::GatewayError;

pub fn gateway_error_to_response(err: GatewayError) -> axum::response::Response {
    match err {
        GatewayError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        GatewayError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
        err @ GatewayError::Failed { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "transcription_failed", err.to_string())
        }
        err @ GatewayError::DeadlineExceeded { .. } => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded", err.to_string())
        }
        err @ GatewayError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
