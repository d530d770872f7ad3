use std::sync::Arc;

use axum::{
    extract::{Extension, Multipart},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::app::dto::TranscribeResponse;
use crate::app::errors::{gateway_error_to_response, json_error};
use crate::app::services::AppServices;

/// Multipart field carrying the audio.
pub const FILE_FIELD: &str = "file";

/// `POST /transcribe`: store the upload, run it as a job, and answer with
/// the transcript once the job finishes (or the request deadline passes).
pub async fn transcribe(
    Extension(services): Extension<Arc<AppServices>>,
    mut multipart: Multipart,
) -> Response {
    let (file_name, bytes) = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("missing multipart field \"{FILE_FIELD}\""),
                );
            }
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text());
            }
        };

        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        match field.bytes().await {
            Ok(bytes) => break (file_name, bytes),
            Err(e) => {
                warn!(error = %e, "failed to read upload");
                return json_error(e.status(), "invalid_multipart", e.body_text());
            }
        }
    };

    match services
        .gateway
        .transcribe_upload(&file_name, &bytes, services.request_timeout)
        .await
    {
        Ok(text) => Json(TranscribeResponse { text }).into_response(),
        Err(e) => {
            warn!(error = %e, "transcription request failed");
            gateway_error_to_response(e)
        }
    }
}
