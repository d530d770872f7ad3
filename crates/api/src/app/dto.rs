use serde::Serialize;

/// Body of a successful `POST /transcribe`.
#[derive(Debug, Clone, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
}
