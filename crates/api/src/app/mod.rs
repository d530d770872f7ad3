//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, gateway and dispatcher wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Largest accepted upload, multipart framing included.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/transcribe", post(routes::transcribe::transcribe))
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .layer(Extension(services)),
        )
}
