use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .merge(jobs::router())
}
