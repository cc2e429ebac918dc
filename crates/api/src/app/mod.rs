//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend wiring (store, queue, collaborators, worker pool)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router};
use tower::ServiceBuilder;

use gitgauge_infra::jobs::JobService;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router around a job service.
pub fn build_app(jobs: JobService) -> Router {
    routes::router()
        .layer(Extension(jobs))
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::log_requests)))
}
