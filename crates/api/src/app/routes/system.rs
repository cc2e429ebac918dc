use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use gitgauge_infra::jobs::JobService;

/// Liveness plus a storage round-trip. `503` when the job store is unreachable.
pub async fn health(Extension(jobs): Extension<JobService>) -> impl IntoResponse {
    let storage_ok = jobs.storage_ok().await;
    let (code, status, database_status) = if storage_ok {
        (StatusCode::OK, "ok", "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unavailable")
    };

    (
        code,
        Json(json!({
            "status": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "database_status": database_status,
        })),
    )
}
