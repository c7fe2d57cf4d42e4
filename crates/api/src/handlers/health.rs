use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::routes::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (status, database) = match state.db.health_check().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    (
        status,
        Json(json!({
            "status": if status.is_success() { "ok" } else { "unavailable" },
            "database": database,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// Prometheus 文本格式的指标
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}
