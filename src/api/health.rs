use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::api::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "healthy", "database": "connected"})),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "database": "disconnected",
                    "error": e.to_string(),
                })),
            )
        }
    }
}
