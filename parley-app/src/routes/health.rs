use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/check-api-key", get(check_api_key))
        .route("/check-open-ai-key", get(check_api_key))
        .route("/api/v1/health", get(get_health))
}

/// Reports whether a provider credential is configured. A missing key is not
/// a failure of this endpoint.
#[tracing::instrument(level = "debug", skip_all)]
async fn check_api_key(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    if !state.credential_configured {
        tracing::warn!("OPENROUTER_API_KEY is not set; completion requests will fail");
    }
    Json(serde_json::json!({ "success": state.credential_configured }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "ready": true,
        "checked_at": Utc::now(),
        "credential_configured": state.credential_configured,
        "conversations": state.registry.len(),
    }))
}
