use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// GET /api/health
pub async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": app.started_at,
        "in_flight": app.controller.guard().snapshot(),
    }))
}
