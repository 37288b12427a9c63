use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/services: live state of the shared services.
pub async fn list_services(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let status = tokio::task::spawn_blocking(move || ctl.list_shared())
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(status)))
}

#[derive(Deserialize, Default)]
pub struct ServicesBody {
    #[serde(default)]
    pub services: Vec<String>,
}

/// POST /api/services/start: all shared services unless named.
pub async fn start_services(
    State(app): State<AppState>,
    body: Option<Json<ServicesBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ctl = app.controller.clone();
    tokio::task::spawn_blocking(move || ctl.start_shared(&body.services))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!({ "status": "started" })))
}

pub async fn stop_services(
    State(app): State<AppState>,
    body: Option<Json<ServicesBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ctl = app.controller.clone();
    tokio::task::spawn_blocking(move || ctl.stop_shared(&body.services))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!({ "status": "stopped" })))
}
