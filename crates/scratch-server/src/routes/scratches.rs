use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use scratch_core::lifecycle::CreateOutcome;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/scratches: every scratch with live service state.
pub async fn list_scratches(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let list = tokio::task::spawn_blocking(move || ctl.list())
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(list)))
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub branch: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

/// POST /api/scratches: create, or update when the identity exists.
/// 201 on create, 200 on update.
pub async fn create_scratch(
    State(app): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let ctl = app.controller.clone();
    let result = tokio::task::spawn_blocking(move || {
        ctl.create(&body.branch, body.name.as_deref(), body.profile.as_deref())
    })
    .await
    .map_err(AppError::join)??;
    let status = match result.outcome {
        CreateOutcome::Created => StatusCode::CREATED,
        CreateOutcome::Updated => StatusCode::OK,
    };
    Ok((status, Json(serde_json::json!(result))))
}

/// GET /api/scratches/{name}
pub async fn get_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let status = tokio::task::spawn_blocking(move || ctl.status(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(status)))
}

/// DELETE /api/scratches/{name}
pub async fn delete_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let id = name.clone();
    tokio::task::spawn_blocking(move || ctl.delete(&id))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!({ "deleted": name })))
}

pub async fn start_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let scratch = tokio::task::spawn_blocking(move || ctl.start(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(scratch)))
}

pub async fn stop_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let scratch = tokio::task::spawn_blocking(move || ctl.stop(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(scratch)))
}

pub async fn restart_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let scratch = tokio::task::spawn_blocking(move || ctl.restart(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(scratch)))
}

/// POST /api/scratches/{name}/update: re-render and redeploy what changed.
pub async fn update_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let report = tokio::task::spawn_blocking(move || ctl.update(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(report)))
}

pub async fn rebuild_scratch(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let scratch = tokio::task::spawn_blocking(move || ctl.rebuild(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(scratch)))
}

/// POST /api/scratches/{name}/wipe-db
pub async fn wipe_database(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let scratch = tokio::task::spawn_blocking(move || ctl.wipe_database(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(scratch)))
}
