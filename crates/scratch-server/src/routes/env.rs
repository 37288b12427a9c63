use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/scratches/{name}/env: env file name to content.
pub async fn read_env(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let files = tokio::task::spawn_blocking(move || ctl.read_env(&name))
        .await
        .map_err(AppError::join)??;
    let out: BTreeMap<String, String> = files
        .into_iter()
        .map(|(k, f)| (k, f.content))
        .collect();
    Ok(Json(serde_json::json!(out)))
}

#[derive(Deserialize)]
pub struct WriteEnvBody {
    pub files: BTreeMap<String, String>,
}

/// PUT /api/scratches/{name}/env
pub async fn write_env(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<WriteEnvBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.files.is_empty() {
        return Err(AppError::bad_request("no env files given"));
    }
    let ctl = app.controller.clone();
    let report = tokio::task::spawn_blocking(move || ctl.write_env(&name, &body.files))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(report)))
}

#[derive(Deserialize, Default)]
pub struct ResetEnvBody {
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

/// POST /api/scratches/{name}/env/reset: named files, or all when omitted.
pub async fn reset_env(
    State(app): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<ResetEnvBody>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ctl = app.controller.clone();
    let report = tokio::task::spawn_blocking(move || ctl.reset_env(&name, body.files.as_deref()))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(report)))
}
