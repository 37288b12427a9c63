use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub tail: Option<usize>,
}

/// GET /api/scratches/{name}/logs?service=&tail=: container output.
pub async fn get_logs(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let logs = tokio::task::spawn_blocking(move || ctl.logs(&name, q.service.as_deref(), q.tail))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

/// GET /api/scratches/{name}/oplogs: operation audit logs, oldest first.
pub async fn list_oplogs(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let entries = tokio::task::spawn_blocking(move || ctl.oplogs(&name))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!(entries)))
}

pub async fn get_oplog(
    State(app): State<AppState>,
    Path((name, file)): Path<(String, String)>,
) -> Result<String, AppError> {
    let ctl = app.controller.clone();
    let text = tokio::task::spawn_blocking(move || ctl.oplog(&name, &file))
        .await
        .map_err(AppError::join)??;
    Ok(text)
}
