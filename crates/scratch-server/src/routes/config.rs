use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/config: the loaded configuration plus validation warnings.
/// The webhook secret is redacted.
pub async fn get_config(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let ctl = app.controller.clone();
    let result = tokio::task::spawn_blocking(move || {
        let config = ctl.config();
        let mut json = serde_json::to_value(config)?;
        if config.server.webhook_secret.is_some() {
            json["server"]["webhook_secret"] = serde_json::json!("********");
        }
        Ok::<_, scratch_core::ScratchError>(serde_json::json!({
            "config": json,
            "warnings": config.validate(),
        }))
    })
    .await
    .map_err(AppError::join)??;

    Ok(Json(result))
}
