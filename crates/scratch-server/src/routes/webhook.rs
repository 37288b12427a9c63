use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use scratch_core::lifecycle::WebhookOutcome;
use sha2::Sha256;

use crate::error::AppError;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// POST /api/webhooks/github: push or pull-request payload.
///
/// A branch reference creates (or updates) its scratch and answers 200 with
/// the result; anything else is acknowledged with 202.
pub async fn github_webhook(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if let Some(secret) = &app.controller.config().server.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing webhook signature"))?;
        if !verify_signature(secret, &body, signature) {
            tracing::warn!("webhook signature mismatch");
            return Err(AppError::unauthorized("invalid webhook signature"));
        }
    }
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid JSON payload: {e}")))?;

    let ctl = app.controller.clone();
    let outcome = tokio::task::spawn_blocking(move || ctl.webhook(&payload))
        .await
        .map_err(AppError::join)??;
    let status = match outcome {
        WebhookOutcome::Deployed(_) => StatusCode::OK,
        WebhookOutcome::Ignored { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(serde_json::json!(outcome))))
}

/// Check a `sha256=<hex>` signature over the raw body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha256=<hex>` signature for `body`, as a sender computes it.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
