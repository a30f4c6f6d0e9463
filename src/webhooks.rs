use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::routes::AppState;

/// key: webhooks -> verified gateway notifications
///
/// Unverified payloads are rejected with 400 before any parsing. Once a
/// payload is verified, the response is always 200: a notification the
/// settlement core cannot place is logged, never bounced, because gateways
/// retry on non-2xx and a permanent mismatch would retry forever.
pub async fn provider_webhook(
    Extension(state): Extension<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let adapter = state.registry.resolve_adapter(&provider)?;
    let credentials = state.registry.resolve_credentials(&provider)?;
    if credentials.webhook_secret.is_empty() {
        warn!(provider, "webhook secret not configured");
        return Err(AppError::Security);
    }

    let payload = adapter
        .verify_webhook(&body, &headers, &credentials.webhook_secret)
        .await?;

    match adapter.parse_webhook_event(&payload) {
        Some(event) => {
            info!(provider, event = ?event, "webhook event accepted");
            state.reconciler.apply_webhook_event(&provider, event);
        }
        None => {
            info!(provider, "webhook event ignored");
        }
    }

    Ok(Json(json!({ "received": true })))
}
