use axum::{
    extract::{Extension, Path},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::providers::{minor_to_decimal, IntentMetadata};
use crate::repos::InvoiceStatus;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub invoice_id: Uuid,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub session_url: String,
}

fn frontend_base(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| crate::config::FRONTEND_URL.clone())
}

/// key: payments -> hosted checkout session for a pending invoice
pub async fn create_session(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> AppResult<Json<CreateSessionResponse>> {
    let invoice = state
        .invoices
        .find_by_id(payload.invoice_id)
        .ok_or(AppError::NotFound)?;
    if invoice.user_id != user.user_id {
        return Err(AppError::Forbidden);
    }
    if invoice.status != InvoiceStatus::Pending {
        return Err(AppError::Validation(format!(
            "invoice {} is not pending",
            invoice.id
        )));
    }

    let adapter = state.registry.resolve_adapter(&provider)?;
    let base = frontend_base(&headers);
    let success_url = payload
        .success_url
        .unwrap_or_else(|| format!("{base}/payment/success?invoice={}", invoice.id));
    let cancel_url = payload
        .cancel_url
        .unwrap_or_else(|| format!("{base}/payment/cancel?invoice={}", invoice.id));
    for redirect in [&success_url, &cancel_url] {
        url::Url::parse(redirect)
            .map_err(|_| AppError::Validation(format!("invalid redirect url: {redirect}")))?;
    }
    let metadata = IntentMetadata {
        invoice_id: invoice.id,
        user_id: user.user_id,
        success_url,
        cancel_url,
    };

    let key = format!("{provider}-session-{}", invoice.id);
    let session = state
        .idempotency
        .execute_session(&key, || async {
            adapter
                .create_payment_intent(invoice.amount_minor, &invoice.currency, &metadata, Some(&key))
                .await
        })
        .await?;

    // Stored before returning so webhook correlation can fall back to the
    // session id when provider metadata goes missing.
    let mut invoice = invoice;
    invoice.provider = Some(provider);
    invoice.provider_session_id = Some(session.session_id.clone());
    state.invoices.save(invoice);

    Ok(Json(CreateSessionResponse {
        session_id: session.session_id,
        session_url: session.session_url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub order_id: String,
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub success: bool,
    pub transaction_id: String,
    pub status: &'static str,
}

/// key: payments -> explicit capture for approve-then-capture gateways
pub async fn capture_order(
    Extension(state): Extension<AppState>,
    _user: AuthUser,
    Path(provider): Path<String>,
    Json(payload): Json<CaptureRequest>,
) -> AppResult<Json<CaptureResponse>> {
    let adapter = state.registry.resolve_adapter(&provider)?;
    let key = format!("{provider}-capture-{}", payload.order_id);
    let result = state
        .idempotency
        .execute_payment(&key, || async {
            adapter.capture(&payload.order_id, Some(&key)).await
        })
        .await?;

    state
        .reconciler
        .reconcile_poll(&provider, &payload.order_id, &result);

    Ok(Json(CaptureResponse {
        success: result.success,
        transaction_id: result.transaction_id,
        status: result.status.as_poll_str(),
    }))
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub status: &'static str,
    pub amount_total: Option<String>,
    pub currency: Option<String>,
}

/// key: payments -> poll fallback when a webhook never arrives
pub async fn session_status(
    Extension(state): Extension<AppState>,
    _user: AuthUser,
    Path((provider, session_id)): Path<(String, String)>,
) -> AppResult<Json<SessionStatusResponse>> {
    let adapter = state.registry.resolve_adapter(&provider)?;
    let result = adapter.get_status(&session_id).await?;

    state.reconciler.reconcile_poll(&provider, &session_id, &result);

    Ok(Json(SessionStatusResponse {
        status: result.status.as_poll_str(),
        amount_total: result.amount_minor.map(minor_to_decimal),
        currency: result.currency,
    }))
}
