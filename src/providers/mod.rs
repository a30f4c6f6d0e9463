pub mod paypal;
pub mod stripe;
pub mod yookassa;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::config;
use crate::error::AppError;

/// Normalized status vocabulary shared by every gateway adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Canceled,
    Refunded,
    Failed,
}

impl PaymentStatus {
    /// Closed vocabulary exposed by the polling endpoint.
    pub fn as_poll_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending | PaymentStatus::Processing => "pending",
            PaymentStatus::Completed => "paid",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// Result of every mutating or query adapter operation.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentResult {
    pub success: bool,
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    /// Invoice id carried in provider metadata, when the provider returns it.
    pub correlation_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSession {
    pub session_id: String,
    pub session_url: String,
}

/// Correlation material attached to every payment intent at creation time.
#[derive(Debug, Clone)]
pub struct IntentMetadata {
    pub invoice_id: Uuid,
    pub user_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

/// Error taxonomy adapters surface to callers. Raw reqwest errors never escape.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Network failure or timeout. Safe to retry.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Gateway returned a non-2xx response. Not auto-retried.
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },
    /// Webhook signature mismatch. Never retried.
    #[error("webhook signature mismatch")]
    Security,
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            PaymentError::Transient(err.to_string())
        } else {
            PaymentError::Provider {
                code: err
                    .status()
                    .map(|s| s.as_u16().to_string())
                    .unwrap_or_else(|| "network".into()),
                message: err.to_string(),
            }
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Transient(msg) => AppError::Transient(msg),
            PaymentError::Provider { code, message } => AppError::Provider { code, message },
            PaymentError::Security => AppError::Security,
        }
    }
}

/// Provider-agnostic notification parsed out of a verified webhook payload.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CaptureCompleted {
        invoice_id: Option<Uuid>,
        session_id: String,
        transaction_id: String,
        amount_minor: i64,
        currency: String,
    },
    RefundCompleted {
        invoice_id: Option<Uuid>,
        session_id: String,
        refund_reference: String,
        amount_minor: i64,
        currency: String,
    },
    SubscriptionCancelled {
        provider_subscription_id: String,
    },
    PaymentFailed {
        provider_subscription_id: Option<String>,
        invoice_id: Option<Uuid>,
        message: String,
    },
}

/// Uniform gateway contract. Callers branch on the normalized result, never on
/// provider identity.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &IntentMetadata,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedSession, PaymentError>;

    /// Single capture operation regardless of how many underlying gateway
    /// calls it takes. Auto-capturing gateways report the settled session.
    async fn capture(
        &self,
        id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError>;

    async fn refund(
        &self,
        id: &str,
        amount_minor: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError>;

    async fn get_status(&self, id: &str) -> Result<PaymentResult, PaymentError>;

    /// Verifies provider signature material against the exact raw body and
    /// returns the parsed payload. `PaymentError::Security` on mismatch.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: &str,
    ) -> Result<Value, PaymentError>;

    /// Translates a verified payload into a provider-agnostic notification.
    /// `None` for event types this core ignores.
    fn parse_webhook_event(&self, payload: &Value) -> Option<WebhookEvent>;
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("name", &self.name())
            .finish()
    }
}

/// Credentials resolved from a plugin's stored config at call time.
///
/// Config maps hold `test_`/`live_`-prefixed key pairs plus a `sandbox` flag;
/// resolution prefers the prefix matching the mode and falls back to the
/// unprefixed key.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: String,
    pub sandbox: bool,
}

impl ProviderCredentials {
    pub fn from_config(config: &Map<String, Value>) -> Self {
        let sandbox = config
            .get("sandbox")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| config::PAYMENT_ENV.as_str() != "production");
        let prefix = if sandbox { "test_" } else { "live_" };
        let pick = |key: &str| -> String {
            config
                .get(&format!("{prefix}{key}"))
                .or_else(|| config.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            api_key: pick("api_key"),
            api_secret: pick("api_secret"),
            webhook_secret: pick("webhook_secret"),
            sandbox,
        }
    }
}

/// Compile-time provider plugin factory. Replaces runtime class scanning:
/// discovery iterates an explicit list of these.
pub trait ProviderPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }
    fn default_config(&self) -> Map<String, Value>;
    fn build(&self, credentials: ProviderCredentials) -> Arc<dyn ProviderAdapter>;
}

/// The built-in provider plugin set, in discovery order.
pub fn builtin_plugins() -> Vec<Arc<dyn ProviderPlugin>> {
    vec![
        Arc::new(stripe::StripePlugin),
        Arc::new(paypal::PayPalPlugin),
        Arc::new(yookassa::YooKassaPlugin),
    ]
}

/// Shared HTTP client with the mandatory per-call timeout.
pub fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(*config::PROVIDER_TIMEOUT_SECS))
        .build()
        .expect("client build")
}

/// Formats a minor-unit amount as a two-decimal string ("2999" -> "29.99").
pub fn minor_to_decimal(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, (minor % 100).abs())
}

/// Parses a decimal amount string into minor units ("29.99" -> 2999).
pub fn decimal_to_minor(value: &str) -> Option<i64> {
    let mut parts = value.splitn(2, '.');
    let whole: i64 = parts.next()?.parse().ok()?;
    let frac_raw = parts.next().unwrap_or("0");
    if frac_raw.len() > 2 || frac_raw.is_empty() {
        return None;
    }
    let frac: i64 = frac_raw.parse().ok()?;
    let frac = if frac_raw.len() == 1 { frac * 10 } else { frac };
    Some(whole * 100 + frac)
}

/// Constant-time HMAC-SHA256 check of a hex signature over the raw body.
pub fn verify_hmac_sha256_hex(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(sig) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig).is_ok()
}

pub fn sign_hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
