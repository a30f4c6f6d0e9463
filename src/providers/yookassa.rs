use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{
    decimal_to_minor, http_client, minor_to_decimal, verify_hmac_sha256_hex, CreatedSession,
    IntentMetadata, PaymentError, PaymentResult, PaymentStatus, ProviderAdapter,
    ProviderCredentials, ProviderPlugin, WebhookEvent,
};

const DEFAULT_BASE_URL: &str = "https://api.yookassa.ru";

/// Basic-auth gateway (shop id + secret key), decimal-string amounts,
/// single-step capture via `capture: true` on the payment object. Every
/// mutating call carries an `Idempotence-Key` header.
pub struct YooKassaAdapter {
    client: Client,
    credentials: ProviderCredentials,
    base_url: String,
}

impl YooKassaAdapter {
    pub fn new(credentials: ProviderCredentials) -> Self {
        Self::with_base_url(credentials, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(credentials: ProviderCredentials, base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<Value, PaymentError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(PaymentError::Provider {
                code: status.as_u16().to_string(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }

    fn map_status(status: &str) -> PaymentStatus {
        match status {
            "succeeded" => PaymentStatus::Completed,
            "pending" => PaymentStatus::Pending,
            "waiting_for_capture" => PaymentStatus::Processing,
            "canceled" => PaymentStatus::Canceled,
            _ => PaymentStatus::Processing,
        }
    }

    fn payment_result(payment: &Value) -> PaymentResult {
        PaymentResult {
            success: true,
            transaction_id: payment["id"].as_str().unwrap_or_default().to_string(),
            status: Self::map_status(payment["status"].as_str().unwrap_or_default()),
            amount_minor: payment["amount"]["value"].as_str().and_then(decimal_to_minor),
            currency: payment["amount"]["currency"].as_str().map(str::to_string),
            correlation_id: payment["metadata"]["invoice_id"].as_str().map(str::to_string),
            error: None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for YooKassaAdapter {
    fn name(&self) -> &'static str {
        "yookassa"
    }

    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &IntentMetadata,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedSession, PaymentError> {
        let body = json!({
            "amount": {
                "value": minor_to_decimal(amount_minor),
                "currency": currency.to_uppercase(),
            },
            "capture": true,
            "confirmation": {
                "type": "redirect",
                "return_url": metadata.success_url,
            },
            "metadata": {
                "invoice_id": metadata.invoice_id.to_string(),
                "user_id": metadata.user_id.to_string(),
            },
        });
        let key = idempotency_key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let resp = self
            .client
            .post(format!("{}/v3/payments", self.base_url))
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .header("Idempotence-Key", key)
            .json(&body)
            .send()
            .await?;
        let payment = Self::check(resp).await?;
        Ok(CreatedSession {
            session_id: payment["id"].as_str().unwrap_or_default().to_string(),
            session_url: payment["confirmation"]["confirmation_url"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// No-ops on payments created with `capture: true` unless the payment is
    /// sitting in waiting_for_capture.
    async fn capture(
        &self,
        id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        let key = idempotency_key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let resp = self
            .client
            .post(format!("{}/v3/payments/{id}/capture", self.base_url))
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .header("Idempotence-Key", key)
            .json(&json!({}))
            .send()
            .await?;
        Ok(Self::payment_result(&Self::check(resp).await?))
    }

    async fn refund(
        &self,
        id: &str,
        amount_minor: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        let payment = self.get_status(id).await?;
        let amount = amount_minor
            .or(payment.amount_minor)
            .ok_or_else(|| PaymentError::Transient("refund amount unknown".into()))?;
        let currency = payment.currency.clone().unwrap_or_else(|| "RUB".into());
        let key = idempotency_key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let resp = self
            .client
            .post(format!("{}/v3/refunds", self.base_url))
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .header("Idempotence-Key", key)
            .json(&json!({
                "payment_id": id,
                "amount": {"value": minor_to_decimal(amount), "currency": currency},
            }))
            .send()
            .await?;
        let refund = Self::check(resp).await?;
        Ok(PaymentResult {
            success: true,
            transaction_id: refund["id"].as_str().unwrap_or_default().to_string(),
            status: PaymentStatus::Refunded,
            amount_minor: refund["amount"]["value"].as_str().and_then(decimal_to_minor),
            currency: refund["amount"]["currency"].as_str().map(str::to_string),
            correlation_id: None,
            error: None,
        })
    }

    async fn get_status(&self, id: &str) -> Result<PaymentResult, PaymentError> {
        let resp = self
            .client
            .get(format!("{}/v3/payments/{id}", self.base_url))
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .send()
            .await?;
        Ok(Self::payment_result(&Self::check(resp).await?))
    }

    /// HMAC-SHA256 hex digest of the raw body in `X-YooKassa-Signature`.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: &str,
    ) -> Result<Value, PaymentError> {
        let signature = headers
            .get("X-YooKassa-Signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::Security)?;
        if !verify_hmac_sha256_hex(secret, payload, signature) {
            return Err(PaymentError::Security);
        }
        serde_json::from_slice(payload).map_err(|_| PaymentError::Security)
    }

    fn parse_webhook_event(&self, payload: &Value) -> Option<WebhookEvent> {
        let object = &payload["object"];
        let invoice_id = object["metadata"]["invoice_id"]
            .as_str()
            .and_then(|raw| Uuid::parse_str(raw).ok());
        match payload["event"].as_str()? {
            "payment.succeeded" => Some(WebhookEvent::CaptureCompleted {
                invoice_id,
                session_id: object["id"].as_str().unwrap_or_default().to_string(),
                transaction_id: object["id"].as_str().unwrap_or_default().to_string(),
                amount_minor: object["amount"]["value"]
                    .as_str()
                    .and_then(decimal_to_minor)
                    .unwrap_or_default(),
                currency: object["amount"]["currency"]
                    .as_str()
                    .unwrap_or("RUB")
                    .to_string(),
            }),
            "payment.canceled" => Some(WebhookEvent::PaymentFailed {
                provider_subscription_id: None,
                invoice_id,
                message: object["cancellation_details"]["reason"]
                    .as_str()
                    .unwrap_or("payment canceled")
                    .to_string(),
            }),
            "refund.succeeded" => Some(WebhookEvent::RefundCompleted {
                invoice_id,
                session_id: object["payment_id"].as_str().unwrap_or_default().to_string(),
                refund_reference: object["id"].as_str().unwrap_or_default().to_string(),
                amount_minor: object["amount"]["value"]
                    .as_str()
                    .and_then(decimal_to_minor)
                    .unwrap_or_default(),
                currency: object["amount"]["currency"]
                    .as_str()
                    .unwrap_or("RUB")
                    .to_string(),
            }),
            _ => None,
        }
    }
}

pub struct YooKassaPlugin;

impl ProviderPlugin for YooKassaPlugin {
    fn name(&self) -> &'static str {
        "yookassa"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn default_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("sandbox".into(), Value::Bool(true));
        // api_key holds the shop id; api_secret the secret key.
        config.insert("test_api_key".into(), Value::String(String::new()));
        config.insert("test_api_secret".into(), Value::String(String::new()));
        config.insert("test_webhook_secret".into(), Value::String(String::new()));
        config.insert("live_api_key".into(), Value::String(String::new()));
        config.insert("live_api_secret".into(), Value::String(String::new()));
        config.insert("live_webhook_secret".into(), Value::String(String::new()));
        config
    }

    fn build(&self, credentials: ProviderCredentials) -> Arc<dyn ProviderAdapter> {
        Arc::new(YooKassaAdapter::new(credentials))
    }
}
