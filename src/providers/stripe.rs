use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Map, Value};
use sha2::Sha256;
use uuid::Uuid;

use super::{
    http_client, CreatedSession, IntentMetadata, PaymentError, PaymentResult, PaymentStatus,
    ProviderAdapter, ProviderCredentials, ProviderPlugin, WebhookEvent,
};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com";

/// Checkout-Sessions gateway: bearer-token auth, form-encoded bodies,
/// minor-unit integer amounts. Creation auto-captures (single-step), so
/// `capture` reports the already-settled session.
pub struct StripeAdapter {
    client: Client,
    credentials: ProviderCredentials,
    base_url: String,
}

impl StripeAdapter {
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

    fn map_status(payment_status: &str) -> PaymentStatus {
        match payment_status {
            "paid" | "no_payment_required" => PaymentStatus::Completed,
            "unpaid" => PaymentStatus::Pending,
            _ => PaymentStatus::Processing,
        }
    }

    fn session_result(session: &Value) -> PaymentResult {
        let status = Self::map_status(session["payment_status"].as_str().unwrap_or_default());
        PaymentResult {
            success: true,
            transaction_id: session["payment_intent"]
                .as_str()
                .or_else(|| session["id"].as_str())
                .unwrap_or_default()
                .to_string(),
            status,
            amount_minor: session["amount_total"].as_i64(),
            currency: session["currency"].as_str().map(str::to_uppercase),
            correlation_id: session["metadata"]["invoice_id"]
                .as_str()
                .map(str::to_string),
            error: None,
        }
    }

    async fn fetch_session(&self, id: &str) -> Result<Value, PaymentError> {
        let resp = self
            .client
            .get(format!("{}/v1/checkout/sessions/{id}", self.base_url))
            .bearer_auth(&self.credentials.api_key)
            .send()
            .await?;
        Self::check(resp).await
    }
}

#[async_trait]
impl ProviderAdapter for StripeAdapter {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &IntentMetadata,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedSession, PaymentError> {
        let params = [
            ("mode", "payment".to_string()),
            (
                "line_items[0][price_data][currency]",
                currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                amount_minor.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                "Payment".to_string(),
            ),
            ("line_items[0][quantity]", "1".to_string()),
            ("metadata[invoice_id]", metadata.invoice_id.to_string()),
            ("metadata[user_id]", metadata.user_id.to_string()),
            ("success_url", metadata.success_url.clone()),
            ("cancel_url", metadata.cancel_url.clone()),
        ];
        let mut req = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.credentials.api_key)
            .form(&params);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        let session = Self::check(req.send().await?).await?;
        Ok(CreatedSession {
            session_id: session["id"].as_str().unwrap_or_default().to_string(),
            session_url: session["url"].as_str().unwrap_or_default().to_string(),
        })
    }

    // Checkout sessions auto-capture at creation; capture reports settlement.
    async fn capture(
        &self,
        id: &str,
        _idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        let session = self.fetch_session(id).await?;
        Ok(Self::session_result(&session))
    }

    async fn refund(
        &self,
        id: &str,
        amount_minor: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        let session = self.fetch_session(id).await?;
        let payment_intent = session["payment_intent"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if payment_intent.is_empty() {
            return Err(PaymentError::Provider {
                code: "missing_payment_intent".into(),
                message: format!("session {id} has no payment intent to refund"),
            });
        }

        let mut params = vec![("payment_intent", payment_intent)];
        if let Some(amount) = amount_minor {
            params.push(("amount", amount.to_string()));
        }
        let mut req = self
            .client
            .post(format!("{}/v1/refunds", self.base_url))
            .bearer_auth(&self.credentials.api_key)
            .form(&params);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        let refund = Self::check(req.send().await?).await?;
        let status = match refund["status"].as_str().unwrap_or_default() {
            "succeeded" => PaymentStatus::Refunded,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Processing,
        };
        Ok(PaymentResult {
            success: true,
            transaction_id: refund["id"].as_str().unwrap_or_default().to_string(),
            status,
            amount_minor: refund["amount"].as_i64(),
            currency: refund["currency"].as_str().map(str::to_uppercase),
            correlation_id: None,
            error: None,
        })
    }

    async fn get_status(&self, id: &str) -> Result<PaymentResult, PaymentError> {
        let session = self.fetch_session(id).await?;
        Ok(Self::session_result(&session))
    }

    /// `Stripe-Signature: t=<ts>,v1=<hex>` — HMAC-SHA256 over `"{t}.{raw body}"`,
    /// compared in constant time.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: &str,
    ) -> Result<Value, PaymentError> {
        let header = headers
            .get("Stripe-Signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::Security)?;

        let mut timestamp = None;
        let mut signature = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(PaymentError::Security),
        };
        let sig = hex::decode(signature).map_err(|_| PaymentError::Security)?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| PaymentError::Security)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&sig).map_err(|_| PaymentError::Security)?;

        serde_json::from_slice(payload).map_err(|_| PaymentError::Provider {
            code: "bad_payload".into(),
            message: "webhook body is not valid JSON".into(),
        })
    }

    fn parse_webhook_event(&self, payload: &Value) -> Option<WebhookEvent> {
        let object = &payload["data"]["object"];
        match payload["type"].as_str()? {
            "checkout.session.completed" => Some(WebhookEvent::CaptureCompleted {
                invoice_id: object["metadata"]["invoice_id"]
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok()),
                session_id: object["id"].as_str().unwrap_or_default().to_string(),
                transaction_id: object["payment_intent"]
                    .as_str()
                    .or_else(|| object["id"].as_str())
                    .unwrap_or_default()
                    .to_string(),
                amount_minor: object["amount_total"].as_i64().unwrap_or_default(),
                currency: object["currency"]
                    .as_str()
                    .unwrap_or("usd")
                    .to_uppercase(),
            }),
            "charge.refunded" => Some(WebhookEvent::RefundCompleted {
                invoice_id: object["metadata"]["invoice_id"]
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok()),
                // Charges rarely carry session metadata; the payment intent is
                // the only session-side handle left for the fallback lookup.
                session_id: object["payment_intent"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                refund_reference: object["id"].as_str().unwrap_or_default().to_string(),
                amount_minor: object["amount_refunded"].as_i64().unwrap_or_default(),
                currency: object["currency"]
                    .as_str()
                    .unwrap_or("usd")
                    .to_uppercase(),
            }),
            "customer.subscription.deleted" => Some(WebhookEvent::SubscriptionCancelled {
                provider_subscription_id: object["id"].as_str().unwrap_or_default().to_string(),
            }),
            "invoice.payment_failed" => Some(WebhookEvent::PaymentFailed {
                provider_subscription_id: object["subscription"].as_str().map(str::to_string),
                invoice_id: None,
                message: object["last_payment_error"]["message"]
                    .as_str()
                    .unwrap_or("payment failed")
                    .to_string(),
            }),
            _ => None,
        }
    }
}

pub struct StripePlugin;

impl ProviderPlugin for StripePlugin {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn default_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("sandbox".into(), Value::Bool(true));
        config.insert("test_api_key".into(), Value::String(String::new()));
        config.insert("test_webhook_secret".into(), Value::String(String::new()));
        config.insert("live_api_key".into(), Value::String(String::new()));
        config.insert("live_webhook_secret".into(), Value::String(String::new()));
        config
    }

    fn build(&self, credentials: ProviderCredentials) -> Arc<dyn ProviderAdapter> {
        Arc::new(StripeAdapter::new(credentials))
    }
}

#[cfg(test)]
pub(crate) fn sign_payload(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
