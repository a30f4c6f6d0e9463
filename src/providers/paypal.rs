use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    decimal_to_minor, http_client, minor_to_decimal, CreatedSession, IntentMetadata, PaymentError,
    PaymentResult, PaymentStatus, ProviderAdapter, ProviderCredentials, ProviderPlugin,
    WebhookEvent,
};

const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";
const LIVE_BASE_URL: &str = "https://api-m.paypal.com";

/// Margin subtracted from the token lifetime so a token is refreshed before it
/// actually expires mid-call.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Orders-API gateway: OAuth2 bearer token cached for the adapter's lifetime,
/// JSON bodies, decimal-string amounts, explicit two-step capture after buyer
/// approval. The invoice id travels in `custom_id`.
pub struct PayPalAdapter {
    client: Client,
    credentials: ProviderCredentials,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalAdapter {
    pub fn new(credentials: ProviderCredentials) -> Self {
        let base = if credentials.sandbox {
            SANDBOX_BASE_URL
        } else {
            LIVE_BASE_URL
        };
        Self::with_base_url(credentials, base)
    }

    pub fn with_base_url(credentials: ProviderCredentials, base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let resp = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .header("Accept", "application/json")
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let body = Self::check(resp).await?;
        let access_token = body["access_token"].as_str().unwrap_or_default().to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(0);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(access_token)
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
            "COMPLETED" => PaymentStatus::Completed,
            "CREATED" | "SAVED" | "PAYER_ACTION_REQUIRED" => PaymentStatus::Pending,
            "APPROVED" => PaymentStatus::Processing,
            "VOIDED" => PaymentStatus::Canceled,
            _ => PaymentStatus::Processing,
        }
    }
}

#[async_trait]
impl ProviderAdapter for PayPalAdapter {
    fn name(&self) -> &'static str {
        "paypal"
    }

    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &IntentMetadata,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedSession, PaymentError> {
        let token = self.access_token().await?;
        let order = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "amount": {
                    "currency_code": currency.to_uppercase(),
                    "value": minor_to_decimal(amount_minor),
                },
                "custom_id": metadata.invoice_id.to_string(),
            }],
            "application_context": {
                "return_url": metadata.success_url,
                "cancel_url": metadata.cancel_url,
                "user_action": "PAY_NOW",
            },
        });
        let mut req = self
            .client
            .post(format!("{}/v2/checkout/orders", self.base_url))
            .bearer_auth(&token)
            .json(&order);
        if let Some(key) = idempotency_key {
            req = req.header("PayPal-Request-Id", key);
        }
        let body = Self::check(req.send().await?).await?;
        let approve_url = body["links"]
            .as_array()
            .and_then(|links| {
                links
                    .iter()
                    .find(|link| link["rel"].as_str() == Some("approve"))
            })
            .and_then(|link| link["href"].as_str())
            .unwrap_or_default();
        Ok(CreatedSession {
            session_id: body["id"].as_str().unwrap_or_default().to_string(),
            session_url: approve_url.to_string(),
        })
    }

    /// Explicit second step after buyer approval.
    async fn capture(
        &self,
        id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        let token = self.access_token().await?;
        let mut req = self
            .client
            .post(format!("{}/v2/checkout/orders/{id}/capture", self.base_url))
            .bearer_auth(&token)
            .json(&json!({}));
        if let Some(key) = idempotency_key {
            req = req.header("PayPal-Request-Id", key);
        }
        let body = Self::check(req.send().await?).await?;

        let unit = &body["purchase_units"][0];
        let capture = &unit["payments"]["captures"][0];
        // Capture responses have been observed to omit custom_id; callers fall
        // back to the stored session id when correlation_id is None.
        let correlation_id = unit["custom_id"]
            .as_str()
            .or_else(|| capture["custom_id"].as_str())
            .map(str::to_string);
        Ok(PaymentResult {
            success: true,
            transaction_id: capture["id"].as_str().unwrap_or_default().to_string(),
            status: Self::map_status(body["status"].as_str().unwrap_or_default()),
            amount_minor: capture["amount"]["value"]
                .as_str()
                .and_then(decimal_to_minor),
            currency: capture["amount"]["currency_code"]
                .as_str()
                .map(str::to_string),
            correlation_id,
            error: None,
        })
    }

    async fn refund(
        &self,
        id: &str,
        amount_minor: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> Result<PaymentResult, PaymentError> {
        let token = self.access_token().await?;
        let body = match amount_minor {
            Some(amount) => json!({
                "amount": {"value": minor_to_decimal(amount), "currency_code": "USD"},
            }),
            None => json!({}),
        };
        let mut req = self
            .client
            .post(format!("{}/v2/payments/captures/{id}/refund", self.base_url))
            .bearer_auth(&token)
            .json(&body);
        if let Some(key) = idempotency_key {
            req = req.header("PayPal-Request-Id", key);
        }
        let refund = Self::check(req.send().await?).await?;
        let status = match refund["status"].as_str().unwrap_or_default() {
            "COMPLETED" => PaymentStatus::Refunded,
            "FAILED" => PaymentStatus::Failed,
            _ => PaymentStatus::Processing,
        };
        Ok(PaymentResult {
            success: true,
            transaction_id: refund["id"].as_str().unwrap_or_default().to_string(),
            status,
            amount_minor: None,
            currency: None,
            correlation_id: None,
            error: None,
        })
    }

    async fn get_status(&self, id: &str) -> Result<PaymentResult, PaymentError> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!("{}/v2/checkout/orders/{id}", self.base_url))
            .bearer_auth(&token)
            .send()
            .await?;
        let body = Self::check(resp).await?;
        let unit = &body["purchase_units"][0];
        Ok(PaymentResult {
            success: true,
            transaction_id: body["id"].as_str().unwrap_or_default().to_string(),
            status: Self::map_status(body["status"].as_str().unwrap_or_default()),
            amount_minor: unit["amount"]["value"].as_str().and_then(decimal_to_minor),
            currency: unit["amount"]["currency_code"].as_str().map(str::to_string),
            correlation_id: unit["custom_id"].as_str().map(str::to_string),
            error: None,
        })
    }

    /// Multi-header scheme: the transmission headers plus the raw body are
    /// forwarded to the provider's own verification endpoint; the secret is
    /// the configured webhook id.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: &str,
    ) -> Result<Value, PaymentError> {
        let header = |name: &str| -> String {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let event: Value =
            serde_json::from_slice(payload).map_err(|_| PaymentError::Security)?;
        let token = self.access_token().await?;
        let verify = json!({
            "auth_algo": header("PAYPAL-AUTH-ALGO"),
            "cert_url": header("PAYPAL-CERT-URL"),
            "transmission_id": header("PAYPAL-TRANSMISSION-ID"),
            "transmission_sig": header("PAYPAL-TRANSMISSION-SIG"),
            "transmission_time": header("PAYPAL-TRANSMISSION-TIME"),
            "webhook_id": secret,
            "webhook_event": event,
        });
        let resp = self
            .client
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.base_url
            ))
            .bearer_auth(&token)
            .json(&verify)
            .send()
            .await?;
        let body = Self::check(resp).await?;
        if body["verification_status"].as_str() == Some("SUCCESS") {
            Ok(event)
        } else {
            Err(PaymentError::Security)
        }
    }

    fn parse_webhook_event(&self, payload: &Value) -> Option<WebhookEvent> {
        let resource = &payload["resource"];
        match payload["event_type"].as_str()? {
            "PAYMENT.CAPTURE.COMPLETED" => Some(WebhookEvent::CaptureCompleted {
                invoice_id: resource["custom_id"]
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok()),
                session_id: resource["supplementary_data"]["related_ids"]["order_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                transaction_id: resource["id"].as_str().unwrap_or_default().to_string(),
                amount_minor: resource["amount"]["value"]
                    .as_str()
                    .and_then(decimal_to_minor)
                    .unwrap_or_default(),
                currency: resource["amount"]["currency_code"]
                    .as_str()
                    .unwrap_or("USD")
                    .to_string(),
            }),
            "PAYMENT.CAPTURE.REFUNDED" => Some(WebhookEvent::RefundCompleted {
                invoice_id: resource["custom_id"]
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok()),
                session_id: resource["supplementary_data"]["related_ids"]["order_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                refund_reference: resource["id"].as_str().unwrap_or_default().to_string(),
                amount_minor: resource["amount"]["value"]
                    .as_str()
                    .and_then(decimal_to_minor)
                    .unwrap_or_default(),
                currency: resource["amount"]["currency_code"]
                    .as_str()
                    .unwrap_or("USD")
                    .to_string(),
            }),
            "BILLING.SUBSCRIPTION.CANCELLED" => Some(WebhookEvent::SubscriptionCancelled {
                provider_subscription_id: resource["id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            }),
            "PAYMENT.SALE.DENIED" => Some(WebhookEvent::PaymentFailed {
                provider_subscription_id: resource["billing_agreement_id"]
                    .as_str()
                    .map(str::to_string),
                invoice_id: resource["custom_id"]
                    .as_str()
                    .and_then(|raw| Uuid::parse_str(raw).ok()),
                message: "payment denied".into(),
            }),
            _ => None,
        }
    }
}

pub struct PayPalPlugin;

impl ProviderPlugin for PayPalPlugin {
    fn name(&self) -> &'static str {
        "paypal"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn default_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("sandbox".into(), Value::Bool(true));
        config.insert("test_api_key".into(), Value::String(String::new()));
        config.insert("test_api_secret".into(), Value::String(String::new()));
        // The PayPal webhook "secret" is the webhook id registered with them.
        config.insert("test_webhook_secret".into(), Value::String(String::new()));
        config.insert("live_api_key".into(), Value::String(String::new()));
        config.insert("live_api_secret".into(), Value::String(String::new()));
        config.insert("live_webhook_secret".into(), Value::String(String::new()));
        config
    }

    fn build(&self, credentials: ProviderCredentials) -> Arc<dyn ProviderAdapter> {
        Arc::new(PayPalAdapter::new(credentials))
    }
}
