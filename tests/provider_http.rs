use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use uuid::Uuid;

use payhub::idempotency::IdempotencyGuard;
use payhub::providers::paypal::PayPalAdapter;
use payhub::providers::yookassa::YooKassaAdapter;
use payhub::providers::{
    IntentMetadata, PaymentStatus, ProviderAdapter, ProviderCredentials,
};

fn credentials() -> ProviderCredentials {
    ProviderCredentials {
        api_key: "key-1".into(),
        api_secret: "secret-1".into(),
        webhook_secret: "wh-1".into(),
        sandbox: true,
    }
}

fn metadata() -> IntentMetadata {
    IntentMetadata {
        invoice_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        success_url: "https://shop.test/payment/success".into(),
        cancel_url: "https://shop.test/payment/cancel".into(),
    }
}

#[tokio::test]
async fn yookassa_create_payment_sends_idempotence_key() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v3/payments")
                .header_exists("Idempotence-Key")
                .json_body_partial(r#"{"capture": true}"#);
            then.status(200).json_body(json!({
                "id": "pay_1",
                "status": "pending",
                "confirmation": {"confirmation_url": "https://yookassa.test/confirm/pay_1"},
            }));
        })
        .await;

    let adapter = YooKassaAdapter::with_base_url(credentials(), server.base_url());
    let session = adapter
        .create_payment_intent(2999, "RUB", &metadata(), Some("yookassa-session-1"))
        .await
        .unwrap();

    create.assert_hits_async(1).await;
    assert_eq!(session.session_id, "pay_1");
    assert_eq!(session.session_url, "https://yookassa.test/confirm/pay_1");
}

#[tokio::test]
async fn paypal_token_is_fetched_once_and_reused() {
    let server = MockServer::start_async().await;
    let token = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/oauth2/token");
            then.status(200)
                .json_body(json!({"access_token": "tok_1", "expires_in": 3600}));
        })
        .await;
    let order = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v2/checkout/orders/ord_1")
                .header("Authorization", "Bearer tok_1");
            then.status(200).json_body(json!({
                "id": "ord_1",
                "status": "COMPLETED",
                "purchase_units": [{
                    "amount": {"value": "29.99", "currency_code": "USD"},
                    "custom_id": "4b3ddbf5-6d4a-4b90-b35c-9e0e6ed47e2a",
                }],
            }));
        })
        .await;

    let adapter = PayPalAdapter::with_base_url(credentials(), server.base_url());
    for _ in 0..2 {
        let result = adapter.get_status("ord_1").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Completed);
        assert_eq!(result.amount_minor, Some(2999));
    }

    token.assert_hits_async(1).await;
    order.assert_hits_async(2).await;
}

#[tokio::test]
async fn paypal_webhook_verification_requires_gateway_success() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/oauth2/token");
            then.status(200)
                .json_body(json!({"access_token": "tok_1", "expires_in": 3600}));
        })
        .await;
    let verify = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/notifications/verify-webhook-signature")
                .json_body_partial(r#"{"webhook_id": "wh-1"}"#);
            then.status(200)
                .json_body(json!({"verification_status": "FAILURE"}));
        })
        .await;

    let adapter = PayPalAdapter::with_base_url(credentials(), server.base_url());
    let mut headers = axum::http::HeaderMap::new();
    headers.insert("PAYPAL-TRANSMISSION-ID", "tx-1".parse().unwrap());
    let err = adapter
        .verify_webhook(br#"{"event_type":"PAYMENT.CAPTURE.COMPLETED"}"#, &headers, "wh-1")
        .await
        .unwrap_err();

    verify.assert_hits_async(1).await;
    assert!(matches!(
        err,
        payhub::providers::PaymentError::Security
    ));
}

#[tokio::test]
async fn guarded_capture_retry_hits_the_gateway_once() {
    let server = MockServer::start_async().await;
    let capture = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v3/payments/pay_1/capture")
                .header("Idempotence-Key", "yookassa-capture-pay_1");
            then.status(200).json_body(json!({
                "id": "pay_1",
                "status": "succeeded",
                "amount": {"value": "29.99", "currency": "RUB"},
                "metadata": {},
            }));
        })
        .await;

    let adapter = YooKassaAdapter::with_base_url(credentials(), server.base_url());
    let guard = IdempotencyGuard::new(Duration::from_secs(60));
    let key = "yookassa-capture-pay_1";
    for _ in 0..2 {
        let result = guard
            .execute_payment(key, || async { adapter.capture("pay_1", Some(key)).await })
            .await
            .unwrap();
        assert_eq!(result.status, PaymentStatus::Completed);
        assert_eq!(result.transaction_id, "pay_1");
    }

    capture.assert_hits_async(1).await;
}
