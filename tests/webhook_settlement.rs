use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

use payhub::config_store::{ConfigStore, JsonFileConfigStore};
use payhub::events::EventDispatcher;
use payhub::providers::{builtin_plugins, sign_hmac_sha256_hex};
use payhub::registry::PluginRegistry;
use payhub::repos::{
    InMemoryInvoices, InMemorySubscriptions, Invoice, InvoiceRepository, InvoiceStatus,
    SubscriptionRepository,
};
use payhub::routes::{api_routes, AppState};
use payhub::settlement::register_settlement_handlers;

const WEBHOOK_SECRET: &str = "whsec_test";

struct Harness {
    app: Router,
    invoices: Arc<dyn InvoiceRepository>,
    _dir: tempfile::TempDir,
}

fn harness(enable_stripe: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ConfigStore> = Arc::new(JsonFileConfigStore::new(dir.path()));
    let invoices: Arc<dyn InvoiceRepository> = Arc::new(InMemoryInvoices::new());
    let subscriptions: Arc<dyn SubscriptionRepository> = Arc::new(InMemorySubscriptions::new());

    let dispatcher = Arc::new(EventDispatcher::new());
    register_settlement_handlers(&dispatcher, invoices.clone(), subscriptions.clone());

    let registry = Arc::new(PluginRegistry::new(store.clone(), dispatcher.clone()));
    registry.discover(builtin_plugins());
    if enable_stripe {
        registry.enable("stripe").unwrap();
        let config = json!({
            "sandbox": true,
            "test_api_key": "sk_test_1",
            "test_webhook_secret": WEBHOOK_SECRET,
        });
        store
            .save_config("stripe", config.as_object().unwrap().clone())
            .unwrap();
    }

    let state = AppState::new(
        store,
        registry,
        invoices.clone(),
        subscriptions,
        dispatcher,
    );
    Harness {
        app: api_routes(state),
        invoices,
        _dir: dir,
    }
}

fn pending_invoice(invoices: &Arc<dyn InvoiceRepository>, session_id: &str) -> Invoice {
    let mut invoice = Invoice::pending(Uuid::new_v4(), 2999, "USD");
    invoice.provider = Some("stripe".into());
    invoice.provider_session_id = Some(session_id.into());
    invoices.save(invoice.clone());
    invoice
}

fn signed_request(body: &str) -> Request<Body> {
    let timestamp = "1724600000";
    let signature =
        sign_hmac_sha256_hex(WEBHOOK_SECRET, format!("{timestamp}.{body}").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/api/plugins/stripe/webhook")
        .header("Stripe-Signature", format!("t={timestamp},v1={signature}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn checkout_completed_body(invoice_id: Option<Uuid>, session_id: &str) -> String {
    let metadata = match invoice_id {
        Some(id) => json!({"invoice_id": id.to_string()}),
        None => json!({}),
    };
    json!({
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": session_id,
            "payment_intent": "pi_1",
            "amount_total": 2999,
            "currency": "usd",
            "metadata": metadata,
        }},
    })
    .to_string()
}

#[tokio::test]
async fn duplicate_webhook_delivery_settles_exactly_once() {
    let h = harness(true);
    let invoice = pending_invoice(&h.invoices, "cs_1");
    let body = checkout_completed_body(Some(invoice.id), "cs_1");

    let first = h.app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let settled = h.invoices.find_by_id(invoice.id).unwrap();
    assert_eq!(settled.status, InvoiceStatus::Paid);
    assert_eq!(settled.payment_ref.as_deref(), Some("pi_1"));
    let paid_at = settled.paid_at.unwrap();

    // Gateways redeliver; the second delivery must be a 200 no-op.
    let second = h.app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let after = h.invoices.find_by_id(invoice.id).unwrap();
    assert_eq!(after.status, InvoiceStatus::Paid);
    assert_eq!(after.paid_at.unwrap(), paid_at);
}

#[tokio::test]
async fn refund_webhook_without_metadata_correlates_via_payment_reference() {
    let h = harness(true);
    let mut invoice = pending_invoice(&h.invoices, "cs_1");
    invoice.status = InvoiceStatus::Paid;
    invoice.payment_ref = Some("pi_1".into());
    let invoice_id = invoice.id;
    h.invoices.save(invoice);

    // Charges never inherit session metadata; the payment intent is the only
    // handle the refund notification carries.
    let body = json!({
        "type": "charge.refunded",
        "data": {"object": {
            "id": "ch_1",
            "payment_intent": "pi_1",
            "amount_refunded": 2999,
            "currency": "usd",
            "metadata": {},
        }},
    })
    .to_string();

    let response = h.app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let refunded = h.invoices.find_by_id(invoice_id).unwrap();
    assert_eq!(refunded.status, InvoiceStatus::Refunded);
    assert_eq!(refunded.payment_ref.as_deref(), Some("ch_1"));
}

#[tokio::test]
async fn webhook_without_invoice_metadata_falls_back_to_session_id() {
    let h = harness(true);
    let invoice = pending_invoice(&h.invoices, "cs_fallback");
    let body = checkout_completed_body(None, "cs_fallback");

    let response = h.app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let settled = h.invoices.find_by_id(invoice.id).unwrap();
    assert_eq!(settled.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn tampered_signature_is_rejected_and_nothing_settles() {
    let h = harness(true);
    let invoice = pending_invoice(&h.invoices, "cs_1");
    let body = checkout_completed_body(Some(invoice.id), "cs_1");

    let request = Request::builder()
        .method("POST")
        .uri("/api/plugins/stripe/webhook")
        .header("Stripe-Signature", "t=1724600000,v1=deadbeef")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let untouched = h.invoices.find_by_id(invoice.id).unwrap();
    assert_eq!(untouched.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn unreconcilable_webhook_still_returns_ok() {
    let h = harness(true);
    let body = checkout_completed_body(None, "cs_unknown");

    let response = h.app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_for_disabled_provider_is_not_found() {
    let h = harness(false);
    let body = checkout_completed_body(None, "cs_1");

    let response = h.app.clone().oneshot(signed_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
