use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};

use crate::config_store::ConfigStore;
use crate::events::EventDispatcher;
use crate::idempotency::IdempotencyGuard;
use crate::registry::PluginRegistry;
use crate::repos::{InvoiceRepository, SubscriptionRepository};
use crate::settlement::Reconciler;
use crate::{admin, payments, webhooks};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConfigStore>,
    pub registry: Arc<PluginRegistry>,
    pub invoices: Arc<dyn InvoiceRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub dispatcher: Arc<EventDispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub idempotency: Arc<IdempotencyGuard>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: Arc<PluginRegistry>,
        invoices: Arc<dyn InvoiceRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            invoices.clone(),
            subscriptions.clone(),
            dispatcher.clone(),
        ));
        let idempotency = Arc::new(IdempotencyGuard::new(Duration::from_secs(
            *crate::config::IDEMPOTENCY_TTL_SECS,
        )));
        Self {
            store,
            registry,
            invoices,
            subscriptions,
            dispatcher,
            reconciler,
            idempotency,
        }
    }
}

pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/plugins/:provider/create-session",
            post(payments::create_session),
        )
        .route(
            "/api/plugins/:provider/capture",
            post(payments::capture_order),
        )
        .route(
            "/api/plugins/:provider/webhook",
            post(webhooks::provider_webhook),
        )
        .route(
            "/api/plugins/:provider/session-status/:session_id",
            get(payments::session_status),
        )
        .route("/api/admin/plugins", get(admin::list_plugins))
        .route(
            "/api/admin/plugins/:name/enable",
            post(admin::enable_plugin),
        )
        .route(
            "/api/admin/plugins/:name/disable",
            post(admin::disable_plugin),
        )
        .route(
            "/api/admin/plugins/:name/config",
            get(admin::get_plugin_config).put(admin::put_plugin_config),
        )
        .layer(Extension(state))
}
