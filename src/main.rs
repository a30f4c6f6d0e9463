use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use payhub::config_store::JsonFileConfigStore;
use payhub::events::EventDispatcher;
use payhub::providers::builtin_plugins;
use payhub::registry::PluginRegistry;
use payhub::repos::{InMemoryInvoices, InMemorySubscriptions};
use payhub::routes::{api_routes, AppState};
use payhub::settlement::register_settlement_handlers;
use payhub::{config, config_store::ConfigStore, repos};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let store: Arc<dyn ConfigStore> =
        Arc::new(JsonFileConfigStore::new(config::PLUGINS_DIR.as_str()));
    let invoices: Arc<dyn repos::InvoiceRepository> = Arc::new(InMemoryInvoices::new());
    let subscriptions: Arc<dyn repos::SubscriptionRepository> =
        Arc::new(InMemorySubscriptions::new());

    let dispatcher = Arc::new(EventDispatcher::new());
    register_settlement_handlers(&dispatcher, invoices.clone(), subscriptions.clone());

    let registry = Arc::new(PluginRegistry::new(store.clone(), dispatcher.clone()));
    let discovered = registry.discover(builtin_plugins());
    tracing::info!(discovered, "provider plugins discovered");
    registry.load_persisted_state();

    let state = AppState::new(store, registry, invoices, subscriptions, dispatcher);
    let app = api_routes(state);

    let addr: SocketAddr = config::BIND_ADDR.parse()?;
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
