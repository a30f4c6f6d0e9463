pub mod admin;
pub mod config;
pub mod config_store;
pub mod error;
pub mod events;
pub mod extractor;
pub mod idempotency;
pub mod payments;
pub mod providers;
pub mod registry;
pub mod repos;
pub mod routes;
pub mod settlement;
pub mod webhooks;

pub use config_store::{ConfigStore, JsonFileConfigStore, PluginState};
pub use error::{AppError, AppResult};
pub use events::{CanonicalEvent, EventDispatcher};
pub use registry::PluginRegistry;
pub use routes::{api_routes, AppState};
pub use settlement::{register_settlement_handlers, Reconciler};
