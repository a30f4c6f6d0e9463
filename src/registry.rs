use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config_store::{ConfigStore, PluginState};
use crate::error::{AppError, AppResult};
use crate::events::{CanonicalEvent, EventDispatcher};
use crate::providers::{ProviderAdapter, ProviderCredentials, ProviderPlugin};

/// Lifecycle state machine: Discovered -> Initialized -> Enabled <-> Disabled.
/// Initialized is a strict prerequisite for Enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Discovered,
    Initialized,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub status: PluginStatus,
}

struct PluginSlot {
    descriptor: PluginDescriptor,
    config: Map<String, Value>,
    plugin: Arc<dyn ProviderPlugin>,
}

/// In-memory plugin lifecycle view, synchronized from the ConfigStore on load
/// and per admin action. The store stays the durable record of truth; this
/// registry only gates which adapters are reachable in this worker.
pub struct PluginRegistry {
    store: Arc<dyn ConfigStore>,
    dispatcher: Arc<EventDispatcher>,
    plugins: RwLock<HashMap<String, PluginSlot>>,
}

impl PluginRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, plugin: Arc<dyn ProviderPlugin>) -> AppResult<()> {
        let name = plugin.name().to_string();
        let mut plugins = self.plugins.write().expect("registry lock poisoned");
        if plugins.contains_key(&name) {
            return Err(AppError::Validation(format!(
                "plugin '{name}' already registered"
            )));
        }
        let descriptor = PluginDescriptor {
            name: name.clone(),
            version: plugin.version().to_string(),
            dependencies: plugin.dependencies(),
            status: PluginStatus::Discovered,
        };
        plugins.insert(
            name,
            PluginSlot {
                descriptor,
                config: Map::new(),
                plugin,
            },
        );
        Ok(())
    }

    /// Walks an explicit factory list, registering and initializing each entry.
    /// Already-registered names are skipped; a failure in one entry is logged
    /// and the scan continues. Returns the count of newly discovered plugins.
    pub fn discover(&self, factories: Vec<Arc<dyn ProviderPlugin>>) -> usize {
        let mut count = 0;
        for factory in factories {
            let name = factory.name().to_string();
            if self.contains(&name) {
                continue;
            }
            if let Err(err) = self.register(factory) {
                warn!(plugin = %name, %err, "failed to register plugin");
                continue;
            }
            if let Err(err) = self.initialize(&name, None) {
                warn!(plugin = %name, %err, "failed to initialize plugin");
                continue;
            }
            info!(plugin = %name, "discovered plugin");
            count += 1;
        }
        count
    }

    /// Merges the factory default config with overrides. Discovered -> Initialized.
    pub fn initialize(&self, name: &str, overrides: Option<Map<String, Value>>) -> AppResult<()> {
        let mut plugins = self.plugins.write().expect("registry lock poisoned");
        let slot = plugins.get_mut(name).ok_or(AppError::NotFound)?;
        if slot.descriptor.status != PluginStatus::Discovered {
            return Err(AppError::Validation(format!(
                "plugin '{name}' is already initialized"
            )));
        }
        let mut config = slot.plugin.default_config();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                config.insert(key, value);
            }
        }
        slot.config = config;
        slot.descriptor.status = PluginStatus::Initialized;
        Ok(())
    }

    /// Fails unless every declared dependency is Enabled. Persists the new
    /// state and emits `plugin.enabled`.
    pub fn enable(&self, name: &str) -> AppResult<()> {
        let config = {
            let mut plugins = self.plugins.write().expect("registry lock poisoned");
            let deps = plugins
                .get(name)
                .ok_or(AppError::NotFound)?
                .descriptor
                .dependencies
                .clone();
            for dep in &deps {
                let enabled = plugins
                    .get(dep)
                    .map(|slot| slot.descriptor.status == PluginStatus::Enabled)
                    .unwrap_or(false);
                if !enabled {
                    return Err(AppError::Dependency(format!(
                        "dependency '{dep}' of plugin '{name}' is not enabled"
                    )));
                }
            }
            let slot = plugins.get_mut(name).ok_or(AppError::NotFound)?;
            match slot.descriptor.status {
                PluginStatus::Initialized | PluginStatus::Disabled => {}
                PluginStatus::Enabled => return Ok(()),
                PluginStatus::Discovered => {
                    return Err(AppError::Validation(format!(
                        "plugin '{name}' is not initialized"
                    )))
                }
            }
            slot.descriptor.status = PluginStatus::Enabled;
            slot.config.clone()
        };

        if let Err(err) = self.store.save(name, PluginState::Enabled, Some(config)) {
            warn!(plugin = %name, %err, "failed to persist enable state");
        }
        self.dispatcher.emit(&CanonicalEvent::PluginEnabled {
            plugin_name: name.to_string(),
        });
        Ok(())
    }

    /// Fails if any Enabled plugin declares this one as a dependency.
    pub fn disable(&self, name: &str) -> AppResult<()> {
        let config = {
            let mut plugins = self.plugins.write().expect("registry lock poisoned");
            if !plugins.contains_key(name) {
                return Err(AppError::NotFound);
            }
            let dependents: Vec<String> = plugins
                .values()
                .filter(|slot| {
                    slot.descriptor.status == PluginStatus::Enabled
                        && slot.descriptor.dependencies.iter().any(|d| d == name)
                })
                .map(|slot| slot.descriptor.name.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(AppError::Dependency(format!(
                    "cannot disable '{name}': enabled plugins {dependents:?} depend on it"
                )));
            }
            let slot = plugins.get_mut(name).ok_or(AppError::NotFound)?;
            slot.descriptor.status = PluginStatus::Disabled;
            slot.config.clone()
        };

        if let Err(err) = self.store.save(name, PluginState::Disabled, Some(config)) {
            warn!(plugin = %name, %err, "failed to persist disable state");
        }
        self.dispatcher.emit(&CanonicalEvent::PluginDisabled {
            plugin_name: name.to_string(),
        });
        Ok(())
    }

    /// Re-enables every Initialized descriptor the store reports enabled.
    /// Unknown persisted names are logged and skipped, never fatal.
    pub fn load_persisted_state(&self) {
        let entries = match self.store.get_enabled() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "failed to load persisted plugin state");
                return;
            }
        };
        let mut plugins = self.plugins.write().expect("registry lock poisoned");
        for entry in entries {
            let Some(slot) = plugins.get_mut(&entry.plugin_name) else {
                warn!(plugin = %entry.plugin_name, "persisted plugin not found in registry, skipping");
                continue;
            };
            if slot.descriptor.status == PluginStatus::Initialized {
                slot.descriptor.status = PluginStatus::Enabled;
                if !entry.config.is_empty() {
                    slot.config = entry.config;
                }
                info!(plugin = %entry.plugin_name, "restored enabled state");
            }
        }
    }

    /// The single point where a provider name becomes an adapter handle.
    ///
    /// Enablement and credentials are read fresh from the ConfigStore — the
    /// in-memory descriptor alone never authorizes an externally-visible call,
    /// and credentials are resolved per call, never cached.
    pub fn resolve_adapter(&self, name: &str) -> AppResult<Arc<dyn ProviderAdapter>> {
        let credentials = self.resolve_credentials(name)?;
        let plugins = self.plugins.read().expect("registry lock poisoned");
        let slot = plugins.get(name).ok_or(AppError::NotFound)?;
        Ok(slot.plugin.build(credentials))
    }

    pub fn resolve_credentials(&self, name: &str) -> AppResult<ProviderCredentials> {
        let entry = self.store.get_by_name(name)?;
        let enabled = entry
            .map(|e| e.status == PluginState::Enabled)
            .unwrap_or(false);
        if !enabled {
            return Err(AppError::NotFound);
        }
        let config = self.store.get_config(name)?;
        Ok(ProviderCredentials::from_config(&config))
    }

    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.plugins
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .map(|slot| slot.descriptor.clone())
    }

    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<PluginDescriptor> = self
            .plugins
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|slot| slot.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn config_of(&self, name: &str) -> Option<Map<String, Value>> {
        self.plugins
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .map(|slot| slot.config.clone())
    }

    fn contains(&self, name: &str) -> bool {
        self.plugins
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }
}
