use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

/// Persisted plugin state vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Enabled,
    Disabled,
}

/// The durable record of truth for one plugin, independent of any single
/// worker's in-memory descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfigEntry {
    pub plugin_name: String,
    pub status: PluginState,
    pub config: Map<String, Value>,
}

/// Shared source of truth for plugin status and provider credentials.
///
/// Worker processes do not share memory, so every externally-visible decision
/// reads this store fresh rather than trusting local descriptor state.
pub trait ConfigStore: Send + Sync {
    fn get_by_name(&self, name: &str) -> AppResult<Option<PluginConfigEntry>>;
    fn get_all(&self) -> AppResult<Vec<PluginConfigEntry>>;
    fn get_enabled(&self) -> AppResult<Vec<PluginConfigEntry>>;
    fn save(&self, name: &str, status: PluginState, config: Option<Map<String, Value>>)
        -> AppResult<()>;
    fn get_config(&self, name: &str) -> AppResult<Map<String, Value>>;
    fn save_config(&self, name: &str, config: Map<String, Value>) -> AppResult<()>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    plugins: BTreeMap<String, RegistryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryRecord {
    enabled: bool,
    version: String,
    #[serde(rename = "installedAt")]
    installed_at: String,
    source: String,
}

/// JSON-file backed store.
///
/// Two files under one directory:
///   - `plugins.json` — plugin registry (name -> {enabled, version, ...})
///   - `config.json`  — saved config values per plugin
///
/// Writes go to a temp file in the same directory and are renamed over the
/// target, so a reader never observes a partially written record and a crash
/// mid-write leaves the previous record intact.
pub struct JsonFileConfigStore {
    dir: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn plugins_path(&self) -> PathBuf {
        self.dir.join("plugins.json")
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    fn read_plugins(&self) -> BTreeMap<String, RegistryRecord> {
        read_json::<RegistryFile>(&self.plugins_path())
            .unwrap_or_default()
            .plugins
    }

    fn read_configs(&self) -> Map<String, Value> {
        read_json::<Map<String, Value>>(&self.config_path()).unwrap_or_default()
    }

    fn write_plugins(&self, plugins: BTreeMap<String, RegistryRecord>) -> AppResult<()> {
        write_json_atomic(&self.dir, &self.plugins_path(), &RegistryFile { plugins })
    }

    fn write_configs(&self, configs: &Map<String, Value>) -> AppResult<()> {
        write_json_atomic(&self.dir, &self.config_path(), configs)
    }

    fn entry_for(
        &self,
        name: &str,
        record: &RegistryRecord,
        configs: &Map<String, Value>,
    ) -> PluginConfigEntry {
        PluginConfigEntry {
            plugin_name: name.to_string(),
            status: if record.enabled {
                PluginState::Enabled
            } else {
                PluginState::Disabled
            },
            config: configs
                .get(name)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn write_json_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> AppResult<()> {
    fs::create_dir_all(dir).map_err(|e| AppError::Message(format!("config store io: {e}")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| AppError::Message(format!("config store io: {e}")))?;
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| AppError::Message(format!("config store encode: {e}")))?;
    tmp.write_all(&body)
        .map_err(|e| AppError::Message(format!("config store io: {e}")))?;
    tmp.persist(path)
        .map_err(|e| AppError::Message(format!("config store rename: {e}")))?;
    Ok(())
}

impl ConfigStore for JsonFileConfigStore {
    fn get_by_name(&self, name: &str) -> AppResult<Option<PluginConfigEntry>> {
        let plugins = self.read_plugins();
        let Some(record) = plugins.get(name) else {
            return Ok(None);
        };
        let configs = self.read_configs();
        Ok(Some(self.entry_for(name, record, &configs)))
    }

    fn get_all(&self) -> AppResult<Vec<PluginConfigEntry>> {
        let plugins = self.read_plugins();
        let configs = self.read_configs();
        Ok(plugins
            .iter()
            .map(|(name, record)| self.entry_for(name, record, &configs))
            .collect())
    }

    fn get_enabled(&self) -> AppResult<Vec<PluginConfigEntry>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|entry| entry.status == PluginState::Enabled)
            .collect())
    }

    fn save(
        &self,
        name: &str,
        status: PluginState,
        config: Option<Map<String, Value>>,
    ) -> AppResult<()> {
        let mut plugins = self.read_plugins();
        let record = plugins.entry(name.to_string()).or_insert_with(|| RegistryRecord {
            enabled: false,
            version: "1.0.0".into(),
            installed_at: Utc::now().to_rfc3339(),
            source: "builtin".into(),
        });
        record.enabled = status == PluginState::Enabled;
        self.write_plugins(plugins)?;

        if let Some(config) = config {
            self.save_config(name, config)?;
        }
        Ok(())
    }

    fn get_config(&self, name: &str) -> AppResult<Map<String, Value>> {
        Ok(self
            .read_configs()
            .get(name)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }

    fn save_config(&self, name: &str, config: Map<String, Value>) -> AppResult<()> {
        let mut configs = self.read_configs();
        configs.insert(name.to_string(), Value::Object(config));
        self.write_configs(&configs)
    }
}
