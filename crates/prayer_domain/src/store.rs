use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::notifications::NotificationSettings;

pub const SETTINGS_KEY: &str = "notifications.settings";
pub const LAST_SCHEDULE_ATTEMPT_KEY: &str = "notifications.last_schedule_attempt";
/// Set by a background task to ask the foreground engine for a full reschedule.
pub const FORCE_RESCHEDULE_KEY: &str = "notifications.force_reschedule";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Durable string key-value store. Must survive a process restart.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// Whole map kept in one JSON file, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let payload = serde_json::to_string_pretty(values).map_err(|source| StoreError::Encode {
            key: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.write();
        values.insert(key.to_string(), value.to_string());
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.write();
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}

/// Stored settings, or defaults when absent or unreadable.
pub fn load_settings(store: &dyn KeyValueStore) -> NotificationSettings {
    read_settings(store).unwrap_or_default()
}

/// Stored settings; `None` when absent, unreadable or malformed.
pub fn read_settings(store: &dyn KeyValueStore) -> Option<NotificationSettings> {
    let raw = match store.get(SETTINGS_KEY) {
        Ok(raw) => raw?,
        Err(err) => {
            tracing::warn!(%err, "unable to read notification settings");
            return None;
        }
    };
    serde_json::from_str(&raw)
        .map_err(|err| tracing::warn!(%err, "discarding malformed notification settings"))
        .ok()
}

pub fn save_settings(
    store: &dyn KeyValueStore,
    settings: &NotificationSettings,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(settings).map_err(|source| StoreError::Encode {
        key: SETTINGS_KEY.to_string(),
        source,
    })?;
    store.set(SETTINGS_KEY, &raw)
}

pub fn load_timestamp(store: &dyn KeyValueStore, key: &str) -> Option<NaiveDateTime> {
    let raw = store.get(key).ok().flatten()?;
    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).ok()
}

pub fn save_timestamp(
    store: &dyn KeyValueStore,
    key: &str,
    value: NaiveDateTime,
) -> Result<(), StoreError> {
    store.set(key, &value.format(TIMESTAMP_FORMAT).to_string())
}

/// Reads and clears the cross-process reschedule flag.
pub fn take_force_flag(store: &dyn KeyValueStore) -> bool {
    match store.get(FORCE_RESCHEDULE_KEY) {
        Ok(Some(_)) => {
            if let Err(err) = store.remove(FORCE_RESCHEDULE_KEY) {
                tracing::warn!(%err, "unable to clear force reschedule flag");
            }
            true
        }
        Ok(None) => false,
        Err(err) => {
            tracing::warn!(%err, "unable to read force reschedule flag");
            false
        }
    }
}
