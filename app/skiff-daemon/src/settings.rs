//! File-backed settings store.
//!
//! A flat JSON map of recognized keys under the data directory. Unknown keys
//! are rejected rather than stored, so typos surface immediately.

use skiff_core::config::{BRIDGED_INTERFACE_KEY, MOUNTS_KEY, PASSPHRASE_KEY};
use skiff_core::error::{CoreError, Result};
use skiff_core::hypervisor::SettingsStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

const SETTINGS_FILE_NAME: &str = "settings.json";

fn default_values() -> HashMap<String, String> {
    HashMap::from([
        (PASSPHRASE_KEY.to_string(), String::new()),
        (MOUNTS_KEY.to_string(), "true".to_string()),
        (BRIDGED_INTERFACE_KEY.to_string(), String::new()),
    ])
}

/// Settings persisted as JSON in the data directory.
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileSettingsStore {
    /// Opens (or initializes) the settings file under `data_dir`.
    pub fn open(data_dir: &std::path::Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE_NAME);
        let mut values = default_values();

        if let Ok(content) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<HashMap<String, String>>(&content) {
                Ok(stored) => {
                    for (key, value) in stored {
                        // Keys dropped from the recognized set are ignored.
                        if values.contains_key(&key) {
                            values.insert(key, value);
                        }
                    }
                }
                Err(e) => tracing::warn!("Discarding unparseable settings file: {}", e),
            }
        }

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| CoreError::internal(format!("failed to serialize settings: {e}")))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Result<String> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::UnrecognizedSetting(key.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !values.contains_key(key) {
            return Err(CoreError::UnrecognizedSetting(key.to_string()));
        }

        if key == MOUNTS_KEY && value != "true" && value != "false" {
            return Err(CoreError::InvalidSetting {
                key: key.to_string(),
                val: value.to_string(),
                reason: "expected 'true' or 'false'".to_string(),
            });
        }

        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_and_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FileSettingsStore::open(temp.path());

        assert_eq!(store.get(MOUNTS_KEY).unwrap(), "true");
        assert!(store.get(PASSPHRASE_KEY).unwrap().is_empty());

        store.set(MOUNTS_KEY, "false").unwrap();

        // A fresh store over the same directory sees the write.
        let reopened = FileSettingsStore::open(temp.path());
        assert_eq!(reopened.get(MOUNTS_KEY).unwrap(), "false");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let temp = TempDir::new().unwrap();
        let store = FileSettingsStore::open(temp.path());

        assert!(store.get("bogus.key").is_err());
        assert!(store.set("bogus.key", "x").is_err());
    }

    #[test]
    fn test_mounts_value_validated() {
        let temp = TempDir::new().unwrap();
        let store = FileSettingsStore::open(temp.path());
        assert!(store.set(MOUNTS_KEY, "maybe").is_err());
    }
}
