use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ClientConfig;
use crate::{Error, Result};

/// Persistence of the configured client list.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Vec<ClientConfig>>;

    fn save(&self, clients: &[ClientConfig]) -> Result<()>;
}

/// Keeps the client list in a JSON file. The file is replaced atomically
/// on every save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn context(&self, e: impl std::fmt::Display) -> Error {
        Error::Settings(format!("{}: {e}", self.path.display()))
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Vec<ClientConfig>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.context(e)),
        };
        let clients: Vec<ClientConfig> = serde_json::from_str(&text).map_err(|e| self.context(e))?;
        debug!(path = %self.path.display(), clients = clients.len(), "client settings loaded");
        Ok(clients)
    }

    fn save(&self, clients: &[ClientConfig]) -> Result<()> {
        let json = serde_json::to_string_pretty(clients)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| self.context(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.context(e))?;
        debug!(path = %self.path.display(), clients = clients.len(), "client settings saved");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    clients: Mutex<Vec<ClientConfig>>,
}

impl MemoryStore {
    pub fn new(clients: Vec<ClientConfig>) -> Self {
        Self {
            clients: Mutex::new(clients),
        }
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Vec<ClientConfig>> {
        Ok(self.clients.lock().clone())
    }

    fn save(&self, clients: &[ClientConfig]) -> Result<()> {
        *self.clients.lock() = clients.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientCommon, DvbcamConfig, NewcamdConfig};

    fn clients() -> Vec<ClientConfig> {
        vec![
            ClientConfig::Newcamd(NewcamdConfig {
                common: ClientCommon {
                    name: "nc".to_string(),
                    ..ClientCommon::default()
                },
                port: 15000,
                ..NewcamdConfig::default()
            }),
            ClientConfig::Dvbcam(DvbcamConfig {
                common: ClientCommon {
                    name: "ci".to_string(),
                    enabled: false,
                    comment: "living room".to_string(),
                },
                slot: 1,
                caids: vec![0x0b00],
            }),
        ]
    }

    #[test]
    fn test_json_store_keeps_order_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("clients.json"));
        assert!(store.load().unwrap().is_empty());

        store.save(&clients()).unwrap();
        assert_eq!(store.load().unwrap(), clients());
        assert!(!dir.path().join("clients.tmp").exists());

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains(r#""type": "newcamd""#));
    }

    #[test]
    fn test_json_store_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        fs::write(&path, "{ not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::Settings(msg) if msg.contains("clients.json")));

        let missing_dir = JsonFileStore::new(dir.path().join("gone").join("clients.json"));
        assert!(missing_dir.save(&clients()).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::default();
        assert!(store.load().unwrap().is_empty());
        store.save(&clients()).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }
}
