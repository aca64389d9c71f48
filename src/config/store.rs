use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::ConfigData;
use crate::tools;
use crate::{Error, Result};

const CONFIG_VERSION: u32 = 1;
const LOCK_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize, Deserialize)]
struct ConfigFile {
    version: u32,
    #[serde(flatten)]
    data: ConfigData,
}

/// File-backed configuration store with atomic replace and lost-update
/// detection.
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> ConfigStore {
        let path = path.into();
        let mut lock_path = path.clone();
        lock_path.set_extension("lck");
        ConfigStore { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration and its content digest. A missing file is an
    /// empty configuration, not an error.
    pub fn load(&self) -> Result<(ConfigData, String)> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
                let empty = ConfigData::default();
                return Ok((empty, tools::content_digest(b"")));
            }
            Err(err) => return Err(err.into()),
        };
        let file: ConfigFile = serde_json::from_slice(&raw)
            .map_err(|err| Error::corrupt(format!("bad config file {:?}: {}", self.path, err)))?;
        if file.version != CONFIG_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported config version {} in {:?}",
                file.version, self.path
            )));
        }
        Ok((file.data, tools::content_digest(&raw)))
    }

    /// Save the configuration. When `expected_digest` is given and the file
    /// on disk no longer matches it, the save is refused so the caller can
    /// reload and retry instead of clobbering someone else's update.
    pub fn save(&self, data: &ConfigData, expected_digest: Option<&str>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _flock = tools::lock_file(&self.lock_path, LOCK_TIMEOUT_SECS)?;

        if let Some(expected) = expected_digest {
            let (_, current) = self.load()?;
            if current != expected {
                return Err(Error::precondition(
                    "configuration changed since it was loaded",
                ));
            }
        }

        let file = ConfigFile {
            version: CONFIG_VERSION,
            data: data.clone(),
        };
        let raw = serde_json::to_vec_pretty(&file)
            .map_err(|err| Error::internal(format!("encode config: {}", err)))?;
        tools::replace_file(&self.path, &raw)?;
        debug!("saved configuration to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, VaultConfig, VaultType};

    #[test]
    fn missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("logkeep.json"));
        let (data, _) = store.load().unwrap();
        assert!(data.vaults.is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("logkeep.json"));

        let mut data = ConfigData::default();
        let vault = VaultConfig::new("audit", VaultType::File).param("path", "/tmp/audit");
        let filter = FilterConfig::new("errors", "error OR fatal");
        data.vaults.insert(vault.id, vault.clone());
        data.filters.insert(filter.id, filter.clone());

        store.save(&data, None).unwrap();
        let (loaded, _) = store.load().unwrap();
        assert_eq!(loaded, data);
        assert_eq!(loaded.vault_by_name("audit"), Some(&vault));
    }

    #[test]
    fn digest_detects_lost_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("logkeep.json"));

        let (mut data, digest) = store.load().unwrap();
        let vault = VaultConfig::new("a", VaultType::Memory);
        data.vaults.insert(vault.id, vault);
        store.save(&data, Some(&digest)).unwrap();

        // a second writer holding the stale digest must be refused
        let vault2 = VaultConfig::new("b", VaultType::Memory);
        let mut stale = ConfigData::default();
        stale.vaults.insert(vault2.id, vault2);
        assert!(matches!(
            store.save(&stale, Some(&digest)),
            Err(Error::FailedPrecondition(_))
        ));

        // reload and retry succeeds
        let (_, fresh) = store.load().unwrap();
        assert!(store.save(&stale, Some(&fresh)).is_ok());
    }
}
