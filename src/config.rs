// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Current config file version. Increment when making breaking changes.
const CONFIG_VERSION: u32 = 1;

/// Default HTTPS remote-control port.
pub const DEFAULT_PORT: u16 = 8112;

/// Default bind host; resolved to the loopback interface.
pub const DEFAULT_HOST: &str = "localhost";

/// Secret-store key holding the generated keystore password.
pub const KEYSTORE_PASSWORD_KEY: &str = "remotecontrol.https.keystore.password";

/// Secret-store key holding the generated key-entry password.
pub const KEYENTRY_PASSWORD_KEY: &str = "remotecontrol.https.keyentry.password";

/// Environment variable overriding the data directory.
pub const ROOT_ENV: &str = "REMOTE_TLS_ROOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config file version for future migration support
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub https: HttpsConfig,
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

/// Settings for the loopback HTTPS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host the listener binds to. Keep this on loopback.
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            https: HttpsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.config_version > CONFIG_VERSION {
            tracing::warn!(
                found = self.config_version,
                supported = CONFIG_VERSION,
                "config.toml is newer than this build; some settings may be ignored"
            );
        }

        if self.https.port == 0 {
            return Err(Error::Config("https.port must be between 1 and 65535".into()));
        }

        if self.https.host.trim().is_empty() {
            return Err(Error::Config("https.host cannot be empty".into()));
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
    pub config: PathBuf,
    pub preferences: PathBuf,
    pub keystore: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        Ok(Self::from_base(Self::base_dir()?))
    }

    pub fn from_base(base: PathBuf) -> Self {
        Self {
            config: base.join("config.toml"),
            preferences: base.join("preferences.toml"),
            keystore: base.join("remote-tls.keystore"),
            base,
        }
    }

    fn base_dir() -> Result<PathBuf> {
        if let Ok(custom_root) = std::env::var(ROOT_ENV) {
            let path = PathBuf::from(&custom_root);

            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "{} must be an absolute path, got: {}",
                    ROOT_ENV, custom_root
                )));
            }

            return Ok(path);
        }

        if let Some(proj_dirs) = ProjectDirs::from("", "", "remote-tls") {
            Ok(proj_dirs.data_dir().to_path_buf())
        } else if let Some(base_dirs) = BaseDirs::new() {
            #[cfg(windows)]
            {
                Ok(base_dirs.data_local_dir().join("remote-tls"))
            }
            #[cfg(not(windows))]
            {
                Ok(base_dirs.home_dir().join(".remote-tls"))
            }
        } else {
            Err(Error::Config(format!(
                "Could not determine a data directory. Set {} to an absolute path.",
                ROOT_ENV
            )))
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        crate::fs::ensure_dir(&self.base)
    }

    pub fn keystore_exists(&self) -> bool {
        self.keystore.exists()
    }
}

/// String key/value storage for generated secrets.
///
/// Values are only ever written by provisioning; later runs read them back.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Secret store persisted as a flat TOML table with owner-only permissions.
pub struct FileSecretStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSecretStore {
    pub fn open(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            toml::from_str(&content).map_err(|e| {
                Error::SecretStore(format!("{} is not a valid table: {}", path.display(), e))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| Error::SecretStore("lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::SecretStore("lock poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());

        let content = toml::to_string(&*values).map_err(|e| Error::SecretStore(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            crate::fs::ensure_dir(parent)?;
        }
        crate::fs::atomic_write_secret(&self.path, content.as_bytes())
    }
}

impl std::fmt::Debug for FileSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSecretStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// In-process secret store, for embedding and tests.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| Error::SecretStore("lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| Error::SecretStore("lock poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.https.enabled);
        assert_eq!(config.https.port, 8112);
        assert_eq!(config.https.host, "localhost");
    }

    #[test]
    fn test_config_load_missing_file() {
        let path = PathBuf::from("/nonexistent/config.toml");
        let config =
            Config::load(&path).expect("Config should load with defaults for missing file");
        assert_eq!(config.https.port, DEFAULT_PORT);
    }

    #[test]
    fn test_config_load_partial() {
        let mut file = NamedTempFile::new().expect("temp file should be created");
        writeln!(file, "[https]").unwrap();
        writeln!(file, "port = 9443").unwrap();

        let config = Config::load(file.path()).expect("Config should load with partial values");
        assert_eq!(config.https.port, 9443);
        assert!(config.https.enabled);
        assert_eq!(config.https.host, DEFAULT_HOST);
    }

    #[test]
    fn test_config_rejects_port_zero() {
        let mut file = NamedTempFile::new().expect("temp file should be created");
        writeln!(file, "[https]").unwrap();
        writeln!(file, "port = 0").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let file = NamedTempFile::new().expect("temp file should be created");
        let mut config = Config::default();
        config.https.enabled = false;
        config.https.host = "127.0.0.1".into();

        config.save(file.path()).expect("Config should save");
        let loaded = Config::load(file.path()).expect("Config should load after save");

        assert!(!loaded.https.enabled);
        assert_eq!(loaded.https.host, "127.0.0.1");
        assert_eq!(loaded.config_version, CONFIG_VERSION);
    }

    #[test]
    fn test_paths_from_base() {
        let paths = Paths::from_base(PathBuf::from("/data/remote-tls"));
        assert_eq!(paths.keystore, PathBuf::from("/data/remote-tls/remote-tls.keystore"));
        assert_eq!(paths.preferences, PathBuf::from("/data/remote-tls/preferences.toml"));
        assert_eq!(paths.config, PathBuf::from("/data/remote-tls/config.toml"));
    }

    #[test]
    fn test_file_secret_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("preferences.toml");

        let store = FileSecretStore::open(&path).unwrap();
        assert_eq!(store.get(KEYSTORE_PASSWORD_KEY).unwrap(), None);
        store.put(KEYSTORE_PASSWORD_KEY, "abc").unwrap();
        store.put(KEYENTRY_PASSWORD_KEY, "def").unwrap();

        let reopened = FileSecretStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(KEYSTORE_PASSWORD_KEY).unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(
            reopened.get(KEYENTRY_PASSWORD_KEY).unwrap().as_deref(),
            Some("def")
        );
    }

    #[test]
    fn test_file_secret_store_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        assert!(matches!(
            FileSecretStore::open(file.path()),
            Err(Error::SecretStore(_))
        ));
    }

    #[test]
    fn test_memory_secret_store() {
        let store = MemorySecretStore::new();
        store.put("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("missing").unwrap(), None);
    }
}
