use crate::paths::AppPaths;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub keys: KeyDefaults,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AppConfigLayer {
    pub paths: Option<PathsConfigLayer>,
    pub keys: Option<KeyDefaultsLayer>,
    pub logging: Option<LoggingConfigLayer>,
    pub store: Option<StoreConfigLayer>,
}

impl AppConfigLayer {
    pub fn apply_to(self, cfg: &mut AppConfig) {
        if let Some(layer) = self.paths {
            cfg.paths.apply(layer);
        }
        if let Some(layer) = self.keys {
            cfg.keys.apply(layer);
        }
        if let Some(layer) = self.logging {
            cfg.logging.apply(layer);
        }
        if let Some(layer) = self.store {
            cfg.store.apply(layer);
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    pub ssh_dir: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PathsConfigLayer {
    pub ssh_dir: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

impl PathsConfig {
    fn apply(&mut self, layer: PathsConfigLayer) {
        if layer.ssh_dir.is_some() {
            self.ssh_dir = layer.ssh_dir;
        }
        if layer.ssh_config.is_some() {
            self.ssh_config = layer.ssh_config;
        }
        if layer.state_dir.is_some() {
            self.state_dir = layer.state_dir;
        }
        if layer.backup_dir.is_some() {
            self.backup_dir = layer.backup_dir;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyDefaults {
    pub rsa_bits: usize,
    pub ecdsa_curve: String,
}

impl Default for KeyDefaults {
    fn default() -> Self {
        Self {
            rsa_bits: 4096,
            ecdsa_curve: "p256".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct KeyDefaultsLayer {
    pub rsa_bits: Option<usize>,
    pub ecdsa_curve: Option<String>,
}

impl KeyDefaults {
    fn apply(&mut self, layer: KeyDefaultsLayer) {
        if let Some(v) = layer.rsa_bits {
            self.rsa_bits = v;
        }
        if let Some(v) = layer.ecdsa_curve {
            self.ecdsa_curve = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            stdout: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingConfigLayer {
    pub level: Option<String>,
    pub json: Option<bool>,
    pub stdout: Option<bool>,
}

impl LoggingConfig {
    fn apply(&mut self, layer: LoggingConfigLayer) {
        if let Some(v) = layer.level {
            self.level = v;
        }
        if let Some(v) = layer.json {
            self.json = v;
        }
        if let Some(v) = layer.stdout {
            self.stdout = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub encrypt_at_rest: bool,
    pub keyring_service: String,
    pub keyring_account: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            encrypt_at_rest: false,
            keyring_service: "keywright".to_string(),
            keyring_account: "store-master".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StoreConfigLayer {
    pub encrypt_at_rest: Option<bool>,
    pub keyring_service: Option<String>,
    pub keyring_account: Option<String>,
}

impl StoreConfig {
    fn apply(&mut self, layer: StoreConfigLayer) {
        if let Some(v) = layer.encrypt_at_rest {
            self.encrypt_at_rest = v;
        }
        if let Some(v) = layer.keyring_service {
            self.keyring_service = v;
        }
        if let Some(v) = layer.keyring_account {
            self.keyring_account = v;
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConfigManager {
    pub paths: AppPaths,
}

impl ConfigManager {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    pub fn load(&self, cwd: Option<&Path>, overrides: Option<AppConfigLayer>) -> Result<AppConfig> {
        let mut cfg = AppConfig::default();

        if self.paths.config_file.exists() {
            let layer = Self::load_layer(&self.paths.config_file)?;
            layer.apply_to(&mut cfg);
        }

        if let Some(dir) = cwd {
            let project_path = AppPaths::project_config_path(dir);
            if project_path.exists() {
                debug!(path = %project_path.display(), "applying project settings");
                let layer = Self::load_layer(&project_path)?;
                layer.apply_to(&mut cfg);
            }
        }

        if let Some(layer) = overrides {
            layer.apply_to(&mut cfg);
        }

        Ok(cfg)
    }

    pub fn load_layer(path: &Path) -> Result<AppConfigLayer, ConfigError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_default(&self) -> Result<()> {
        self.save_config(&AppConfig::default())
    }

    pub fn save_config(&self, cfg: &AppConfig) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(cfg).map_err(|e| anyhow::anyhow!(e))?;
        fs::write(&self.paths.config_file, content)?;
        Ok(())
    }
}
