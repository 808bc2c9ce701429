use crate::documents::{
    ConfigDocument, ExpirationRecord, ProviderConfig, RepoLink, UsageDocument, UsageRecord,
};
use crate::error::CoreError;
use crate::fsio::{atomic_write, ensure_private_dir};
use crate::permissions::PermissionGuard;
use chrono::{DateTime, Utc};
use keywright_keychain::DocumentSeal;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.json";
pub const USAGE_FILE: &str = "usage.json";
pub const DOCUMENT_MODE: u32 = 0o600;
pub const MIN_EXPIRY_DAYS: i64 = 1;
pub const MAX_EXPIRY_DAYS: i64 = 365;
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Write-through owner of the configuration and usage documents.
#[derive(Debug)]
pub struct Store {
    config_path: PathBuf,
    usage_path: PathBuf,
    seal: Option<DocumentSeal>,
    config: ConfigDocument,
    usage: UsageDocument,
}

impl Store {
    /// Loads both documents from `dir`, materializing defaults for missing
    /// files. A document that fails to parse is a fatal [`CoreError::Config`].
    pub fn open(dir: impl AsRef<Path>, seal: Option<DocumentSeal>) -> Result<Self, CoreError> {
        let dir = dir.as_ref();
        ensure_private_dir(dir)?;
        let mut store = Self {
            config_path: dir.join(CONFIG_FILE),
            usage_path: dir.join(USAGE_FILE),
            seal,
            config: ConfigDocument::default(),
            usage: UsageDocument::new(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn load(&mut self) -> Result<(), CoreError> {
        match self.read_document::<ConfigDocument>(&self.config_path)? {
            Some(doc) => self.config = doc,
            None => {
                info!(path = %self.config_path.display(), "writing default configuration");
                self.config = ConfigDocument::default();
                self.save_config()?;
            }
        }
        match self.read_document::<UsageDocument>(&self.usage_path)? {
            Some(doc) => self.usage = doc,
            None => {
                self.usage = UsageDocument::new();
                self.save_usage()?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &ConfigDocument {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(&self.config) {
            Ok(Value::Object(mut map)) => map.remove(key),
            _ => None,
        }
    }

    /// Sets one top-level field. The result must still deserialize as a
    /// configuration document, so typed fields keep their types, and
    /// expiration and repo link entries obey the same rules as
    /// [`Store::set_expiration`] and [`Store::link_repo_key`].
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), CoreError> {
        let mut map = match serde_json::to_value(&self.config) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(CoreError::Config("configuration is not an object".into())),
            Err(e) => return Err(CoreError::Config(e.to_string())),
        };
        map.insert(key.to_string(), value);
        let doc: ConfigDocument = serde_json::from_value(Value::Object(map))
            .map_err(|e| CoreError::Validation(format!("invalid value for {key}: {e}")))?;
        for (name, rec) in &doc.key_expiration {
            PermissionGuard.require_valid_name(name)?;
            check_expiry_days(i64::from(rec.days))?;
        }
        for (url, name) in &doc.repo_links {
            check_repo_link(url, name)?;
        }
        self.config = doc;
        self.save_config()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.config.providers.get(name)
    }

    pub fn record_use(&mut self, name: &str) -> Result<UsageRecord, CoreError> {
        self.record_use_at(name, Utc::now())
    }

    pub fn record_use_at(&mut self, name: &str, now: DateTime<Utc>) -> Result<UsageRecord, CoreError> {
        let record = self
            .usage
            .entry(name.to_string())
            .and_modify(|rec| {
                rec.last_used = now;
                rec.use_count += 1;
            })
            .or_insert(UsageRecord {
                created: now,
                last_used: now,
                use_count: 1,
            })
            .clone();
        debug!(key = %name, use_count = record.use_count, "usage recorded");
        self.save_usage()?;
        Ok(record)
    }

    pub fn usage(&self, name: &str) -> Option<&UsageRecord> {
        self.usage.get(name)
    }

    pub fn all_usage(&self) -> &UsageDocument {
        &self.usage
    }

    pub fn set_expiration(&mut self, name: &str, days: i64) -> Result<(), CoreError> {
        self.set_expiration_at(name, days, Utc::now())
    }

    pub fn set_expiration_at(
        &mut self,
        name: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        PermissionGuard.require_valid_name(name)?;
        check_expiry_days(days)?;
        self.config.key_expiration.insert(
            name.to_string(),
            ExpirationRecord {
                days: days as u32,
                set_date: now,
            },
        );
        info!(key = %name, days, "expiration set");
        self.save_config()
    }

    /// Restarts an existing expiration window from `now`; no-op otherwise.
    pub fn restart_expiration(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        match self.config.key_expiration.get_mut(name) {
            Some(rec) => {
                rec.set_date = now;
                self.save_config()
            }
            None => Ok(()),
        }
    }

    pub fn remove_expiration(&mut self, name: &str) -> Result<(), CoreError> {
        if self.config.key_expiration.remove(name).is_none() {
            return Err(CoreError::NotFound(format!("no expiration set for {name}")));
        }
        self.save_config()
    }

    pub fn expiration(&self, name: &str) -> Option<&ExpirationRecord> {
        self.config.key_expiration.get(name)
    }

    pub fn check_expirations(&self) -> BTreeMap<String, i64> {
        self.check_expirations_at(Utc::now())
    }

    /// Keys with 1..=30 days left. Already expired keys are not listed.
    pub fn check_expirations_at(&self, now: DateTime<Utc>) -> BTreeMap<String, i64> {
        self.config
            .key_expiration
            .iter()
            .map(|(name, rec)| (name.clone(), rec.days_left(now)))
            .filter(|(_, left)| *left > 0 && *left <= EXPIRY_WARNING_DAYS)
            .collect()
    }

    pub fn link_repo_key(&mut self, url: &str, key: &str) -> Result<(), CoreError> {
        check_repo_link(url, key)?;
        self.config
            .repo_links
            .insert(url.to_string(), key.to_string());
        info!(url = %url, key = %key, "repository linked");
        self.save_config()
    }

    pub fn repo_key(&self, url: &str) -> Option<&str> {
        self.config.repo_links.get(url).map(String::as_str)
    }

    pub fn repo_links(&self, repo: Option<&str>, key: Option<&str>) -> Vec<RepoLink> {
        self.config
            .repo_links
            .iter()
            .filter(|(url, _)| repo.map_or(true, |r| r == url.as_str()))
            .filter(|(_, k)| key.map_or(true, |want| want == k.as_str()))
            .map(|(url, k)| RepoLink {
                url: url.clone(),
                key: k.clone(),
            })
            .collect()
    }

    /// Drops every record that refers to a deleted key.
    pub fn forget_key(&mut self, name: &str) -> Result<(), CoreError> {
        let had_usage = self.usage.remove(name).is_some();
        let had_expiry = self.config.key_expiration.remove(name).is_some();
        let before = self.config.repo_links.len();
        self.config.repo_links.retain(|_, key| key != name);
        if had_expiry || before != self.config.repo_links.len() {
            self.save_config()?;
        }
        if had_usage {
            self.save_usage()?;
        }
        Ok(())
    }

    fn read_document<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, CoreError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoreError::Config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let doc = if DocumentSeal::is_sealed(&raw) {
            let seal = self.seal.as_ref().ok_or_else(|| {
                CoreError::Config(format!(
                    "{} is encrypted but no store key is configured",
                    path.display()
                ))
            })?;
            let plain = seal
                .open(&raw)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
            serde_json::from_slice(&plain)
        } else {
            serde_json::from_slice(&raw)
        };
        doc.map(Some)
            .map_err(|e| CoreError::Config(format!("corrupt {}: {}", path.display(), e)))
    }

    fn write_document<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), CoreError> {
        let mut bytes =
            serde_json::to_vec_pretty(doc).map_err(|e| CoreError::Config(e.to_string()))?;
        if let Some(seal) = &self.seal {
            bytes = seal
                .seal(&bytes)
                .map_err(|e| CoreError::Config(e.to_string()))?;
        }
        atomic_write(path, &bytes, DOCUMENT_MODE)?;
        Ok(())
    }

    fn save_config(&self) -> Result<(), CoreError> {
        self.write_document(&self.config_path, &self.config)
    }

    fn save_usage(&self) -> Result<(), CoreError> {
        self.write_document(&self.usage_path, &self.usage)
    }
}

fn check_expiry_days(days: i64) -> Result<(), CoreError> {
    if !(MIN_EXPIRY_DAYS..=MAX_EXPIRY_DAYS).contains(&days) {
        return Err(CoreError::Validation(format!(
            "expiration days must be between {MIN_EXPIRY_DAYS} and {MAX_EXPIRY_DAYS}, got {days}"
        )));
    }
    Ok(())
}

fn check_repo_link(url: &str, key: &str) -> Result<(), CoreError> {
    if !validate_repo_url(url) {
        return Err(CoreError::Validation(format!(
            "invalid repository URL {url:?}: expected git@host:owner/repo.git, ssh://git@host/owner/repo.git or https://host/owner/repo.git"
        )));
    }
    PermissionGuard.require_valid_name(key)
}

pub fn validate_repo_url(url: &str) -> bool {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"^git@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+:[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+\.git$",
            r"^ssh://git@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+(:[0-9]+)?/[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+\.git$",
            r"^https://[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+/[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+\.git$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });
    patterns.iter().any(|re| re.is_match(url))
}
