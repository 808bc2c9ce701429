use crate::documents::{ExpirationRecord, UsageRecord};
use crate::error::CoreError;
use crate::fsio::{file_mode, sibling_pub};
use crate::permissions::{PermissionGuard, SECURITY_KEY_NAMES};
use crate::state::KeyState;
use crate::store::Store;
use chrono::{DateTime, Utc};
use keywright_keychain::KeyAlgorithm;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyRecord {
    pub name: String,
    pub algorithm: Option<KeyAlgorithm>,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: u64,
    pub expiration: Option<ExpirationRecord>,
    pub state: KeyState,
}

/// Point-in-time report for one key, filesystem facts merged with the
/// stored usage and expiration records.
#[derive(Clone, Debug, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub path: PathBuf,
    pub algorithm: Option<KeyAlgorithm>,
    pub key_type: Option<String>,
    pub comment: Option<String>,
    pub private_mode: Option<u32>,
    pub public_mode: Option<u32>,
    pub permissions_ok: bool,
    pub usage: Option<UsageRecord>,
    pub expiration: Option<ExpirationRecord>,
    pub days_left: Option<i64>,
    pub state: KeyState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum StrengthVerdict {
    Recommended,
    PhaseOut,
    Deprecated,
    Concerns,
    InvalidFormat,
    AnalysisError(String),
}

impl StrengthVerdict {
    pub fn is_finding(&self) -> bool {
        !matches!(self, StrengthVerdict::Recommended)
    }
}

impl fmt::Display for StrengthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrengthVerdict::Recommended => f.write_str("No issues found"),
            StrengthVerdict::PhaseOut => {
                f.write_str("RSA keys are being phased out, consider using Ed25519")
            }
            StrengthVerdict::Deprecated => f.write_str("DSA keys are deprecated and insecure"),
            StrengthVerdict::Concerns => {
                f.write_str("ECDSA keys have potential security concerns")
            }
            StrengthVerdict::InvalidFormat => f.write_str("Invalid key format"),
            StrengthVerdict::AnalysisError(reason) => write!(f, "Error analyzing key: {reason}"),
        }
    }
}

/// Splits `<type> <base64> <comment...>`; `None` when fewer than two fields.
pub fn parse_public_line(line: &str) -> Option<(String, Option<String>)> {
    let mut parts = line.split_whitespace();
    let key_type = parts.next()?;
    parts.next()?;
    let comment = parts.collect::<Vec<_>>().join(" ");
    let comment = if comment.is_empty() { None } else { Some(comment) };
    Some((key_type.to_string(), comment))
}

#[derive(Debug)]
pub struct KeyRegistry {
    dir: PathBuf,
    guard: PermissionGuard,
    records: BTreeMap<String, KeyRecord>,
    states: HashMap<String, KeyState>,
}

impl KeyRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: PermissionGuard::new(),
            records: BTreeMap::new(),
            states: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Private key files named `id_*`, without security-key variants and
    /// without anything carrying an extension. A missing directory is empty.
    pub fn list_keys(&self) -> Result<Vec<String>, CoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with("id_")
                && !name.contains('.')
                && !SECURITY_KEY_NAMES.contains(&name.as_str())
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Rebuilds every record from the directory and the store. Lifecycle
    /// states survive the rebuild; states of keys that vanished from disk
    /// are dropped.
    pub fn refresh(&mut self, store: &Store) -> Result<(), CoreError> {
        let names = self.list_keys()?;
        self.states
            .retain(|name, state| !state.is_present() || names.contains(name));
        let mut records = BTreeMap::new();
        for name in names {
            let (algorithm, comment) = match self.read_public(&name) {
                Ok(Some((key_type, comment))) => (KeyAlgorithm::from_openssh_type(&key_type), comment),
                _ => (None, None),
            };
            let usage = store.usage(&name);
            let state = match self.states.get(&name) {
                Some(state) if state.is_present() => *state,
                _ => KeyState::Created,
            };
            self.states.insert(name.clone(), state);
            records.insert(
                name.clone(),
                KeyRecord {
                    name: name.clone(),
                    algorithm,
                    comment,
                    created_at: usage.map(|u| u.created),
                    last_used_at: usage.map(|u| u.last_used),
                    use_count: usage.map_or(0, |u| u.use_count),
                    expiration: store.expiration(&name).cloned(),
                    state,
                },
            );
        }
        debug!(dir = %self.dir.display(), keys = records.len(), "registry refreshed");
        self.records = records;
        Ok(())
    }

    pub fn record(&self, name: &str) -> Option<&KeyRecord> {
        self.records.get(name)
    }

    pub fn records(&self) -> impl Iterator<Item = &KeyRecord> {
        self.records.values()
    }

    pub fn state(&self, name: &str) -> KeyState {
        self.states.get(name).copied().unwrap_or_else(|| {
            if self.records.contains_key(name) {
                KeyState::Created
            } else {
                KeyState::Absent
            }
        })
    }

    /// Fails with `Operation` when `name` may not move to `to`; nothing changes.
    pub fn check_transition(&self, name: &str, to: KeyState) -> Result<KeyState, CoreError> {
        let from = self.state(name);
        if !from.accepts(to) {
            warn!(key = %name, from = %from, to = %to, "rejected state transition");
            return Err(CoreError::Operation(format!(
                "{name}: cannot move from {from} to {to}"
            )));
        }
        Ok(from)
    }

    pub fn set_state(&mut self, name: &str, to: KeyState) -> Result<(), CoreError> {
        let from = self.check_transition(name, to)?;
        debug!(key = %name, from = %from, to = %to, "state transition");
        self.states.insert(name.to_string(), to);
        if let Some(record) = self.records.get_mut(name) {
            record.state = to;
        }
        Ok(())
    }

    pub fn key_info(&self, name: &str, store: &Store) -> Result<KeyInfo, CoreError> {
        self.guard.require_valid_name(name)?;
        let path = self.key_path(name);
        if !path.is_file() {
            return Err(CoreError::NotFound(format!("key {name} not found")));
        }
        let public = self.read_public(name).ok().flatten();
        let key_type = public.as_ref().map(|(t, _)| t.clone());
        let expiration = store.expiration(name).cloned();
        let pub_path = sibling_pub(&path);
        let permissions_ok = self.guard.check_permissions(&path)
            && (!pub_path.exists() || self.guard.check_permissions(&pub_path));
        Ok(KeyInfo {
            name: name.to_string(),
            algorithm: key_type.as_deref().and_then(KeyAlgorithm::from_openssh_type),
            key_type,
            comment: public.and_then(|(_, c)| c),
            private_mode: file_mode(&path).ok(),
            public_mode: file_mode(&pub_path).ok(),
            permissions_ok,
            usage: store.usage(name).cloned(),
            days_left: expiration.as_ref().map(|e| e.days_left(Utc::now())),
            expiration,
            state: self.state(name),
            path,
        })
    }

    pub fn check_strength(&self, name: &str) -> StrengthVerdict {
        if !self.guard.validate_name(name) {
            return StrengthVerdict::AnalysisError(format!("invalid key name {name:?}"));
        }
        let pub_path = sibling_pub(&self.key_path(name));
        let content = match fs::read_to_string(&pub_path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %pub_path.display(), error = %e, "public key unreadable");
                return StrengthVerdict::AnalysisError(format!("{}: {}", pub_path.display(), e));
            }
        };
        let Some((key_type, _)) = parse_public_line(&content) else {
            return StrengthVerdict::InvalidFormat;
        };
        match KeyAlgorithm::from_openssh_type(&key_type) {
            Some(KeyAlgorithm::Ed25519) => StrengthVerdict::Recommended,
            Some(KeyAlgorithm::Rsa) => StrengthVerdict::PhaseOut,
            Some(KeyAlgorithm::Dsa) => StrengthVerdict::Deprecated,
            Some(KeyAlgorithm::Ecdsa) => StrengthVerdict::Concerns,
            None => StrengthVerdict::InvalidFormat,
        }
    }

    /// Type and comment from the `.pub` sibling. `Ok(None)` when it is
    /// missing or malformed.
    fn read_public(&self, name: &str) -> Result<Option<(String, Option<String>)>, CoreError> {
        let pub_path = sibling_pub(&self.key_path(name));
        match fs::read_to_string(&pub_path) {
            Ok(content) => Ok(parse_public_line(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, KeyRegistry, Store) {
        let dir = TempDir::new().unwrap();
        let ssh = dir.path().join(".ssh");
        fs::create_dir(&ssh).unwrap();
        let store = Store::open(dir.path().join("state"), None).unwrap();
        (dir, KeyRegistry::new(ssh), store)
    }

    fn write_pair(registry: &KeyRegistry, name: &str, public: &str) {
        fs::write(registry.key_path(name), "PRIVATE").unwrap();
        fs::write(sibling_pub(&registry.key_path(name)), public).unwrap();
    }

    #[test]
    fn list_skips_backups_and_non_keys() {
        let (_dir, registry, _store) = fixture();
        for file in [
            "id_rsa",
            "id_rsa.pub",
            "id_ed25519",
            "id_ed25519.bak_20240101_101010",
            "id_ed25519_sk",
            "known_hosts",
            "config",
        ] {
            fs::write(registry.dir().join(file), "x").unwrap();
        }
        fs::create_dir(registry.dir().join("id_dir")).unwrap();
        assert_eq!(registry.list_keys().unwrap(), vec!["id_ed25519", "id_rsa"]);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = KeyRegistry::new(dir.path().join("nope"));
        assert!(registry.list_keys().unwrap().is_empty());
    }

    #[test]
    fn info_merges_public_line_and_usage() {
        let (_dir, mut registry, mut store) = fixture();
        write_pair(&registry, "id_ed25519", "ssh-ed25519 AAAAC3Nz me@laptop work\n");
        store.record_use("id_ed25519").unwrap();
        store.set_expiration("id_ed25519", 30).unwrap();
        registry.refresh(&store).unwrap();

        let info = registry.key_info("id_ed25519", &store).unwrap();
        assert_eq!(info.algorithm, Some(KeyAlgorithm::Ed25519));
        assert_eq!(info.comment.as_deref(), Some("me@laptop work"));
        assert_eq!(info.usage.unwrap().use_count, 1);
        assert_eq!(info.days_left, Some(30));
        assert_eq!(info.state, KeyState::Created);

        let record = registry.record("id_ed25519").unwrap();
        assert_eq!(record.use_count, 1);
        assert!(record.expiration.is_some());
    }

    #[test]
    fn info_without_public_key_is_partial() {
        let (_dir, registry, store) = fixture();
        fs::write(registry.key_path("id_rsa"), "PRIVATE").unwrap();
        let info = registry.key_info("id_rsa", &store).unwrap();
        assert!(info.key_type.is_none());
        assert!(info.comment.is_none());
        assert!(info.public_mode.is_none());
        assert!(matches!(
            registry.key_info("id_ecdsa", &store),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn strength_verdicts() {
        let (_dir, registry, _store) = fixture();
        write_pair(&registry, "id_ed25519", "ssh-ed25519 AAAA a");
        write_pair(&registry, "id_rsa", "ssh-rsa AAAA b");
        write_pair(&registry, "id_dsa", "ssh-dss AAAA");
        write_pair(&registry, "id_ecdsa", "ecdsa-sha2-nistp256 AAAA c");
        write_pair(&registry, "id_rsa_broken", "ssh-rsa");
        fs::write(registry.key_path("id_rsa_nopub"), "PRIVATE").unwrap();

        assert_eq!(registry.check_strength("id_ed25519"), StrengthVerdict::Recommended);
        assert_eq!(registry.check_strength("id_rsa"), StrengthVerdict::PhaseOut);
        assert_eq!(registry.check_strength("id_dsa"), StrengthVerdict::Deprecated);
        assert_eq!(registry.check_strength("id_ecdsa"), StrengthVerdict::Concerns);
        assert_eq!(
            registry.check_strength("id_rsa_broken"),
            StrengthVerdict::InvalidFormat
        );
        assert!(matches!(
            registry.check_strength("id_rsa_nopub"),
            StrengthVerdict::AnalysisError(_)
        ));
    }

    #[test]
    fn states_survive_refresh_and_reject_bad_moves() {
        let (_dir, mut registry, store) = fixture();
        assert_eq!(registry.state("id_rsa"), KeyState::Absent);
        assert!(matches!(
            registry.set_state("id_rsa", KeyState::Registered),
            Err(CoreError::Operation(_))
        ));

        write_pair(&registry, "id_rsa", "ssh-rsa AAAA");
        registry.refresh(&store).unwrap();
        registry.set_state("id_rsa", KeyState::Registered).unwrap();
        registry.refresh(&store).unwrap();
        assert_eq!(registry.record("id_rsa").unwrap().state, KeyState::Registered);
    }

    #[test]
    fn transition_check_leaves_state_alone() {
        let (_dir, mut registry, store) = fixture();
        assert!(registry.check_transition("id_rsa", KeyState::Deleted).is_err());

        write_pair(&registry, "id_rsa", "ssh-rsa AAAA");
        registry.refresh(&store).unwrap();
        assert_eq!(
            registry.check_transition("id_rsa", KeyState::Deleted).unwrap(),
            KeyState::Created
        );
        assert_eq!(registry.state("id_rsa"), KeyState::Created);
    }
}
