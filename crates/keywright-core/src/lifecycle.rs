use crate::context::KeyContext;
use crate::documents::UsageRecord;
use crate::error::CoreError;
use crate::fsio::{ensure_private_dir, sibling_pub};
use crate::host_config::{HostEntry, HostUpdate};
use crate::registry::{parse_public_line, KeyInfo, StrengthVerdict};
use crate::snapshot::{create_snapshot, restore_snapshot};
use crate::state::KeyState;
use chrono::{Local, Utc};
use keywright_keychain::{AgentInterface, KeyAlgorithm, KeyGenerator, KeygenError};
use keywright_ssh::{ProcessInvoker, TransportValidator};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Result of a controller operation that ran to completion. Low-level
/// failures (agent, generator, filesystem) land here as `success = false`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub struct Collaborators {
    pub generator: Box<dyn KeyGenerator>,
    pub agent: Box<dyn AgentInterface>,
    pub validator: Box<dyn TransportValidator>,
    pub invoker: Box<dyn ProcessInvoker>,
}

pub struct Lifecycle {
    pub(crate) ctx: KeyContext,
    pub(crate) generator: Box<dyn KeyGenerator>,
    pub(crate) agent: Box<dyn AgentInterface>,
    pub(crate) validator: Box<dyn TransportValidator>,
    pub(crate) invoker: Box<dyn ProcessInvoker>,
}

impl Lifecycle {
    pub fn new(ctx: KeyContext, collaborators: Collaborators) -> Self {
        Self {
            ctx,
            generator: collaborators.generator,
            agent: collaborators.agent,
            validator: collaborators.validator,
            invoker: collaborators.invoker,
        }
    }

    pub fn context(&self) -> &KeyContext {
        &self.ctx
    }

    pub fn key_path(&self, name: &str) -> Result<PathBuf, CoreError> {
        self.ctx.guard.require_valid_name(name)?;
        Ok(self.ctx.registry.key_path(name))
    }

    pub fn create(
        &mut self,
        name: &str,
        algorithm: KeyAlgorithm,
        comment: Option<&str>,
    ) -> Result<Outcome, CoreError> {
        let path = self.key_path(name)?;
        if path.exists() || sibling_pub(&path).exists() {
            return Ok(Outcome::fail(format!("Key {name} already exists")));
        }
        let comment = self.resolve_comment(comment);
        self.ctx.refresh()?;
        self.ctx.registry.set_state(name, KeyState::Generating)?;

        if let Err(err) = self.generate(name, algorithm, &comment) {
            self.ctx.registry.set_state(name, KeyState::Absent)?;
            return Ok(match err {
                KeygenError::AlreadyExists(_) => {
                    Outcome::fail(format!("Key {name} already exists"))
                }
                other => {
                    error!(key = %name, error = %other, "key generation failed");
                    Outcome::fail(format!("Key creation failed: {other}"))
                }
            });
        }
        self.ctx.registry.set_state(name, KeyState::Created)?;
        self.ctx.refresh()?;
        info!(key = %name, algorithm = %algorithm, "key created");

        if let Err(err) = self.ctx.guard.fix_permissions(&path) {
            warn!(key = %name, error = %err, "created key has loose permissions");
            return Ok(Outcome::fail(format!(
                "Key created but permissions could not be fixed: {err}"
            )));
        }

        match self.agent_add_checked(name, &path) {
            Ok(()) => self.mark_registered(name)?,
            Err(reason) => warn!(key = %name, reason = %reason, "agent registration after create failed"),
        }
        Ok(Outcome::ok("Key created successfully"))
    }

    pub fn add_to_agent(&mut self, key_path: &Path) -> Result<Outcome, CoreError> {
        let name = self.managed_name(key_path)?;
        if !key_path.is_file() {
            return Ok(Outcome::fail(format!("Key {name} not found")));
        }
        match self.agent_add_checked(&name, key_path) {
            Ok(()) => {
                self.mark_registered(&name)?;
                Ok(Outcome::ok(format!("Added {name} to SSH agent")))
            }
            Err(reason) => Ok(Outcome::fail(reason)),
        }
    }

    /// Hands `key_path` to the agent only after the private key passes the
    /// permission check. The error is the user-facing reason.
    pub(crate) fn agent_add_checked(&self, name: &str, key_path: &Path) -> Result<(), String> {
        if !self.ctx.guard.check_permissions(key_path) {
            warn!(key = %name, "refusing to add key with loose permissions");
            return Err(format!(
                "Refusing to add {name}: {} must be mode 0600 (run `keywright perms fix {name}`)",
                key_path.display()
            ));
        }
        self.agent
            .add(key_path)
            .map_err(|err| format!("Failed to add {name} to SSH agent: {err}"))
    }

    pub fn remove_from_agent(&mut self, key_path: Option<&Path>) -> Result<Outcome, CoreError> {
        let Some(key_path) = key_path else {
            return Ok(match self.agent.remove_all() {
                Ok(()) => {
                    let registered: Vec<String> = self
                        .ctx
                        .registry
                        .records()
                        .filter(|r| r.state == KeyState::Registered)
                        .map(|r| r.name.clone())
                        .collect();
                    for name in registered {
                        self.note_state(&name, KeyState::Unregistered);
                    }
                    Outcome::ok("Removed all keys from SSH agent")
                }
                Err(err) => Outcome::fail(format!("Failed to remove keys from SSH agent: {err}")),
            });
        };
        let name = self.managed_name(key_path)?;
        Ok(match self.agent.remove(key_path) {
            Ok(()) => {
                self.note_state(&name, KeyState::Unregistered);
                Outcome::ok(format!("Removed {name} from SSH agent"))
            }
            Err(err) => Outcome::fail(format!("Failed to remove {name} from SSH agent: {err}")),
        })
    }

    pub fn validate(&self, provider: &str) -> Result<Outcome, CoreError> {
        let config = self.ctx.store.provider(provider).cloned().ok_or_else(|| {
            let known: Vec<&str> = self
                .ctx
                .store
                .config()
                .providers
                .keys()
                .map(String::as_str)
                .collect();
            CoreError::Validation(format!(
                "unknown provider {provider:?} (configured: {})",
                known.join(", ")
            ))
        })?;
        match self.validator.handshake(provider, &config.test_command) {
            Ok(handshake) if handshake.output.contains(&config.success_message) => {
                info!(provider = %provider, "authentication succeeded");
                Ok(Outcome::ok("Authentication successful"))
            }
            Ok(handshake) => {
                debug!(provider = %provider, exit_code = ?handshake.exit_code, "authentication failed");
                Ok(Outcome::fail(format!(
                    "Authentication failed: {}",
                    handshake.output.trim()
                )))
            }
            Err(err) => Ok(Outcome::fail(format!("Authentication failed: {err}"))),
        }
    }

    /// Moves the current pair aside as `<name>.bak_<stamp>` and generates a
    /// replacement with the same type and comment. A failed generation puts
    /// the original files back.
    pub fn rotate(&mut self, key_path: &Path) -> Result<Outcome, CoreError> {
        let name = self.managed_name(key_path)?;
        if !key_path.is_file() {
            return Ok(Outcome::fail(format!(
                "Key rotation failed: key {name} not found"
            )));
        }
        let pub_path = sibling_pub(key_path);
        let public = fs::read_to_string(&pub_path)
            .ok()
            .and_then(|line| parse_public_line(&line));
        let Some((algorithm, comment)) = public.and_then(|(key_type, comment)| {
            KeyAlgorithm::from_openssh_type(&key_type).map(|alg| (alg, comment))
        }) else {
            return Ok(Outcome::fail(format!(
                "Key rotation failed: cannot determine the type of {name} from {}",
                pub_path.display()
            )));
        };
        self.ctx.refresh()?;
        self.ctx.registry.set_state(&name, KeyState::Rotating)?;

        let backup = self.backup_path(&name);
        let pub_backup = sibling_pub(&backup);
        if let Err(err) = fs::rename(key_path, &backup) {
            self.ctx.registry.set_state(&name, KeyState::RotationFailed)?;
            return Ok(Outcome::fail(format!("Key rotation failed: {err}")));
        }
        let had_pub = pub_path.exists();
        if had_pub {
            if let Err(err) = fs::rename(&pub_path, &pub_backup) {
                let restored = fs::rename(&backup, key_path);
                self.ctx.registry.set_state(&name, KeyState::RotationFailed)?;
                return Ok(Outcome::fail(rollback_message(&err.to_string(), restored.err(), &backup)));
            }
        }
        info!(key = %name, backup = %backup.display(), "previous key moved aside");

        let comment = comment.unwrap_or_default();
        if let Err(err) = self.generate(&name, algorithm, &comment) {
            error!(key = %name, error = %err, "rotation generation failed, rolling back");
            let mut restored = fs::rename(&backup, key_path).err();
            if had_pub && restored.is_none() {
                restored = fs::rename(&pub_backup, &pub_path).err();
            }
            self.ctx.registry.set_state(&name, KeyState::RotationFailed)?;
            return Ok(Outcome::fail(rollback_message(&err.to_string(), restored, &backup)));
        }

        if let Err(err) = self.ctx.guard.fix_permissions(key_path) {
            warn!(key = %name, error = %err, "rotated key has loose permissions");
        }
        if let Err(err) = self.agent.remove(&backup) {
            debug!(key = %name, error = %err, "previous key was not in the agent");
        }
        if let Err(reason) = self.agent_add_checked(&name, key_path) {
            warn!(key = %name, reason = %reason, "agent registration after rotate failed");
        } else {
            self.ctx.store.record_use(&name)?;
        }
        self.ctx.store.restart_expiration(&name, Utc::now())?;
        self.ctx.registry.set_state(&name, KeyState::Rotated)?;
        self.ctx.refresh()?;
        info!(key = %name, "key rotated");
        Ok(Outcome::ok("Key rotated successfully"))
    }

    pub fn backup(&mut self, target_dir: &Path) -> Result<Outcome, CoreError> {
        let keys = self.ctx.registry.list_keys()?;
        if keys.is_empty() {
            return Ok(Outcome::fail("No SSH keys to back up"));
        }
        Ok(
            match create_snapshot(self.ctx.registry.dir(), &keys, target_dir) {
                Ok(report) => Outcome::ok(format!(
                    "Backup completed successfully: {} files in {}",
                    report.files.len(),
                    report.snapshot.display()
                )),
                Err(err) => {
                    error!(target = %target_dir.display(), error = %err, "backup failed");
                    Outcome::fail(format!("Backup failed: {err}"))
                }
            },
        )
    }

    pub fn restore(&mut self, source_dir: &Path, overwrite: bool) -> Result<Outcome, CoreError> {
        let result = restore_snapshot(source_dir, self.ctx.registry.dir(), overwrite);
        self.ctx.refresh()?;
        Ok(match result {
            Ok(report) => Outcome::ok(format!(
                "Keys restored successfully: {} files from {}",
                report.files.len(),
                report.snapshot.display()
            )),
            Err(err) => {
                warn!(source = %source_dir.display(), error = %err, "restore failed");
                Outcome::fail(format!("Restore failed: {err}"))
            }
        })
    }

    pub fn delete(&mut self, name: &str) -> Result<Outcome, CoreError> {
        let path = self.key_path(name)?;
        if !path.is_file() {
            return Ok(Outcome::fail(format!("Key {name} not found")));
        }
        self.ctx.refresh()?;
        self.ctx.registry.check_transition(name, KeyState::Deleted)?;
        if let Err(err) = self.agent.remove(&path) {
            debug!(key = %name, error = %err, "key was not in the agent");
        }
        if let Err(err) = self.ctx.guard.secure_delete(&path) {
            error!(key = %name, error = %err, "secure delete failed");
            return Ok(Outcome::fail(format!("Key deletion failed: {err}")));
        }
        self.ctx.registry.set_state(name, KeyState::Deleted)?;
        self.ctx.store.forget_key(name)?;
        self.ctx.refresh()?;
        info!(key = %name, "key deleted");
        Ok(Outcome::ok(format!("Key {name} deleted")))
    }

    pub fn list_keys(&self) -> Result<Vec<String>, CoreError> {
        self.ctx.registry.list_keys()
    }

    pub fn key_info(&self, name: &str) -> Result<KeyInfo, CoreError> {
        self.ctx.registry.key_info(name, &self.ctx.store)
    }

    pub fn stats(&self, name: Option<&str>) -> Result<Vec<(String, Option<UsageRecord>)>, CoreError> {
        let names = match name {
            Some(name) => {
                self.ctx.guard.require_valid_name(name)?;
                vec![name.to_string()]
            }
            None => self.ctx.registry.list_keys()?,
        };
        Ok(names
            .into_iter()
            .map(|name| {
                let usage = self.ctx.store.usage(&name).cloned();
                (name, usage)
            })
            .collect())
    }

    pub fn analyze(&self, name: Option<&str>) -> Result<Vec<(String, StrengthVerdict)>, CoreError> {
        let names = match name {
            Some(name) => {
                self.ctx.guard.require_valid_name(name)?;
                vec![name.to_string()]
            }
            None => self.ctx.registry.list_keys()?,
        };
        Ok(names
            .into_iter()
            .map(|name| {
                let verdict = self.ctx.registry.check_strength(&name);
                (name, verdict)
            })
            .collect())
    }

    pub fn check_key_permissions(&self, name: &str) -> Result<Outcome, CoreError> {
        let path = self.key_path(name)?;
        if !path.is_file() {
            return Ok(Outcome::fail(format!("Key {name} not found")));
        }
        let pub_path = sibling_pub(&path);
        let mut loose = Vec::new();
        if !self.ctx.guard.check_permissions(&path) {
            loose.push(path.display().to_string());
        }
        if pub_path.exists() && !self.ctx.guard.check_permissions(&pub_path) {
            loose.push(pub_path.display().to_string());
        }
        Ok(if loose.is_empty() {
            Outcome::ok(format!("Permissions of {name} are correct"))
        } else {
            Outcome::fail(format!("Incorrect permissions: {}", loose.join(", ")))
        })
    }

    pub fn fix_key_permissions(&self, name: &str) -> Result<Outcome, CoreError> {
        let path = self.key_path(name)?;
        if !path.is_file() {
            return Ok(Outcome::fail(format!("Key {name} not found")));
        }
        Ok(match self.ctx.guard.fix_permissions(&path) {
            Ok(()) => Outcome::ok(format!("Fixed permissions of {name}")),
            Err(err) => Outcome::fail(format!("Permission fix incomplete: {err}")),
        })
    }

    pub fn set_expiration(&mut self, name: &str, days: i64) -> Result<Outcome, CoreError> {
        self.ctx.store.set_expiration(name, days)?;
        self.ctx.refresh()?;
        Ok(Outcome::ok(format!("Set {days} days expiration for {name}")))
    }

    pub fn remove_expiration(&mut self, name: &str) -> Result<Outcome, CoreError> {
        self.ctx.guard.require_valid_name(name)?;
        match self.ctx.store.remove_expiration(name) {
            Ok(()) => {
                self.ctx.refresh()?;
                Ok(Outcome::ok(format!("Removed expiration for {name}")))
            }
            Err(CoreError::NotFound(_)) => Ok(Outcome::fail(format!("No expiration set for {name}"))),
            Err(err) => Err(err),
        }
    }

    pub fn check_expirations(&self) -> BTreeMap<String, i64> {
        self.ctx.store.check_expirations()
    }

    pub fn hosts(&self) -> Result<Vec<HostEntry>, CoreError> {
        self.ctx.hosts.get()
    }

    /// `key` is a managed key name; it is written as an absolute
    /// `IdentityFile`.
    pub fn update_host(
        &mut self,
        host: &str,
        key: Option<&str>,
        user: Option<&str>,
        port: Option<u16>,
    ) -> Result<Outcome, CoreError> {
        let identity = match key {
            Some(name) => {
                let path = self.key_path(name)?;
                if !path.is_file() {
                    return Ok(Outcome::fail(format!("Key {name} not found")));
                }
                Some(path)
            }
            None => None,
        };
        let update = HostUpdate {
            identity_file: identity.as_deref(),
            user,
            port,
        };
        match self.ctx.hosts.update(host, &update) {
            Ok(_) => Ok(Outcome::ok(format!("Updated SSH config for {host}"))),
            Err(CoreError::Io(err)) => Ok(Outcome::fail(format!(
                "Failed to update SSH config for {host}: {err}"
            ))),
            Err(err) => Err(err),
        }
    }

    pub fn remove_host(&mut self, host: &str) -> Result<Outcome, CoreError> {
        match self.ctx.hosts.remove(host) {
            Ok(true) => Ok(Outcome::ok(format!("Removed {host} from SSH config"))),
            Ok(false) => Ok(Outcome::fail(format!("Host {host} not found in SSH config"))),
            Err(CoreError::Io(err)) => Ok(Outcome::fail(format!(
                "Failed to remove {host} from SSH config: {err}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Key name of a path inside the managed directory.
    pub(crate) fn managed_name(&self, key_path: &Path) -> Result<String, CoreError> {
        let name = key_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CoreError::Validation(format!("invalid key path {}", key_path.display()))
            })?;
        self.ctx.guard.require_valid_name(name)?;
        if key_path.parent() != Some(self.ctx.registry.dir()) {
            return Err(CoreError::Validation(format!(
                "{} is not in the managed key directory {}",
                key_path.display(),
                self.ctx.registry.dir().display()
            )));
        }
        Ok(name.to_string())
    }

    pub(crate) fn mark_registered(&mut self, name: &str) -> Result<(), CoreError> {
        let usage = self.ctx.store.record_use(name)?;
        debug!(key = %name, use_count = usage.use_count, "key registered with agent");
        self.note_state(name, KeyState::Registered);
        self.ctx.refresh()
    }

    /// Bookkeeping transition after the side effect already happened; a
    /// rejected move is logged by the registry and otherwise ignored.
    fn note_state(&mut self, name: &str, to: KeyState) {
        let _ = self.ctx.registry.set_state(name, to);
    }

    fn generate(
        &self,
        name: &str,
        algorithm: KeyAlgorithm,
        comment: &str,
    ) -> Result<(), KeygenError> {
        let dir = self.ctx.registry.dir();
        ensure_private_dir(dir)?;
        let comment = if comment.is_empty() { None } else { Some(comment) };
        let generated = self.generator.generate(dir, name, algorithm, comment)?;
        debug!(key = %name, fingerprint = %generated.fingerprint, "key pair generated");
        Ok(())
    }

    fn resolve_comment(&self, comment: Option<&str>) -> String {
        if let Some(comment) = comment.filter(|c| !c.trim().is_empty()) {
            return comment.to_string();
        }
        let configured = &self.ctx.store.config().default_key_comment;
        if !configured.is_empty() {
            return configured.clone();
        }
        match whoami::fallible::hostname() {
            Ok(host) => format!("{}@{}", whoami::username(), host),
            Err(_) => whoami::username(),
        }
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = self.ctx.registry.dir();
        let base = dir.join(format!("{name}.bak_{stamp}"));
        if !base.exists() && !sibling_pub(&base).exists() {
            return base;
        }
        (1..)
            .map(|n| dir.join(format!("{name}.bak_{stamp}_{n}")))
            .find(|p| !p.exists() && !sibling_pub(p).exists())
            .unwrap_or(base)
    }
}

fn rollback_message(cause: &str, rollback: Option<std::io::Error>, backup: &Path) -> String {
    match rollback {
        None => format!("Key rotation failed: {cause}"),
        Some(err) => {
            error!(backup = %backup.display(), error = %err, "rotation rollback failed");
            format!(
                "Key rotation failed: {cause}; rollback failed ({err}), previous key kept at {}",
                backup.display()
            )
        }
    }
}
