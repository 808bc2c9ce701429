use crate::error::CoreError;
use crate::fsio::{file_mode, set_mode, sibling_pub};
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, warn};

pub const PRIVATE_KEY_MODE: u32 = 0o600;
pub const PUBLIC_KEY_MODE: u32 = 0o644;
pub const KEY_DIR_MODE: u32 = 0o700;

const KEY_PREFIXES: [&str; 4] = ["id_ed25519", "id_rsa", "id_ecdsa", "id_dsa"];
pub(crate) const SECURITY_KEY_NAMES: [&str; 2] = ["id_ed25519_sk", "id_ecdsa_sk"];

#[derive(Clone, Debug, Default)]
pub struct PermissionGuard;

impl PermissionGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn expected_mode(path: &Path) -> u32 {
        if path.extension().and_then(|e| e.to_str()) == Some("pub") {
            PUBLIC_KEY_MODE
        } else {
            PRIVATE_KEY_MODE
        }
    }

    /// Any stat failure counts as non-compliant.
    pub fn check_permissions(&self, path: &Path) -> bool {
        match file_mode(path) {
            Ok(mode) => mode == Self::expected_mode(path),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "permission check failed");
                false
            }
        }
    }

    /// Applies private, public and directory modes in that order. Every step
    /// is attempted; failures are collected and returned together.
    pub fn fix_permissions(&self, key_path: &Path) -> Result<(), CoreError> {
        let mut failures = Vec::new();

        if key_path.exists() {
            if let Err(err) = set_mode(key_path, PRIVATE_KEY_MODE) {
                failures.push(format!("{}: {}", key_path.display(), err));
            }
        }
        let pub_path = sibling_pub(key_path);
        if pub_path.exists() {
            if let Err(err) = set_mode(&pub_path, PUBLIC_KEY_MODE) {
                failures.push(format!("{}: {}", pub_path.display(), err));
            }
        }
        if let Some(dir) = key_path.parent().filter(|d| d.exists()) {
            if let Err(err) = set_mode(dir, KEY_DIR_MODE) {
                failures.push(format!("{}: {}", dir.display(), err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(path = %key_path.display(), failures = failures.len(), "permission fix incomplete");
            Err(CoreError::Permission(failures.join("; ")))
        }
    }

    /// Gatekeeper for every user-supplied key name; must run before any path
    /// is built from it.
    pub fn validate_name(&self, name: &str) -> bool {
        if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
            return false;
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return false;
        }
        if SECURITY_KEY_NAMES.contains(&name) {
            return false;
        }
        KEY_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    }

    pub fn require_valid_name(&self, name: &str) -> Result<(), CoreError> {
        if self.validate_name(name) {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "invalid key name {:?}: expected one of {} followed by letters, digits, '_' or '-'",
                name,
                KEY_PREFIXES.join(", ")
            )))
        }
    }

    /// Overwrites the private key with random bytes, syncs, then unlinks it;
    /// the public sibling is removed afterwards.
    pub fn secure_delete(&self, path: &Path) -> Result<(), CoreError> {
        if path.exists() {
            let size = fs::metadata(path)?.len() as usize;
            let mut noise = vec![0u8; size.max(1)];
            rand::thread_rng().fill_bytes(&mut noise);
            {
                let mut file = OpenOptions::new().write(true).open(path)?;
                file.write_all(&noise)?;
                file.flush()?;
                file.sync_all()?;
            }
            fs::remove_file(path).map_err(|err| {
                error!(path = %path.display(), error = %err, "unlink after overwrite failed");
                CoreError::Io(err)
            })?;
        }
        let pub_path = sibling_pub(path);
        if pub_path.exists() {
            fs::remove_file(&pub_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn name_validation() {
        let guard = PermissionGuard::new();
        for ok in ["id_ed25519", "id_rsa", "id_rsa_work", "id_ecdsa-ci", "id_dsa"] {
            assert!(guard.validate_name(ok), "{ok}");
        }
        for bad in [
            "",
            "../id_rsa",
            "id_rsa/../../etc",
            "id_rsa\\x",
            "id_rsa.pub",
            "id_rsa.bak_20240101",
            "known_hosts",
            "config",
            "id_ed25519_sk",
            "id_rsa work",
        ] {
            assert!(!guard.validate_name(bad), "{bad}");
        }
        assert!(matches!(
            guard.require_valid_name("../x"),
            Err(CoreError::Validation(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn fix_then_check_passes() {
        let dir = TempDir::new().unwrap();
        let ssh = dir.path().join(".ssh");
        fs::create_dir(&ssh).unwrap();
        let key = ssh.join("id_ed25519");
        let public = ssh.join("id_ed25519.pub");
        fs::write(&key, "private").unwrap();
        fs::write(&public, "ssh-ed25519 AAAA me").unwrap();
        set_mode(&key, 0o644).unwrap();
        set_mode(&public, 0o600).unwrap();
        set_mode(&ssh, 0o755).unwrap();

        let guard = PermissionGuard::new();
        assert!(!guard.check_permissions(&key));
        assert!(!guard.check_permissions(&public));

        guard.fix_permissions(&key).unwrap();
        assert!(guard.check_permissions(&key));
        assert!(guard.check_permissions(&public));
        assert_eq!(file_mode(&ssh).unwrap(), KEY_DIR_MODE);

        guard.fix_permissions(&key).unwrap();
        assert!(guard.check_permissions(&key));
    }

    #[test]
    fn missing_file_is_not_compliant() {
        let dir = TempDir::new().unwrap();
        assert!(!PermissionGuard::new().check_permissions(&dir.path().join("id_rsa")));
    }

    #[test]
    fn secure_delete_removes_pair() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("id_rsa");
        fs::write(&key, "secret material").unwrap();
        fs::write(dir.path().join("id_rsa.pub"), "ssh-rsa AAAA").unwrap();
        PermissionGuard::new().secure_delete(&key).unwrap();
        assert!(!key.exists());
        assert!(!dir.path().join("id_rsa.pub").exists());
    }
}
