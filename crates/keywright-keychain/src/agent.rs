use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PublicKey};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent unavailable: {0}")]
    Connect(String),
    #[error("agent refused request: {0}")]
    Agent(String),
    #[error("cannot load {}: {reason}", .path.display())]
    Key { path: PathBuf, reason: String },
    #[error("{} is passphrase protected", .0.display())]
    PassphraseRequired(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registers and deregisters identities with a running agent.
pub trait AgentInterface {
    fn add(&self, key_path: &Path) -> Result<(), AgentError>;
    fn remove(&self, key_path: &Path) -> Result<(), AgentError>;
    fn remove_all(&self) -> Result<(), AgentError>;
}

pub struct AgentManager {
    client: AgentClient<Box<dyn russh::keys::agent::client::AgentStream + Send + Unpin>>,
}

impl AgentManager {
    pub async fn connect() -> Result<Self, AgentError> {
        #[cfg(unix)]
        let client = AgentClient::connect_env()
            .await
            .map_err(|e| AgentError::Connect(e.to_string()))?;

        #[cfg(windows)]
        let client = {
            use tokio::net::windows::named_pipe::ClientOptions;
            let sock = std::env::var("SSH_AUTH_SOCK")
                .unwrap_or_else(|_| "\\\\.\\pipe\\openssh-ssh-agent".to_string());
            let stream = ClientOptions::new()
                .open(sock)
                .map_err(|e| AgentError::Connect(e.to_string()))?;
            AgentClient::connect(stream)
        };

        Ok(Self {
            client: client.dynamic(),
        })
    }

    pub async fn add_identity(&mut self, key: &PrivateKey) -> Result<(), AgentError> {
        self.client
            .add_identity(key, &[])
            .await
            .map_err(|e| AgentError::Agent(e.to_string()))?;
        Ok(())
    }

    pub async fn remove_identity(&mut self, key: &PublicKey) -> Result<(), AgentError> {
        self.client
            .remove_identity(key)
            .await
            .map_err(|e| AgentError::Agent(e.to_string()))?;
        Ok(())
    }

    pub async fn remove_all(&mut self) -> Result<(), AgentError> {
        self.client
            .remove_all_identities()
            .await
            .map_err(|e| AgentError::Agent(e.to_string()))?;
        Ok(())
    }

    pub async fn add_identity_from_file(&mut self, path: &Path) -> Result<(), AgentError> {
        let key = load_private_key(path)?;
        self.add_identity(&key).await
    }
}

/// Blocking front for [`AgentManager`]; each call opens a fresh agent
/// connection on a private current-thread runtime.
pub struct NativeAgent {
    runtime: tokio::runtime::Runtime,
}

impl NativeAgent {
    pub fn new() -> Result<Self, AgentError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }
}

impl AgentInterface for NativeAgent {
    fn add(&self, key_path: &Path) -> Result<(), AgentError> {
        debug!(path = %key_path.display(), "agent add");
        self.runtime.block_on(async {
            let mut agent = AgentManager::connect().await?;
            agent.add_identity_from_file(key_path).await
        })
    }

    fn remove(&self, key_path: &Path) -> Result<(), AgentError> {
        debug!(path = %key_path.display(), "agent remove");
        let public = load_public_key(key_path)?;
        self.runtime.block_on(async {
            let mut agent = AgentManager::connect().await?;
            agent.remove_identity(&public).await
        })
    }

    fn remove_all(&self) -> Result<(), AgentError> {
        debug!("agent remove all");
        self.runtime.block_on(async {
            let mut agent = AgentManager::connect().await?;
            agent.remove_all().await
        })
    }
}

fn load_private_key(path: &Path) -> Result<PrivateKey, AgentError> {
    let data = fs::read_to_string(path)?;
    let key = PrivateKey::from_openssh(&data).map_err(|e| AgentError::Key {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if key.is_encrypted() {
        return Err(AgentError::PassphraseRequired(path.to_path_buf()));
    }
    Ok(key)
}

/// Prefers the `.pub` sibling so encrypted private keys can still be removed.
fn load_public_key(path: &Path) -> Result<PublicKey, AgentError> {
    let mut pub_path = path.as_os_str().to_owned();
    pub_path.push(".pub");
    let pub_path = PathBuf::from(pub_path);
    if pub_path.exists() {
        let data = fs::read_to_string(&pub_path)?;
        return PublicKey::from_openssh(data.trim()).map_err(|e| AgentError::Key {
            path: pub_path,
            reason: e.to_string(),
        });
    }
    Ok(load_private_key(path)?.public_key().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyAlgorithm, KeyGenerator, NativeKeyGenerator};
    use tempfile::TempDir;

    #[test]
    fn public_key_prefers_sibling_file() {
        let dir = TempDir::new().unwrap();
        let key = NativeKeyGenerator::default()
            .generate(dir.path(), "id_ed25519", KeyAlgorithm::Ed25519, Some("me@host"))
            .unwrap();
        let from_pub = load_public_key(&key.private_key_path).unwrap();

        fs::remove_file(&key.public_key_path).unwrap();
        let from_private = load_public_key(&key.private_key_path).unwrap();
        assert_eq!(from_pub.key_data(), from_private.key_data());
    }

    #[test]
    fn garbage_private_key_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("id_rsa");
        fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            load_private_key(&path),
            Err(AgentError::Key { .. })
        ));
    }
}
