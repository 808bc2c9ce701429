use getrandom::getrandom;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use ssh_key::private::{EcdsaKeypair, Ed25519Keypair, KeypairData, RsaKeypair};
use ssh_key::{EcdsaCurve, HashAlg, LineEnding, PrivateKey};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

#[derive(Debug, thiserror::Error)]
pub enum KeygenError {
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("{0} key generation is not supported")]
    Unsupported(KeyAlgorithm),
    #[error("key error: {0}")]
    Key(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Ed25519,
    Rsa,
    Ecdsa,
    Dsa,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Rsa => "rsa",
            KeyAlgorithm::Ecdsa => "ecdsa",
            KeyAlgorithm::Dsa => "dsa",
        }
    }

    /// Maps the first field of an OpenSSH public key line to an algorithm.
    pub fn from_openssh_type(key_type: &str) -> Option<Self> {
        match key_type {
            "ssh-ed25519" | "sk-ssh-ed25519@openssh.com" => Some(KeyAlgorithm::Ed25519),
            "ssh-rsa" => Some(KeyAlgorithm::Rsa),
            "ssh-dss" => Some(KeyAlgorithm::Dsa),
            t if t.starts_with("ecdsa-") || t.starts_with("sk-ecdsa-") => {
                Some(KeyAlgorithm::Ecdsa)
            }
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "rsa" => Ok(KeyAlgorithm::Rsa),
            "ecdsa" => Ok(KeyAlgorithm::Ecdsa),
            "dsa" => Ok(KeyAlgorithm::Dsa),
            other => Err(format!("unknown key algorithm: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeneratedKey {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub fingerprint: String,
}

/// Produces a key pair at `<dir>/<name>` and `<dir>/<name>.pub`.
///
/// Implementations must never overwrite existing files and must leave no
/// partial pair behind when they fail.
pub trait KeyGenerator {
    fn generate(
        &self,
        dir: &Path,
        name: &str,
        algorithm: KeyAlgorithm,
        comment: Option<&str>,
    ) -> Result<GeneratedKey, KeygenError>;
}

#[derive(Clone, Debug)]
pub struct NativeKeyGenerator {
    rsa_bits: usize,
    ecdsa_curve: EcdsaCurve,
}

impl Default for NativeKeyGenerator {
    fn default() -> Self {
        Self {
            rsa_bits: 4096,
            ecdsa_curve: EcdsaCurve::NistP256,
        }
    }
}

impl NativeKeyGenerator {
    pub fn new(rsa_bits: usize, ecdsa_curve: EcdsaCurve) -> Self {
        Self {
            rsa_bits,
            ecdsa_curve,
        }
    }
}

impl KeyGenerator for NativeKeyGenerator {
    fn generate(
        &self,
        dir: &Path,
        name: &str,
        algorithm: KeyAlgorithm,
        comment: Option<&str>,
    ) -> Result<GeneratedKey, KeygenError> {
        let private_path = dir.join(name);
        let public_path = dir.join(format!("{}.pub", name));
        for path in [&private_path, &public_path] {
            if path.exists() {
                return Err(KeygenError::AlreadyExists(path.clone()));
            }
        }
        fs::create_dir_all(dir)?;

        debug!(key = %name, algorithm = %algorithm, "generating key pair");
        let mut rng = OsRng;
        let key_data = match algorithm {
            KeyAlgorithm::Ed25519 => KeypairData::from(Ed25519Keypair::random(&mut rng)),
            KeyAlgorithm::Rsa => KeypairData::from(
                RsaKeypair::random(&mut rng, self.rsa_bits)
                    .map_err(|e| KeygenError::Key(e.to_string()))?,
            ),
            KeyAlgorithm::Ecdsa => KeypairData::from(
                EcdsaKeypair::random(&mut rng, self.ecdsa_curve)
                    .map_err(|e| KeygenError::Key(e.to_string()))?,
            ),
            KeyAlgorithm::Dsa => return Err(KeygenError::Unsupported(algorithm)),
        };

        let comment = comment.unwrap_or_default().to_string();
        let key =
            PrivateKey::new(key_data, comment).map_err(|e| KeygenError::Key(e.to_string()))?;
        let private_pem = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| KeygenError::Key(e.to_string()))?;
        let public_line = key
            .public_key()
            .to_openssh()
            .map_err(|e| KeygenError::Key(e.to_string()))?;

        write_new(&private_path, private_pem.as_bytes(), 0o600)?;
        if let Err(err) = write_new(&public_path, format!("{}\n", public_line).as_bytes(), 0o644)
        {
            let _ = fs::remove_file(&private_path);
            return Err(err.into());
        }
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        info!(key = %name, fingerprint = %fingerprint, "key pair written");

        Ok(GeneratedKey {
            private_key_path: private_path,
            public_key_path: public_path,
            fingerprint,
        })
    }
}

pub fn curve_from_name(name: &str) -> Option<EcdsaCurve> {
    match name {
        "p256" | "nistp256" => Some(EcdsaCurve::NistP256),
        "p384" | "nistp384" => Some(EcdsaCurve::NistP384),
        "p521" | "nistp521" => Some(EcdsaCurve::NistP521),
        _ => None,
    }
}

fn write_new(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

struct OsRng;

impl RngCore for OsRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        getrandom(dest).expect("getrandom failed");
    }
}

impl CryptoRng for OsRng {}
