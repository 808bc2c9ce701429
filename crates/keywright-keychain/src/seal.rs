use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::Argon2;
use keyring::Entry;
use rand::RngCore;
use tracing::info;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("encryption error: {0}")]
    Crypto(String),
    #[error("not a sealed document")]
    NotSealed,
}

/// Encryption-at-rest wrapper for persisted documents.
///
/// Layout: `MAGIC || salt || nonce || AES-256-GCM ciphertext`, keyed by an
/// Argon2 derivation of the master secret.
#[derive(Clone)]
pub struct DocumentSeal {
    master: Zeroizing<String>,
}

impl std::fmt::Debug for DocumentSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSeal").finish_non_exhaustive()
    }
}

const MAGIC: &[u8; 6] = b"KWSEAL";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

impl DocumentSeal {
    pub fn new(master: Zeroizing<String>) -> Self {
        Self { master }
    }

    /// Loads the master secret from the OS keyring, creating a random one on
    /// first use.
    pub fn from_keyring(service: &str, account: &str) -> Result<Self, SealError> {
        let entry = Entry::new(service, account).map_err(|e| SealError::Keyring(e.to_string()))?;
        match entry.get_password() {
            Ok(value) => Ok(Self::new(Zeroizing::new(value))),
            Err(keyring::Error::NoEntry) => {
                let mut raw = Zeroizing::new([0u8; 32]);
                rand::thread_rng().fill_bytes(&mut raw[..]);
                let master = Zeroizing::new(hex::encode(&raw[..]));
                entry
                    .set_password(&master)
                    .map_err(|e| SealError::Keyring(e.to_string()))?;
                info!(service = %service, account = %account, "created store master secret");
                Ok(Self::new(master))
            }
            Err(e) => Err(SealError::Keyring(e.to_string())),
        }
    }

    pub fn is_sealed(data: &[u8]) -> bool {
        data.len() >= MAGIC.len() && &data[..MAGIC.len()] == MAGIC
    }

    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = derive_key(&self.master, &salt)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key[..]).map_err(|e| SealError::Crypto(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| SealError::Crypto(e.to_string()))?;
        let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + ct.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn open(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, SealError> {
        if !Self::is_sealed(data) || data.len() < MAGIC.len() + SALT_LEN + NONCE_LEN {
            return Err(SealError::NotSealed);
        }
        let salt = &data[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let nonce_start = MAGIC.len() + SALT_LEN;
        let nonce = &data[nonce_start..nonce_start + NONCE_LEN];
        let ct = &data[nonce_start + NONCE_LEN..];
        let key = derive_key(&self.master, salt)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key[..]).map_err(|e| SealError::Crypto(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map(Zeroizing::new)
            .map_err(|e| SealError::Crypto(e.to_string()))
    }
}

fn derive_key(master: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, SealError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(master.as_bytes(), salt, &mut key[..])
        .map_err(|e| SealError::Crypto(e.to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal(master: &str) -> DocumentSeal {
        DocumentSeal::new(Zeroizing::new(master.to_string()))
    }

    #[test]
    fn seal_roundtrip() {
        let sealed = seal("master").seal(b"{\"use_count\":3}").unwrap();
        assert!(DocumentSeal::is_sealed(&sealed));
        let plain = seal("master").open(&sealed).unwrap();
        assert_eq!(plain.as_slice(), b"{\"use_count\":3}");
    }

    #[test]
    fn wrong_master_is_rejected() {
        let sealed = seal("master").seal(b"{}").unwrap();
        assert!(matches!(
            seal("other").open(&sealed),
            Err(SealError::Crypto(_))
        ));
    }

    #[test]
    fn plain_json_is_not_sealed() {
        assert!(!DocumentSeal::is_sealed(b"{\"providers\":{}}"));
        assert!(matches!(seal("m").open(b"{}"), Err(SealError::NotSealed)));
    }
}
