//! At-rest encryption for credential blobs.
//!
//! AES-256-GCM with a fresh nonce per save. The key lives outside the blob:
//! either `KNIGHT_CREDENTIAL_KEY` (hex) or a 0600 key file.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use knight_core::error::KnightError;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Environment variable carrying a hex-encoded key.
pub const KEY_ENV: &str = "KNIGHT_CREDENTIAL_KEY";

/// Blob format version written by this store.
pub const BLOB_VERSION: u32 = 1;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// 256-bit credential encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CredentialKey([u8; KEY_LEN]);

impl std::fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialKey(<redacted>)")
    }
}

impl CredentialKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, KnightError> {
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| KnightError::Credentials(format!("invalid key encoding: {e}")))?,
        );
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            KnightError::Credentials(format!(
                "key must be {KEY_LEN} bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Read the key file, creating it with a new random key if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, KnightError> {
        if path.exists() {
            let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                KnightError::Credentials(format!("failed to read {}: {e}", path.display()))
            })?);
            return Self::from_hex(&content);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = Self::generate();
        std::fs::write(path, key.to_hex().as_bytes())?;
        restrict_permissions(path)?;
        info!("credentials: generated new key at {}", path.display());
        Ok(key)
    }

    /// Key from `KNIGHT_CREDENTIAL_KEY` when set, otherwise from `path`.
    pub fn from_env_or_file(path: &Path) -> Result<Self, KnightError> {
        Self::from_lookup_or_file(|k| std::env::var(k).ok(), path)
    }

    pub fn from_lookup_or_file<F>(lookup: F, path: &Path) -> Result<Self, KnightError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(KEY_ENV).filter(|v| !v.trim().is_empty()) {
            Some(encoded) => Self::from_hex(&Zeroizing::new(encoded)),
            None => Self::load_or_create(path),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Encrypted credential record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub version: u32,
    /// Hex-encoded 96-bit nonce.
    pub nonce: String,
    /// Hex-encoded ciphertext with the GCM tag appended.
    pub ciphertext: String,
}

impl EncryptedBlob {
    pub fn seal(key: &CredentialKey, plaintext: &[u8]) -> Result<Self, KnightError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| KnightError::Credentials("encryption failed".into()))?;
        Ok(Self {
            version: BLOB_VERSION,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt and authenticate. Fails on a foreign key or any tampering.
    pub fn open(&self, key: &CredentialKey) -> Result<Zeroizing<Vec<u8>>, KnightError> {
        if self.version != BLOB_VERSION {
            return Err(KnightError::Credentials(format!(
                "unsupported blob version {}",
                self.version
            )));
        }
        let nonce = hex::decode(&self.nonce)
            .map_err(|e| KnightError::Credentials(format!("invalid nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(KnightError::Credentials(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = hex::decode(&self.ciphertext)
            .map_err(|e| KnightError::Credentials(format!("invalid ciphertext: {e}")))?;
        key.cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| KnightError::Credentials("authentication failed".into()))
    }
}

/// Owner-only permissions on unix, no-op elsewhere.
fn restrict_permissions(path: &Path) -> Result<(), KnightError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
