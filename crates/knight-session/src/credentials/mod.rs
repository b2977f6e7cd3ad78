//! Encrypted, crash-safe persistence of session credentials.
//!
//! Layout per identity under the store directory:
//! - `{id}.json`: live encrypted blob
//! - `{id}.backup.json`: previous live blob (at most one)
//! - `{id}.temp.json`: in-flight write, renamed over the live slot
//! - `{id}.creds.json`: plaintext metadata sidecar
//!
//! Nothing here returns an error to the caller: failures are logged and
//! surface as `false` / `None`.

mod cipher;


pub use cipher::{CredentialKey, EncryptedBlob, BLOB_VERSION, KEY_ENV};

use chrono::{DateTime, Utc};
use knight_core::{config::is_valid_session_id, error::KnightError};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Sidecar format version.
pub const STORE_VERSION: &str = "1.0.0";

/// Diagnostic metadata written next to each live blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub platform: String,
    pub version: String,
}

/// Encrypted on-disk credential store.
pub struct CredentialStore {
    dir: PathBuf,
    key: CredentialKey,
    minimize_local_state: bool,
}

impl CredentialStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>, key: CredentialKey) -> Self {
        Self {
            dir: dir.into(),
            key,
            minimize_local_state: false,
        }
    }

    /// Skip backups when `true`.
    pub fn minimize_local_state(mut self, minimize: bool) -> Self {
        self.minimize_local_state = minimize;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn live_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn backup_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.backup.json"))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.temp.json"))
    }

    fn info_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.creds.json"))
    }

    /// Encrypt and persist `record` under `id`.
    pub async fn save<T: Serialize>(&self, id: &str, record: &T) -> bool {
        match self.try_save(id, record).await {
            Ok(()) => {
                debug!("credentials: saved '{id}'");
                true
            }
            Err(e) => {
                warn!("credentials: save of '{id}' failed: {e}");
                false
            }
        }
    }

    /// Load and decrypt the record for `id`, recovering from the backup if needed.
    pub async fn load<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        if let Err(e) = validate_id(id) {
            warn!("credentials: {e}");
            return None;
        }

        let live = self.live_path(id);
        if exists(&live).await {
            match self.read_blob(&live).await {
                Ok(record) => return Some(record),
                Err(e) => warn!("credentials: live blob for '{id}' unreadable: {e}"),
            }
        }

        let backup = self.backup_path(id);
        if !exists(&backup).await {
            return None;
        }
        match self.read_blob(&backup).await {
            Ok(record) => {
                match self.promote_backup(id).await {
                    Ok(()) => info!("credentials: restored '{id}' from backup"),
                    Err(e) => warn!("credentials: backup promotion for '{id}' failed: {e}"),
                }
                Some(record)
            }
            Err(e) => {
                warn!("credentials: backup for '{id}' unreadable: {e}");
                None
            }
        }
    }

    /// Read the metadata sidecar for `id`.
    pub async fn session_info(&self, id: &str) -> Option<SessionInfo> {
        validate_id(id).ok()?;
        let content = fs::read_to_string(self.info_path(id)).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Identities with a live blob, sorted.
    pub async fn list_sessions(&self) -> Vec<String> {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".json").filter(|s| !s.contains('.')) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids
    }

    /// Remove every file stored for `id`. Returns `true` if anything was removed.
    pub async fn clear(&self, id: &str) -> bool {
        if validate_id(id).is_err() {
            return false;
        }
        let mut removed = false;
        for path in [
            self.live_path(id),
            self.backup_path(id),
            self.temp_path(id),
            self.info_path(id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("credentials: failed to remove {}: {e}", path.display()),
            }
        }
        removed
    }

    async fn try_save<T: Serialize>(&self, id: &str, record: &T) -> Result<(), KnightError> {
        validate_id(id)?;
        fs::create_dir_all(&self.dir).await?;

        let live = self.live_path(id);
        if !self.minimize_local_state && exists(&live).await {
            self.backup_live(id).await;
        }

        let plaintext = Zeroizing::new(serde_json::to_vec(record)?);
        let blob = EncryptedBlob::seal(&self.key, &plaintext)?;
        let bytes = serde_json::to_vec(&blob)?;
        write_atomic(&self.temp_path(id), &live, &bytes).await?;

        if let Err(e) = self.write_info(id).await {
            warn!("credentials: sidecar for '{id}' not written: {e}");
        }
        Ok(())
    }

    async fn backup_live(&self, id: &str) {
        if let Err(e) = self.try_backup_live(id).await {
            warn!("credentials: backup of '{id}' skipped: {e}");
        }
    }

    /// Copy the live blob to the backup slot, but only if it still decrypts;
    /// a corrupt live blob must not displace a good backup.
    async fn try_backup_live(&self, id: &str) -> Result<(), KnightError> {
        let bytes = fs::read(self.live_path(id)).await?;
        let blob: EncryptedBlob = serde_json::from_slice(&bytes)?;
        blob.open(&self.key)?;
        let tmp = self.dir.join(format!("{id}.backup.temp.json"));
        write_atomic(&tmp, &self.backup_path(id), &bytes).await
    }

    async fn promote_backup(&self, id: &str) -> Result<(), KnightError> {
        let bytes = fs::read(self.backup_path(id)).await?;
        write_atomic(&self.temp_path(id), &self.live_path(id), &bytes).await
    }

    async fn read_blob<T: DeserializeOwned>(&self, path: &Path) -> Result<T, KnightError> {
        let bytes = fs::read(path).await?;
        let blob: EncryptedBlob = serde_json::from_slice(&bytes)?;
        let plaintext = blob.open(&self.key)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn write_info(&self, id: &str) -> Result<(), KnightError> {
        let now = Utc::now();
        let created = self.session_info(id).await.map(|i| i.created).unwrap_or(now);
        let info = SessionInfo {
            id: id.to_string(),
            created,
            last_update: now,
            platform: std::env::consts::OS.to_string(),
            version: STORE_VERSION.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&info)?;
        fs::write(self.info_path(id), bytes).await?;
        Ok(())
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Write `bytes` to `tmp` (owner-only), flush to disk, then rename over `dest`.
async fn write_atomic(tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<(), KnightError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, dest).await?;
    Ok(())
}

/// Identities become file names; keep them to a safe alphabet.
fn validate_id(id: &str) -> Result<(), KnightError> {
    if is_valid_session_id(id) {
        Ok(())
    } else {
        Err(KnightError::Credentials(format!(
            "invalid session id '{id}'"
        )))
    }
}

/// New session identifier: `{prefix}-{base36 unix millis}-{8 hex}`.
pub fn generate_session_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut random = [0u8; 4];
    OsRng.fill_bytes(&mut random);
    format!("{prefix}-{}-{}", to_base36(millis), hex::encode(random))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
