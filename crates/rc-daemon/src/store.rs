//! Encrypted JSON file store.
//!
//! Records live in one JSON document next to the list of consumed invite
//! codes. Secrets inside records are sealed with a key kept in a separate
//! file, created on first use.

use async_trait::async_trait;
use rc_core::crypto::{EncryptionKey, SecretBox};
use rc_core::store::{AccountStore, Result, StoreError};
use rc_core::types::AccountRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    accounts: Vec<AccountRecord>,
    #[serde(default)]
    used_invites: Vec<String>,
}

pub struct JsonFileStore {
    path: PathBuf,
    secrets: SecretBox,
    invite_codes: HashSet<String>,
    /// Serializes read-modify-write cycles on the document.
    io_lock: Mutex<()>,
}

impl std::fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore")
            .field("path", &self.path)
            .field("invite_codes", &self.invite_codes.len())
            .finish_non_exhaustive()
    }
}

impl JsonFileStore {
    /// Open the store, creating the key file when it does not exist yet.
    pub async fn open(
        path: impl Into<PathBuf>,
        key_path: impl AsRef<Path>,
        invite_codes: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let key = load_or_create_key(key_path.as_ref()).await?;
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        Ok(Self {
            path,
            secrets: SecretBox::new(key),
            invite_codes: invite_codes
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            io_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(StoreFile::default()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(io_err(e)),
        }
    }

    /// Write through a temporary file so a crash never leaves half a document.
    async fn write(&self, file: &StoreFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), accounts = file.accounts.len(), "store written");
        Ok(())
    }
}

#[async_trait]
impl AccountStore for JsonFileStore {
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.read().await?.accounts)
    }

    async fn save_accounts(&self, records: &[AccountRecord]) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        let mut file = self.read().await?;
        file.accounts = records.to_vec();
        self.write(&file).await
    }

    fn encrypt_secret(&self, plaintext: &str) -> Result<String> {
        Ok(self.secrets.seal_str(plaintext)?)
    }

    fn decrypt_secret(&self, sealed: &str) -> Result<String> {
        Ok(self.secrets.open_str(sealed)?)
    }

    async fn consume_invite(&self, code: &str) -> Result<bool> {
        let code = code.trim();
        if !self.invite_codes.contains(code) {
            return Ok(false);
        }
        let _guard = self.io_lock.lock().await;
        let mut file = self.read().await?;
        if file.used_invites.iter().any(|used| used == code) {
            return Ok(false);
        }
        file.used_invites.push(code.to_string());
        self.write(&file).await?;
        Ok(true)
    }
}

async fn load_or_create_key(path: &Path) -> Result<EncryptionKey> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(EncryptionKey::from_hex(text.trim())?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = EncryptionKey::generate()?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            tokio::fs::write(path, key.to_hex().as_bytes())
                .await
                .map_err(io_err)?;
            restrict_permissions(path).await?;
            info!(path = %path.display(), "generated store encryption key");
            Ok(key)
        }
        Err(e) => Err(io_err(e)),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(io_err)
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}
