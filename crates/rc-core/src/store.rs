//! Account persistence seam.
//!
//! The supervisor is the only writer. Stores own the encryption of secrets;
//! records carry only sealed hex strings.

use crate::crypto::{CryptoError, SecretBox};
use crate::types::AccountRecord;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>>;

    /// Replace the persisted record set.
    async fn save_accounts(&self, records: &[AccountRecord]) -> Result<()>;

    fn encrypt_secret(&self, plaintext: &str) -> Result<String>;

    fn decrypt_secret(&self, sealed: &str) -> Result<String>;

    /// A fresh opaque token for owner-facing access.
    fn issue_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Consume a one-shot invite code. `false` when it is unknown or used.
    async fn consume_invite(&self, code: &str) -> Result<bool>;
}

/// In-process store used by tests and ephemeral runs.
pub struct MemoryStore {
    records: Mutex<Vec<AccountRecord>>,
    invites: Mutex<HashSet<String>>,
    secrets: SecretBox,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Result<Self> {
        Ok(Self {
            records: Mutex::new(Vec::new()),
            invites: Mutex::new(HashSet::new()),
            secrets: SecretBox::ephemeral()?,
            saves: AtomicUsize::new(0),
        })
    }

    pub fn with_records(self, records: Vec<AccountRecord>) -> Self {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records;
        self
    }

    pub fn with_invites<I, S>(self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(codes.into_iter().map(Into::into));
        self
    }

    /// Snapshot of what was last saved.
    pub fn records(&self) -> Vec<AccountRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>> {
        Ok(self.records())
    }

    async fn save_accounts(&self, records: &[AccountRecord]) -> Result<()> {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn encrypt_secret(&self, plaintext: &str) -> Result<String> {
        Ok(self.secrets.seal_str(plaintext)?)
    }

    fn decrypt_secret(&self, sealed: &str) -> Result<String> {
        Ok(self.secrets.open_str(sealed)?)
    }

    async fn consume_invite(&self, code: &str) -> Result<bool> {
        Ok(self
            .invites
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(code))
    }
}
