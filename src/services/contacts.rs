//! Notification contacts for finished jobs.
//!
//! A JSON object on disk maps user id → sealed email address. The first
//! address stored for a user wins.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::services::encryption::{EncryptionError, EncryptionService};

pub struct ContactBook {
    path: PathBuf,
    crypto: Arc<EncryptionService>,
    write_lock: Mutex<()>,
}

impl ContactBook {
    pub fn new(path: impl Into<PathBuf>, crypto: Arc<EncryptionService>) -> Self {
        Self {
            path: path.into(),
            crypto,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, ContactError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Store an address for `user_id`. Returns `false` when one already exists.
    pub async fn store(&self, user_id: &str, email: &str) -> Result<bool, ContactError> {
        let _guard = self.write_lock.lock().await;
        let mut contacts = self.load().await?;
        if contacts.contains_key(user_id) {
            return Ok(false);
        }
        contacts.insert(user_id.to_string(), self.crypto.seal(email)?);

        let serialized = serde_json::to_string(&contacts)?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, serialized).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        info!(user_id, "Stored notification contact");
        Ok(true)
    }

    pub async fn lookup(&self, user_id: &str) -> Result<Option<String>, ContactError> {
        let contacts = self.load().await?;
        let Some(sealed) = contacts.get(user_id) else {
            warn!(user_id, "No notification contact on file");
            return Ok(None);
        };
        Ok(Some(self.crypto.open(sealed)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("Contact file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Contact file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}
