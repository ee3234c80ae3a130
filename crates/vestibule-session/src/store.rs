use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use vestibule_core::{VestibuleError, VestibuleResult};

/// The persisted password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    /// Argon2 PHC string.
    pub password_hash: String,
    /// Last time the password was set.
    pub updated_at: DateTime<Utc>,
}

/// Where the gateway password hash lives between restarts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The stored credential, or `None` before first setup.
    async fn load(&self) -> VestibuleResult<Option<StoredCredential>>;
    /// Replace the stored credential.
    async fn save(&self, credential: &StoredCredential) -> VestibuleResult<()>;
}

/// JSON file on disk. Written to a temp file and renamed so a crash never
/// leaves a half-written credential.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Open the store in `dir`, creating it if needed.
    pub async fn new(dir: PathBuf) -> VestibuleResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            path: dir.join("credentials.json"),
        })
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> VestibuleResult<Option<StoredCredential>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let credential: StoredCredential = serde_json::from_str(&data).map_err(|e| {
            VestibuleError::Config(format!(
                "Failed to parse credentials at {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(credential))
    }

    async fn save(&self, credential: &StoredCredential) -> VestibuleResult<()> {
        let json = serde_json::to_string_pretty(credential)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Keeps the credential in memory only. Used in tests and for ephemeral runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<StoredCredential>>,
}

impl MemoryCredentialStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> VestibuleResult<Option<StoredCredential>> {
        Ok(self.credential.lock().clone())
    }

    async fn save(&self, credential: &StoredCredential) -> VestibuleResult<()> {
        *self.credential.lock() = Some(credential.clone());
        Ok(())
    }
}
