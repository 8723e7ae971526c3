//! Local API key storage with strict file permissions.
//!
//! The key lives in `~/.chatbaz-cursor/credentials.json` as a small JSON
//! record. The file is chmodded to owner read/write only on every save, and
//! an unreadable or corrupt file is treated the same as an absent one so a
//! damaged install degrades to "key not configured" instead of crashing the
//! proxy.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ProxyError, Result};

/// Minimum accepted key length after trimming.
const MIN_KEY_LENGTH: usize = 10;

/// Directory under the home directory holding credentials and logs.
pub(crate) const STORAGE_DIR_NAME: &str = ".chatbaz-cursor";

const CREDENTIAL_FILE_NAME: &str = "credentials.json";

/// Persisted credential record.
///
/// `created_at` is set on the first save and never changes afterwards;
/// `updated_at` reflects the most recent save. Both are milliseconds since
/// the epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// The stored API key.
    pub api_key: String,

    /// First-save timestamp in milliseconds.
    pub created_at: i64,

    /// Last-save timestamp in milliseconds.
    pub updated_at: i64,
}

/// Handles on-disk API key storage.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Creates a store backed by the given file path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Creates a store at the default location under the home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn open_default() -> Result<Self> {
        let dir = storage_dir()?;
        Ok(Self::new(dir.join(CREDENTIAL_FILE_NAME)))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted record.
    ///
    /// Returns `None` if the file does not exist. An unreadable or
    /// unparsable file is logged and also treated as absent.
    #[must_use]
    pub fn load(&self) -> Option<CredentialRecord> {
        if !self.path.exists() {
            return None;
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                error!("Failed to read credentials: {e}");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("Failed to parse credentials: {e}");
                None
            }
        }
    }

    /// Saves an API key, preserving `created_at` across saves.
    ///
    /// Creates parent directories as needed and restricts the file to owner
    /// read/write.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file I/O fails.
    pub fn save(&self, api_key: &str) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let created_at = self.load().map_or(now_ms, |existing| existing.created_at);

        let record = CredentialRecord {
            api_key: api_key.to_string(),
            created_at,
            updated_at: now_ms,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&record)?;
        fs::write(&self.path, json)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        debug!(path = %self.path.display(), "Saved credentials");

        Ok(())
    }

    /// Returns true if a record exists with a non-blank key.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.get_key().is_some()
    }

    /// Returns the trimmed stored key, or `None` if absent or blank.
    #[must_use]
    pub fn get_key(&self) -> Option<String> {
        let record = self.load()?;
        let key = record.api_key.trim();
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }

    /// Display form of the stored key that never reveals it in full.
    ///
    /// Keys of 8 characters or fewer mask every character; longer keys show
    /// the first and last 4 characters.
    #[must_use]
    pub fn masked_key(&self) -> String {
        let Some(key) = self.get_key() else {
            return "(not set)".to_string();
        };

        let count = key.chars().count();
        if count <= 8 {
            return "*".repeat(count);
        }

        let head: String = key.chars().take(4).collect();
        let tail: String = key.chars().skip(count - 4).collect();
        format!("{head}...{tail}")
    }
}

/// Returns the storage directory under the home directory.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn storage_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ProxyError::Storage("Failed to determine home directory".to_string()))?;
    Ok(home.join(STORAGE_DIR_NAME))
}

/// Accepts a candidate key only if its trimmed length is at least 10
/// characters.
#[must_use]
pub fn validate_api_key(api_key: &str) -> bool {
    api_key.trim().chars().count() >= MIN_KEY_LENGTH
}
