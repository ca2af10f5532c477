//! Credential storage
//!
//! Holds the access/refresh token pair for token-mode deployments.
//! The file-backed store writes ~/.leadflow/credentials.json.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use crate::Result;
use crate::error::Error;

/// Access and refresh token, always stored together
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialPair {
    /// Bearer token attached to API requests
    pub access_token: String,

    /// Longer-lived token used for silent refresh
    pub refresh_token: String,

    /// Token type (usually "bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// When the pair was obtained
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl CredentialPair {
    /// Build a pair, rejecting half-empty credentials
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Result<Self> {
        let pair = Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
            issued_at: Utc::now(),
        };
        pair.ensure_complete()?;
        Ok(pair)
    }

    fn ensure_complete(&self) -> Result<()> {
        if self.access_token.trim().is_empty() || self.refresh_token.trim().is_empty() {
            return Err(Error::Auth(
                "credential pair must carry both an access and a refresh token".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Persistence for the credential pair.
///
/// Only the session manager and the HTTP client's refresh step write to it.
pub trait TokenStore: Send + Sync {
    /// Load the stored pair, if any
    fn load(&self) -> Result<Option<CredentialPair>>;

    /// Replace the stored pair
    fn save(&self, pair: &CredentialPair) -> Result<()>;

    /// Remove any stored pair
    fn clear(&self) -> Result<()>;
}

/// Get the default credentials file path
pub fn credentials_path() -> PathBuf {
    crate::config::config_dir().join("credentials.json")
}

/// JSON file token store
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileTokenStore {
    fn default() -> Self {
        Self::new(credentials_path())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<CredentialPair>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let pair: CredentialPair = serde_json::from_str(&content)?;

        // A half-written pair is as good as none.
        if pair.ensure_complete().is_err() {
            tracing::warn!(path = ?self.path, "Discarding incomplete stored credentials");
            self.clear()?;
            return Ok(None);
        }

        Ok(Some(pair))
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        pair.ensure_complete()?;

        // Create parent directory
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(pair)?;
        std::fs::write(&self.path, content)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// In-memory token store for ephemeral sessions and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    inner: Arc<RwLock<Option<CredentialPair>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a pair
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(pair))),
        }
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Other("token store lock poisoned".to_string())
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<CredentialPair>> {
        Ok(self.inner.read().map_err(poisoned)?.clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        pair.ensure_complete()?;
        *self.inner.write().map_err(poisoned)? = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.inner.write().map_err(poisoned)? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn temp_store() -> (tempfile::TempDir, FileTokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested").join("credentials.json"));
        (dir, store)
    }

    #[test]
    fn test_pair_requires_both_tokens() {
        assert_ok!(CredentialPair::new("access", "refresh"));
        assert_err!(CredentialPair::new("access", ""));
        assert_err!(CredentialPair::new("  ", "refresh"));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let pair = CredentialPair::new("secret-access", "secret-refresh").unwrap();
        let debug = format!("{:?}", pair);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_file_store_missing_file() {
        let (_dir, store) = temp_store();
        assert!(store.load().unwrap().is_none());
        assert_ok!(store.clear());
    }

    #[test]
    fn test_file_store_save_load_clear() {
        let (_dir, store) = temp_store();
        let pair = CredentialPair::new("a", "r").unwrap();

        store.save(&pair).unwrap();
        assert_eq!(store.load().unwrap(), Some(pair));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = temp_store();
        store.save(&CredentialPair::new("a", "r").unwrap()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_discards_half_pair() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), r#"{"access_token": "a", "refresh_token": ""}"#).unwrap();

        assert!(store.load().unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_accepts_backend_token_shape() {
        let (_dir, store) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"access_token": "a", "refresh_token": "r", "token_type": "bearer"}"#,
        )
        .unwrap();

        let pair = store.load().unwrap().unwrap();
        assert_eq!(pair.access_token, "a");
        assert_eq!(pair.refresh_token, "r");
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryTokenStore::new();
        let other = store.clone();

        store.save(&CredentialPair::new("a", "r").unwrap()).unwrap();
        assert_eq!(other.load().unwrap().unwrap().access_token, "a");

        other.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
