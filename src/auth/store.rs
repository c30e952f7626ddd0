use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::platform::PlatformKind;

/// Persisted credentials for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Expiry as epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: None,
            scope: Vec::new(),
            user_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_expires_in(mut self, expires_in_secs: i64) -> Self {
        self.expires_at = Some(Utc::now().timestamp_millis() + expires_in_secs * 1000);
        self
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|ms| chrono::TimeZone::timestamp_millis_opt(&Utc, ms).single())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map_or(false, |exp| exp <= Utc::now().timestamp_millis())
    }
}

/// Parse failures are distinct from absence: a corrupt file must never be
/// silently treated as "not logged in".
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("Token file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Token file at {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type TokenStoreResult<T> = Result<T, TokenStoreError>;

/// Result of persisting a record
#[derive(Debug, Clone, PartialEq)]
pub struct StoreReport {
    /// Set when the stored record has no refresh token and none could be
    /// inherited; the session will not survive access-token expiry.
    pub degraded: bool,
}

/// Atomic on-disk persistence for platform token records.
///
/// The whole map is serialized to one JSON file, written via a temp file
/// and rename so a crash never leaves a half-written store.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location under the user config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("polychat").join("tokens.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full map. A missing file yields an empty map; a corrupt
    /// file is an error.
    pub fn load_all(&self) -> TokenStoreResult<HashMap<String, TokenRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No token file yet");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|source| TokenStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn get(&self, platform: PlatformKind) -> TokenStoreResult<Option<TokenRecord>> {
        Ok(self.load_all()?.remove(platform.as_str()))
    }

    /// Persist a record. A record arriving without a refresh token inherits
    /// the one already on disk; if neither exists the write still succeeds
    /// but is reported as degraded.
    pub fn store(
        &self,
        platform: PlatformKind,
        mut record: TokenRecord,
    ) -> TokenStoreResult<StoreReport> {
        let mut all = self.load_all()?;

        if record.refresh_token.is_none() {
            if let Some(previous) = all
                .get(platform.as_str())
                .and_then(|r| r.refresh_token.clone())
            {
                debug!(platform = %platform, "Inheriting refresh token from previous record");
                record.refresh_token = Some(previous);
            }
        }
        let degraded = record.refresh_token.is_none();
        if degraded {
            warn!(
                platform = %platform,
                "Storing access token without refresh token; session cannot be renewed"
            );
        }

        all.insert(platform.as_str().to_string(), record);
        self.write_atomic(&all)?;
        info!(platform = %platform, path = %self.path.display(), "Token record persisted");
        Ok(StoreReport { degraded })
    }

    /// Remove only the given platform's record; returns true if one existed.
    pub fn clear(&self, platform: PlatformKind) -> TokenStoreResult<bool> {
        let mut all = self.load_all()?;
        let removed = all.remove(platform.as_str()).is_some();
        if removed {
            self.write_atomic(&all)?;
            info!(platform = %platform, "Token record cleared");
        }
        Ok(removed)
    }

    fn write_atomic(&self, all: &HashMap<String, TokenRecord>) -> TokenStoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_string_pretty(all).map_err(|source| TokenStoreError::Parse {
            path: tmp.clone(),
            source,
        })?;
        std::fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("tokens.json"))
    }

    #[test]
    fn missing_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.get(PlatformKind::Twitch).unwrap().is_none());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_a_parse_error_not_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{not json").unwrap();

        match store.get(PlatformKind::Twitch) {
            Err(TokenStoreError::Parse { .. }) => {}
            other => panic!("expected parse error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn store_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let record = TokenRecord::new("access".to_string(), Some("refresh".to_string()))
            .with_expires_in(3600);
        let report = store.store(PlatformKind::Twitch, record).unwrap();
        assert!(!report.degraded);

        let loaded = store.get(PlatformKind::Twitch).unwrap().unwrap();
        assert_eq!(loaded.access_token, "access");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
        assert!(!loaded.is_expired());
        // No stray temp file after the rename
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn file_layout_is_camel_case_with_epoch_ms() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut record = TokenRecord::new("A1".to_string(), Some("R1".to_string()));
        record.expires_at = Some(1_700_000_000_000);
        store.store(PlatformKind::Twitch, record).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["twitch"]["accessToken"], "A1");
        assert_eq!(raw["twitch"]["refreshToken"], "R1");
        assert_eq!(raw["twitch"]["expiresAt"], 1_700_000_000_000i64);
        assert!(raw["twitch"]["updatedAt"].is_string());

        let loaded = store.get(PlatformKind::Twitch).unwrap().unwrap();
        assert_eq!(loaded.access_token, "A1");
        assert_eq!(loaded.refresh_token.as_deref(), Some("R1"));
        assert_eq!(loaded.expires_at, Some(1_700_000_000_000));
    }

    #[test]
    fn missing_refresh_token_inherits_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .store(
                PlatformKind::Twitch,
                TokenRecord::new("old".to_string(), Some("keep-me".to_string())),
            )
            .unwrap();
        let report = store
            .store(
                PlatformKind::Twitch,
                TokenRecord::new("new".to_string(), None),
            )
            .unwrap();
        assert!(!report.degraded);

        let loaded = store.get(PlatformKind::Twitch).unwrap().unwrap();
        assert_eq!(loaded.access_token, "new");
        assert_eq!(loaded.refresh_token.as_deref(), Some("keep-me"));
    }

    #[test]
    fn no_refresh_token_anywhere_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let report = store
            .store(
                PlatformKind::Youtube,
                TokenRecord::new("solo".to_string(), None),
            )
            .unwrap();
        assert!(report.degraded);
    }

    #[test]
    fn clear_removes_only_the_named_platform() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .store(
                PlatformKind::Twitch,
                TokenRecord::new("a".to_string(), Some("r".to_string())),
            )
            .unwrap();
        store
            .store(
                PlatformKind::Youtube,
                TokenRecord::new("b".to_string(), Some("r2".to_string())),
            )
            .unwrap();

        assert!(store.clear(PlatformKind::Twitch).unwrap());
        assert!(store.get(PlatformKind::Twitch).unwrap().is_none());
        assert!(store.get(PlatformKind::Youtube).unwrap().is_some());
        assert!(!store.clear(PlatformKind::Twitch).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .store(
                PlatformKind::Twitch,
                TokenRecord::new("a".to_string(), Some("r".to_string())),
            )
            .unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
