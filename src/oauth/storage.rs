//! Credential Store
//!
//! Persists per-user provider tokens to disk so they survive restarts.
//! Each user gets one JSON file named after the SHA-256 of their id.
//! Writes go through a temp file in the same directory followed by a rename,
//! so a reader never observes a half-written record.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Seconds before `expires_at` at which an access token stops being used
pub const EXPIRY_MARGIN_SECS: u64 = 60;

/// Current Unix time in seconds
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Token payload returned by the provider's token endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenGrant {
    /// Access token
    pub access_token: String,
    /// Refresh token, often omitted on refresh responses
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Token type (usually "Bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

/// Stored provider credentials for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Owner of the record, kept for operators reading the file
    #[serde(default)]
    pub user_id: String,
    /// Access token
    pub access_token: String,
    /// Refresh token (empty when the provider never issued one)
    #[serde(default)]
    pub refresh_token: String,
    /// Expiry as Unix timestamp; 0 means unknown
    pub expires_at: u64,
    /// Token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl CredentialRecord {
    /// Build a record from a provider grant. `expires_at` is `now + expires_in`,
    /// or 0 when the provider did not say.
    pub fn from_grant(user_id: &str, grant: &TokenGrant, now: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone().unwrap_or_default(),
            expires_at: grant.expires_in.map_or(0, |secs| now.saturating_add(secs)),
            token_type: grant.token_type.clone(),
            scope: grant.scope.clone(),
        }
    }

    /// Whether the access token can be used at `now`.
    ///
    /// Fresh means strictly before `expires_at - 60`. An unknown expiry (0)
    /// is never fresh, so such records always go through a refresh.
    pub fn is_fresh_at(&self, now: u64) -> bool {
        self.expires_at != 0 && now < self.expires_at.saturating_sub(EXPIRY_MARGIN_SECS)
    }

    /// Whether the access token can be used right now
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(unix_now())
    }
}

/// File-backed credential store keyed by user id
#[derive(Debug)]
pub struct CredentialStore {
    /// Base directory for credential files
    base_dir: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).map_err(|e| {
                Error::Storage(format!(
                    "Failed to create credential dir {}: {e}",
                    base_dir.display()
                ))
            })?;
        }

        Ok(Self { base_dir })
    }

    /// File name for a user. User ids are untrusted, so they are hashed
    /// rather than used as path components.
    fn storage_key(user_id: &str) -> String {
        hex::encode(Sha256::digest(user_id.as_bytes()))
    }

    /// Path of a user's credential file
    pub fn record_path(&self, user_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", Self::storage_key(user_id)))
    }

    /// Persist a provider grant for a user, replacing any previous record
    pub fn save(&self, user_id: &str, grant: &TokenGrant) -> Result<CredentialRecord> {
        if grant.expires_in.is_none() {
            warn!(user_id = %user_id, "Token response has no expires_in, storing expires_at = 0");
        }
        let record = CredentialRecord::from_grant(user_id, grant, unix_now());
        self.write_record(&record)?;
        Ok(record)
    }

    /// Atomically write a record
    pub fn write_record(&self, record: &CredentialRecord) -> Result<()> {
        let path = self.record_path(&record.user_id);
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Storage(format!("Failed to serialize credentials: {e}")))?;

        let mut tmp = NamedTempFile::new_in(&self.base_dir)
            .map_err(|e| Error::Storage(format!("Failed to create temp file: {e}")))?;
        tmp.write_all(content.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::Storage(format!("Failed to write credentials: {e}")))?;

        // NamedTempFile is created 0600 on unix, and rename keeps the mode.
        tmp.persist(&path)
            .map_err(|e| Error::Storage(format!("Failed to replace credential file: {e}")))?;

        info!(user_id = %record.user_id, expires_at = record.expires_at, "Saved credentials");
        Ok(())
    }

    /// Load a user's record. Missing, unreadable or malformed records all
    /// yield `None`, which sends the user back through consent.
    pub fn load(&self, user_id: &str) -> Option<CredentialRecord> {
        let path = self.record_path(user_id);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(user_id = %user_id, "No stored credentials");
                return None;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to read credential file");
                return None;
            }
        };

        match serde_json::from_str::<CredentialRecord>(&content) {
            Ok(record) if record.access_token.is_empty() => {
                warn!(user_id = %user_id, "Stored credentials have no access token");
                None
            }
            Ok(mut record) => {
                if record.user_id.is_empty() {
                    record.user_id = user_id.to_string();
                }
                Some(record)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to parse stored credentials");
                None
            }
        }
    }
}
