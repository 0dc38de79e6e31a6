//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unibox_shared::constants::{AUTO_BACKUP_DEFAULT_MB, AUTO_BACKUP_UNLIMITED_MB};
use unibox_shared::protocol::ContentBlock;
use unibox_shared::types::{CloudService, Direction, DownloadingState, OperatingMode, PluginConnection};

use crate::settings::keys;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message about to be recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub direction: Direction,
    pub connection: PluginConnection,
    /// Sender identity, scoped to the conversation.
    pub sender_key: String,
    /// Deduplication id; unique together with `sender_key`.
    pub external_id: String,
    pub contents: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
}

/// A message as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    /// Ledger-assigned, monotonically increasing id.
    pub local_id: i64,
    pub direction: Direction,
    pub connection: PluginConnection,
    pub sender_key: String,
    pub external_id: String,
    pub contents: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
    /// Once true, never reset.
    pub verified: bool,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub local_id: i64,
    /// `false` when an identical message was already recorded.
    pub inserted: bool,
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

/// Download / backup bookkeeping for one attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTransferRecord {
    pub file_id: i64,
    pub message_id: Option<i64>,
    pub name: String,
    pub url: Option<String>,
    pub local_path: Option<String>,
    pub size: u64,
    pub cloud_type: Option<CloudService>,
    pub cloud_id: Option<String>,
    pub state: DownloadingState,
}

impl FileTransferRecord {
    pub fn has_cloud_copy(&self) -> bool {
        self.cloud_type.is_some() && self.cloud_id.is_some()
    }
}

/// Fields for a file row that is not attached to a message block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewFile {
    pub message_id: Option<i64>,
    pub name: String,
    pub url: Option<String>,
    pub local_path: Option<String>,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Relay mapping
// ---------------------------------------------------------------------------

/// How a conversation is addressed on the relay path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMapping {
    pub connection: PluginConnection,
    /// Origin uid on the remote sender device.
    pub uid: String,
    /// Push token of the remote sender device.
    pub from: String,
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Typed view over the persisted key-value settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub operating_mode: OperatingMode,
    pub push_enabled: bool,
    pub push_token: Option<String>,
    pub push_target_tokens: Vec<String>,
    pub cloud_service: CloudService,
    pub auto_backup: bool,
    /// Size threshold in MiB; [`AUTO_BACKUP_UNLIMITED_MB`] lifts the limit.
    pub auto_backup_max_size_mb: f64,
    /// Cloud credential entries, keyed by their full settings key.
    pub credentials: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            operating_mode: OperatingMode::Normal,
            push_enabled: false,
            push_token: None,
            push_target_tokens: Vec::new(),
            cloud_service: CloudService::None,
            auto_backup: false,
            auto_backup_max_size_mb: AUTO_BACKUP_DEFAULT_MB,
            credentials: HashMap::new(),
        }
    }
}

impl Settings {
    /// Build from raw rows. Unparseable values fall back to their defaults.
    pub fn from_map(raw: &HashMap<String, String>) -> Self {
        let mut settings = Self::default();

        if let Some(mode) = raw
            .get(keys::OPERATING_MODE)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(OperatingMode::from_code)
        {
            settings.operating_mode = mode;
        }
        if let Some(v) = raw.get(keys::PUSH_ENABLED) {
            settings.push_enabled = parse_bool(v);
        }
        settings.push_token = raw.get(keys::PUSH_TOKEN).filter(|t| !t.is_empty()).cloned();
        if let Some(v) = raw.get(keys::PUSH_TARGET_TOKENS) {
            match serde_json::from_str::<Vec<String>>(v) {
                Ok(tokens) => settings.push_target_tokens = tokens,
                Err(e) => tracing::warn!(error = %e, "ignoring malformed push target tokens"),
            }
        }
        if let Some(service) = raw
            .get(keys::CLOUD_SERVICE)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(CloudService::from_code)
        {
            settings.cloud_service = service;
        }
        if let Some(v) = raw.get(keys::AUTO_BACKUP) {
            settings.auto_backup = parse_bool(v);
        }
        if let Some(mb) = raw
            .get(keys::AUTO_BACKUP_MAX_SIZE_MB)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|mb| mb.is_finite() && *mb >= 0.0)
        {
            settings.auto_backup_max_size_mb = mb;
        }

        settings.credentials = raw
            .iter()
            .filter(|(k, v)| keys::is_credential(k) && !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        settings
    }

    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }

    /// Byte limit for auto-backup candidates, `None` when unlimited.
    pub fn auto_backup_limit_bytes(&self) -> Option<u64> {
        if self.auto_backup_max_size_mb >= AUTO_BACKUP_UNLIMITED_MB {
            None
        } else {
            Some((self.auto_backup_max_size_mb * 1024.0 * 1024.0) as u64)
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_for_empty_store() {
        let s = Settings::from_map(&HashMap::new());
        assert_eq!(s, Settings::default());
        assert_eq!(s.auto_backup_limit_bytes(), Some(10 * 1024 * 1024));
    }

    #[test]
    fn parses_typed_values() {
        let s = Settings::from_map(&raw(&[
            ("operating_mode", "2"),
            ("push_enabled", "true"),
            ("push_target_tokens", r#"["a","b"]"#),
            ("cloud_service", "1003"),
            ("auto_backup_max_size_mb", "100"),
            ("tencent_cos_bucket", "bkt"),
            ("unrelated", "x"),
        ]));
        assert_eq!(s.operating_mode, OperatingMode::Relay);
        assert!(s.push_enabled);
        assert_eq!(s.push_target_tokens, vec!["a", "b"]);
        assert_eq!(s.cloud_service, CloudService::TencentCos);
        assert_eq!(s.auto_backup_limit_bytes(), None);
        assert_eq!(s.credential("tencent_cos_bucket"), Some("bkt"));
        assert!(s.credential("unrelated").is_none());
    }

    #[test]
    fn malformed_values_fall_back() {
        let s = Settings::from_map(&raw(&[
            ("operating_mode", "9"),
            ("push_target_tokens", "not json"),
            ("cloud_service", "abc"),
            ("auto_backup_max_size_mb", "-3"),
        ]));
        assert_eq!(s.operating_mode, OperatingMode::Normal);
        assert!(s.push_target_tokens.is_empty());
        assert_eq!(s.cloud_service, CloudService::None);
        assert_eq!(s.auto_backup_max_size_mb, AUTO_BACKUP_DEFAULT_MB);
    }
}
