use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::Settings;

/// Persisted settings keys.
pub mod keys {
    pub const OPERATING_MODE: &str = "operating_mode";
    pub const PUSH_ENABLED: &str = "push_enabled";
    pub const PUSH_TOKEN: &str = "push_token";
    /// JSON array of remote device tokens.
    pub const PUSH_TARGET_TOKENS: &str = "push_target_tokens";
    pub const CLOUD_SERVICE: &str = "cloud_service";
    pub const AUTO_BACKUP: &str = "auto_backup";
    pub const AUTO_BACKUP_MAX_SIZE_MB: &str = "auto_backup_max_size_mb";

    pub const CREDENTIAL_PREFIXES: &[&str] =
        &["google_drive_", "onedrive_", "tencent_cos_", "qiniu_kodo_"];

    pub fn is_credential(key: &str) -> bool {
        CREDENTIAL_PREFIXES.iter().any(|p| key.starts_with(p))
    }
}

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn all_settings(&self) -> Result<HashMap<String, String>> {
        let mut stmt = self.conn().prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut map = HashMap::new();
        for row in rows {
            let (k, v): (String, String) = row?;
            map.insert(k, v);
        }
        Ok(map)
    }

    pub fn load_settings(&self) -> Result<Settings> {
        Ok(Settings::from_map(&self.all_settings()?))
    }

    /// Persist a refreshed push token. Returns `false` when it was already stored.
    pub fn store_push_token(&self, token: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value
             WHERE settings.value <> excluded.value",
            params![keys::PUSH_TOKEN, token],
        )?;
        Ok(changed > 0)
    }
}
