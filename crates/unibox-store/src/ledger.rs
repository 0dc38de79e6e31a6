//! Async facade over [`Database`].
//!
//! A single connection sits behind a mutex; every call runs on the blocking
//! pool, so ledger writes are linearized.

use std::path::Path;
use std::sync::{Arc, Mutex};

use unibox_shared::types::{CloudService, DownloadingState, PluginConnection};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    FileTransferRecord, InsertOutcome, MessageDraft, NewFile, RelayMapping, Settings, StoredMessage,
};

#[derive(Clone)]
pub struct DeliveryLedger {
    db: Arc<Mutex<Database>>,
}

impl DeliveryLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    async fn with_db<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            work(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // -- messages -----------------------------------------------------------

    /// Record a message once. A duplicate resolves to the existing row.
    pub async fn insert(&self, draft: MessageDraft) -> Result<InsertOutcome> {
        self.with_db(move |db| match db.insert_message(&draft) {
            Ok(local_id) => Ok(InsertOutcome {
                local_id,
                inserted: true,
            }),
            Err(StoreError::Conflict) => {
                let local_id = db
                    .find_message_id(&draft.sender_key, &draft.external_id)?
                    .ok_or(StoreError::NotFound)?;
                tracing::debug!(
                    local_id,
                    external_id = %draft.external_id,
                    "duplicate message absorbed"
                );
                Ok(InsertOutcome {
                    local_id,
                    inserted: false,
                })
            }
            Err(e) => Err(e),
        })
        .await
    }

    pub async fn message(&self, local_id: i64) -> Result<StoredMessage> {
        self.with_db(move |db| db.get_message(local_id)).await
    }

    pub async fn set_verified(&self, local_id: i64, verified: bool) -> Result<bool> {
        self.with_db(move |db| db.set_verified(local_id, verified)).await
    }

    pub async fn is_verified(&self, local_id: i64) -> Result<bool> {
        self.with_db(move |db| db.is_verified(local_id)).await
    }

    pub async fn recent_window(
        &self,
        conversation_keys: Vec<String>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        self.with_db(move |db| db.recent_window(&conversation_keys, limit))
            .await
    }

    pub async fn delete_message(&self, local_id: i64) -> Result<bool> {
        self.with_db(move |db| db.delete_message(local_id)).await
    }

    // -- files --------------------------------------------------------------

    pub async fn add_file(&self, file: NewFile) -> Result<i64> {
        self.with_db(move |db| db.insert_file(&file)).await
    }

    pub async fn file(&self, file_id: i64) -> Result<FileTransferRecord> {
        self.with_db(move |db| db.get_file(file_id)).await
    }

    pub async fn files_for_message(&self, message_id: i64) -> Result<Vec<FileTransferRecord>> {
        self.with_db(move |db| db.files_for_message(message_id)).await
    }

    pub async fn set_download_state(&self, file_id: i64, state: DownloadingState) -> Result<()> {
        self.with_db(move |db| db.set_download_state(file_id, state))
            .await
    }

    pub async fn claim_download(&self, file_id: i64, total: u64) -> Result<bool> {
        self.with_db(move |db| db.claim_download(file_id, total)).await
    }

    pub async fn record_download_progress(&self, file_id: i64, downloaded: u64, total: u64) -> Result<bool> {
        self.with_db(move |db| db.record_download_progress(file_id, downloaded, total))
            .await
    }

    pub async fn release_download(&self, file_id: i64) -> Result<bool> {
        self.with_db(move |db| db.release_download(file_id)).await
    }

    pub async fn set_local_path(&self, file_id: i64, local_path: Option<String>) -> Result<()> {
        self.with_db(move |db| db.set_local_path(file_id, local_path.as_deref()))
            .await
    }

    pub async fn set_cloud_info(
        &self,
        file_id: i64,
        service: CloudService,
        cloud_id: String,
    ) -> Result<()> {
        self.with_db(move |db| db.set_cloud_info(file_id, service, &cloud_id))
            .await
    }

    pub async fn clear_cloud_info(&self, file_id: i64) -> Result<()> {
        self.with_db(move |db| db.clear_cloud_info(file_id)).await
    }

    pub async fn backup_candidates(&self, max_bytes: Option<u64>) -> Result<Vec<FileTransferRecord>> {
        self.with_db(move |db| db.backup_candidates(max_bytes)).await
    }

    // -- relay mappings -----------------------------------------------------

    pub async fn upsert_relay_mapping(&self, mapping: RelayMapping) -> Result<()> {
        self.with_db(move |db| db.upsert_relay_mapping(&mapping)).await
    }

    pub async fn relay_mapping(&self, connection: PluginConnection) -> Result<Option<RelayMapping>> {
        self.with_db(move |db| db.get_relay_mapping(&connection)).await
    }

    // -- settings -----------------------------------------------------------

    pub async fn settings(&self) -> Result<Settings> {
        self.with_db(|db| db.load_settings()).await
    }

    pub async fn put_setting(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.with_db(move |db| db.put_setting(&key, &value)).await
    }

    pub async fn store_push_token(&self, token: impl Into<String>) -> Result<bool> {
        let token = token.into();
        self.with_db(move |db| db.store_push_token(&token)).await
    }
}
