use chrono::Utc;
use rusqlite::params;
use rusqlite::types::Type;
use unibox_shared::types::{CloudService, DownloadingState};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::not_found;
use crate::models::{FileTransferRecord, NewFile};

const FILE_COLUMNS: &str = "file_id, message_id, name, url, local_path, size, cloud_type, cloud_id, \
                            download_state, downloaded, total";

impl Database {
    pub fn insert_file(&self, file: &NewFile) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO files (message_id, name, url, local_path, size, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file.message_id,
                file.name,
                file.url,
                file.local_path,
                file.size as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_file(&self, file_id: i64) -> Result<FileTransferRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = ?1"),
                params![file_id],
                row_to_file,
            )
            .map_err(not_found)
    }

    pub fn files_for_message(&self, message_id: i64) -> Result<Vec<FileTransferRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE message_id = ?1 ORDER BY file_id"
        ))?;
        let rows = stmt.query_map(params![message_id], row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn set_download_state(&self, file_id: i64, state: DownloadingState) -> Result<()> {
        let (tag, downloaded, total) = match state {
            DownloadingState::None => ("none", 0, 0),
            DownloadingState::Downloading { downloaded, total } => {
                ("downloading", downloaded as i64, total as i64)
            }
            DownloadingState::Done => ("done", 0, 0),
            DownloadingState::Failure => ("failure", 0, 0),
        };
        self.update_file(
            "UPDATE files SET download_state = ?2, downloaded = ?3, total = ?4 WHERE file_id = ?1",
            params![file_id, tag, downloaded, total],
        )
    }

    /// Mark a file as downloading unless a download already holds it.
    ///
    /// Returns `false` when the file is already `downloading`.
    pub fn claim_download(&self, file_id: i64, total: u64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE files SET download_state = 'downloading', downloaded = 0, total = ?2
             WHERE file_id = ?1 AND download_state <> 'downloading'",
            params![file_id, total as i64],
        )?;
        if changed == 0 {
            // Distinguish a held claim from a missing row.
            self.get_file(file_id)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Update byte counts of a claimed download. No-op once the claim is gone.
    pub fn record_download_progress(&self, file_id: i64, downloaded: u64, total: u64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE files SET downloaded = ?2, total = ?3
             WHERE file_id = ?1 AND download_state = 'downloading'",
            params![file_id, downloaded as i64, total as i64],
        )?;
        Ok(changed > 0)
    }

    /// Turn a held claim into `failure`. Returns `false` if none was held.
    pub fn release_download(&self, file_id: i64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE files SET download_state = 'failure', downloaded = 0, total = 0
             WHERE file_id = ?1 AND download_state = 'downloading'",
            params![file_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_local_path(&self, file_id: i64, local_path: Option<&str>) -> Result<()> {
        self.update_file(
            "UPDATE files SET local_path = ?2 WHERE file_id = ?1",
            params![file_id, local_path],
        )
    }

    pub fn set_cloud_info(&self, file_id: i64, service: CloudService, cloud_id: &str) -> Result<()> {
        self.update_file(
            "UPDATE files SET cloud_type = ?2, cloud_id = ?3 WHERE file_id = ?1",
            params![file_id, service.code(), cloud_id],
        )
    }

    pub fn clear_cloud_info(&self, file_id: i64) -> Result<()> {
        self.update_file(
            "UPDATE files SET cloud_type = NULL, cloud_id = NULL WHERE file_id = ?1",
            params![file_id],
        )
    }

    /// Files without a cloud copy that can be fetched, optionally bounded by size.
    pub fn backup_candidates(&self, max_bytes: Option<u64>) -> Result<Vec<FileTransferRecord>> {
        let limit = max_bytes.map(|b| b.min(i64::MAX as u64) as i64).unwrap_or(i64::MAX);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE cloud_id IS NULL
               AND (local_path IS NOT NULL OR url IS NOT NULL)
               AND size <= ?1
             ORDER BY file_id"
        ))?;
        let rows = stmt.query_map(params![limit], row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn update_file(&self, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        match self.conn().execute(sql, params)? {
            0 => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileTransferRecord> {
    let size: i64 = row.get(5)?;
    let cloud_code: Option<i64> = row.get(6)?;
    let tag: String = row.get(8)?;
    let downloaded: i64 = row.get(9)?;
    let total: i64 = row.get(10)?;

    let cloud_type = match cloud_code {
        Some(code) => Some(CloudService::from_code(code).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Integer,
                format!("unknown cloud service code {code}").into(),
            )
        })?),
        None => None,
    };

    let state = match tag.as_str() {
        "none" => DownloadingState::None,
        "downloading" => DownloadingState::Downloading {
            downloaded: downloaded.max(0) as u64,
            total: total.max(0) as u64,
        },
        "done" => DownloadingState::Done,
        "failure" => DownloadingState::Failure,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                8,
                Type::Text,
                format!("unknown download state {other:?}").into(),
            ))
        }
    };

    Ok(FileTransferRecord {
        file_id: row.get(0)?,
        message_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        local_path: row.get(4)?,
        size: size.max(0) as u64,
        cloud_type,
        cloud_id: row.get(7)?,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64, local: Option<&str>) -> NewFile {
        NewFile {
            name: name.to_string(),
            size,
            local_path: local.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn download_state_persists() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_file(&file("a.bin", 1000, None)).unwrap();
        assert_eq!(db.get_file(id).unwrap().state, DownloadingState::None);

        let progress = DownloadingState::Downloading {
            downloaded: 500,
            total: 1000,
        };
        db.set_download_state(id, progress).unwrap();
        assert_eq!(db.get_file(id).unwrap().state, progress);

        db.set_download_state(id, DownloadingState::Done).unwrap();
        assert_eq!(db.get_file(id).unwrap().state, DownloadingState::Done);
    }

    #[test]
    fn download_claim_is_exclusive_until_released() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_file(&file("a.bin", 1000, None)).unwrap();

        assert!(db.claim_download(id, 1000).unwrap());
        assert!(!db.claim_download(id, 1000).unwrap());
        assert!(db.record_download_progress(id, 300, 1000).unwrap());
        assert_eq!(
            db.get_file(id).unwrap().state,
            DownloadingState::Downloading { downloaded: 300, total: 1000 }
        );

        assert!(db.release_download(id).unwrap());
        assert!(!db.release_download(id).unwrap());
        assert!(!db.record_download_progress(id, 600, 1000).unwrap());
        assert_eq!(db.get_file(id).unwrap().state, DownloadingState::Failure);

        assert!(db.claim_download(id, 1000).unwrap());
        db.set_download_state(id, DownloadingState::Done).unwrap();
        assert!(db.claim_download(id, 1000).unwrap());

        assert!(matches!(db.claim_download(999, 1), Err(StoreError::NotFound)));
    }

    #[test]
    fn cloud_info_set_and_cleared() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_file(&file("a.bin", 10, Some("/tmp/a.bin"))).unwrap();

        db.set_cloud_info(id, CloudService::OneDrive, "remote-1").unwrap();
        let rec = db.get_file(id).unwrap();
        assert!(rec.has_cloud_copy());
        assert_eq!(rec.cloud_type, Some(CloudService::OneDrive));

        db.clear_cloud_info(id).unwrap();
        let rec = db.get_file(id).unwrap();
        assert_eq!(rec.cloud_type, None);
        assert_eq!(rec.cloud_id, None);
    }

    #[test]
    fn backup_candidates_respect_limit_and_cloud_copy() {
        let db = Database::open_in_memory().unwrap();
        let small = db.insert_file(&file("s", 100, Some("/tmp/s"))).unwrap();
        let big = db.insert_file(&file("b", 5_000, Some("/tmp/b"))).unwrap();
        let synced = db.insert_file(&file("c", 100, Some("/tmp/c"))).unwrap();
        db.insert_file(&file("nowhere", 1, None)).unwrap();
        db.set_cloud_info(synced, CloudService::GoogleDrive, "g").unwrap();

        let ids: Vec<i64> = db
            .backup_candidates(Some(1_000))
            .unwrap()
            .iter()
            .map(|f| f.file_id)
            .collect();
        assert_eq!(ids, vec![small]);

        let ids: Vec<i64> = db.backup_candidates(None).unwrap().iter().map(|f| f.file_id).collect();
        assert_eq!(ids, vec![small, big]);
    }

    #[test]
    fn updating_missing_file_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.set_local_path(404, None),
            Err(StoreError::NotFound)
        ));
    }
}
