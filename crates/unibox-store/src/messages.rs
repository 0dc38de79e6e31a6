use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension};
use unibox_shared::protocol::ContentBlock;
use unibox_shared::types::{ChannelType, Direction, PluginConnection};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{MessageDraft, StoredMessage};

const MESSAGE_COLUMNS: &str = "id, direction, channel_type, conversation, session, sender_key, \
                               external_id, contents, timestamp_ms, verified";

impl Database {
    /// Insert a message and the file rows for its `File` blocks.
    ///
    /// Returns [`StoreError::Conflict`] when `(sender_key, external_id)` is
    /// already recorded; nothing is written in that case. Any other
    /// constraint violation is returned as [`StoreError::Sqlite`].
    pub fn insert_message(&mut self, draft: &MessageDraft) -> Result<i64> {
        let contents = serde_json::to_string(&draft.contents)?;
        let tx = self.conn_mut().transaction()?;

        let changed = tx.execute(
            "INSERT INTO messages
                (direction, channel_type, conversation, session, conv_key,
                 sender_key, external_id, contents, timestamp_ms, verified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT (sender_key, external_id) DO NOTHING",
            params![
                draft.direction.as_str(),
                draft.connection.channel_type.0,
                draft.connection.conversation,
                draft.connection.session,
                draft.connection.conversation_key(),
                draft.sender_key,
                draft.external_id,
                contents,
                draft.timestamp.timestamp_millis(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict);
        }
        let local_id = tx.last_insert_rowid();

        let now = Utc::now().timestamp_millis();
        for block in &draft.contents {
            if let ContentBlock::File {
                url,
                local_path,
                name,
                size,
            } = block
            {
                tx.execute(
                    "INSERT INTO files (message_id, name, url, local_path, size, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![local_id, name, url, local_path, *size as i64, now],
                )?;
            }
        }

        tx.commit()?;
        Ok(local_id)
    }

    /// Local id of an already recorded message with this dedup key.
    pub fn find_message_id(&self, sender_key: &str, external_id: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id FROM messages WHERE sender_key = ?1 AND external_id = ?2",
                params![sender_key, external_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_message(&self, local_id: i64) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![local_id],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Flip `verified` to true. Returns whether the row changed.
    ///
    /// A request to clear the flag is ignored: verification never reverts.
    pub fn set_verified(&self, local_id: i64, verified: bool) -> Result<bool> {
        if !verified {
            return Ok(false);
        }
        let changed = self.conn().execute(
            "UPDATE messages SET verified = 1 WHERE id = ?1 AND verified = 0",
            params![local_id],
        )?;
        Ok(changed > 0)
    }

    pub fn is_verified(&self, local_id: i64) -> Result<bool> {
        self.conn()
            .query_row(
                "SELECT verified FROM messages WHERE id = ?1",
                params![local_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v != 0)
            .map_err(not_found)
    }

    /// Most recent `limit` messages across the given conversations, oldest first.
    pub fn recent_window(&self, conversation_keys: &[String], limit: u32) -> Result<Vec<StoredMessage>> {
        if conversation_keys.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; conversation_keys.len()].join(", ");
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conv_key IN ({placeholders})
             ORDER BY timestamp_ms DESC, id DESC
             LIMIT ?"
        );

        let mut values: Vec<Value> = conversation_keys
            .iter()
            .map(|k| Value::Text(k.clone()))
            .collect();
        values.push(Value::Integer(i64::from(limit)));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn delete_message(&self, local_id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![local_id])?;
        Ok(affected > 0)
    }
}

pub(crate) fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let direction_str: String = row.get(1)?;
    let contents_json: String = row.get(7)?;
    let ts_ms: i64 = row.get(8)?;
    let verified: i64 = row.get(9)?;

    let direction = Direction::parse(&direction_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown direction {direction_str:?}").into(),
        )
    })?;
    let contents: Vec<ContentBlock> = serde_json::from_str(&contents_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(ts_ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            Type::Integer,
            format!("timestamp out of range: {ts_ms}").into(),
        )
    })?;

    Ok(StoredMessage {
        local_id: row.get(0)?,
        direction,
        connection: PluginConnection {
            channel_type: ChannelType(row.get(2)?),
            conversation: row.get(3)?,
            session: row.get(4)?,
        },
        sender_key: row.get(5)?,
        external_id: row.get(6)?,
        contents,
        timestamp,
        verified: verified != 0,
    })
}
