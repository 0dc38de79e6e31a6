use rusqlite::{params, OptionalExtension};
use unibox_shared::types::PluginConnection;

use crate::database::Database;
use crate::error::Result;
use crate::models::RelayMapping;

impl Database {
    /// Insert or replace the relay route of a conversation.
    pub fn upsert_relay_mapping(&self, mapping: &RelayMapping) -> Result<()> {
        self.conn().execute(
            "INSERT INTO relay_mappings (channel_type, conversation, uid, push_from, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel_type, conversation) DO UPDATE SET
                uid = excluded.uid,
                push_from = excluded.push_from,
                session_id = excluded.session_id",
            params![
                mapping.connection.channel_type.0,
                mapping.connection.conversation,
                mapping.uid,
                mapping.from,
                mapping.session_id,
            ],
        )?;
        Ok(())
    }

    /// Relay route for a conversation. The session part of `connection` is ignored.
    pub fn get_relay_mapping(&self, connection: &PluginConnection) -> Result<Option<RelayMapping>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT uid, push_from, session_id FROM relay_mappings
                 WHERE channel_type = ?1 AND conversation = ?2",
                params![connection.channel_type.0, connection.conversation],
                |row| {
                    Ok(RelayMapping {
                        connection: connection.clone(),
                        uid: row.get(0)?,
                        from: row.get(1)?,
                        session_id: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}
