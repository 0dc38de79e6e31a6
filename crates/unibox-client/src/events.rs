use serde::Serialize;
use tokio::sync::broadcast;

use unibox_shared::CoreError;

use crate::backup::BackupSnapshot;

pub const EVENT_NEW_MESSAGE: &str = "new-message";
pub const EVENT_VERIFIED_CHANGED: &str = "verified-changed";
pub const EVENT_MESSAGE_REMOVED: &str = "message-removed";
pub const EVENT_NOTICE: &str = "notice";
pub const EVENT_BACKUP_PROGRESS: &str = "backup-progress";

/// Notifications for the application shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEvent {
    NewMessage {
        local_id: i64,
        conversation: String,
    },
    VerifiedChanged {
        local_id: i64,
    },
    MessageRemoved {
        local_id: i64,
    },
    /// One transient, user-facing notice per non-fatal failure.
    Notice {
        message: String,
    },
    Backup(BackupSnapshot),
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => EVENT_NEW_MESSAGE,
            Self::VerifiedChanged { .. } => EVENT_VERIFIED_CHANGED,
            Self::MessageRemoved { .. } => EVENT_MESSAGE_REMOVED,
            Self::Notice { .. } => EVENT_NOTICE,
            Self::Backup(_) => EVENT_BACKUP_PROGRESS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CoreEvent) {
        tracing::trace!(event = event.name(), "Emitting event");
        // No subscriber is not an error: the shell may not be attached yet.
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, error: &CoreError) {
        self.emit(CoreEvent::Notice {
            message: error.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
