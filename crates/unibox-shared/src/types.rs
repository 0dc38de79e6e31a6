use serde::{Deserialize, Serialize};

use crate::constants::UNKNOWN_CHANNEL_NAME;

// Channel kind = integer advertised by the plugin's `connection_type` metadata
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelType(pub i32);

impl ChannelType {
    /// Fallback type for plugins with missing or malformed metadata.
    pub const UNKNOWN: ChannelType = ChannelType(0);

    pub fn from_metadata(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.trim().parse::<i32>().ok())
            .map(Self)
            .unwrap_or(Self::UNKNOWN)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn channel_name_from_metadata(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => UNKNOWN_CHANNEL_NAME.to_string(),
    }
}

/// Identifies the remote counterpart of a conversation.
///
/// Persisted alongside every message and relay mapping, so the textual
/// [`conversation_key`](Self::conversation_key) must stay stable across
/// restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PluginConnection {
    pub channel_type: ChannelType,
    /// Remote conversation (chat / group) identifier within the channel.
    pub conversation: String,
    /// Optional remote session identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl PluginConnection {
    pub fn new(channel_type: ChannelType, conversation: impl Into<String>) -> Self {
        Self {
            channel_type,
            conversation: conversation.into(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn conversation_key(&self) -> String {
        format!("{}:{}", self.channel_type, self.conversation)
    }
}

/// Where outbound traffic physically goes. Read from persisted settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OperatingMode {
    /// Direct plugin binding.
    #[default]
    Normal,
    /// Push-based; this device has no plugins and forwards to a remote sender.
    Receiver,
    /// Push-based outbound addressed through a relay mapping.
    Relay,
}

impl OperatingMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Receiver),
            2 => Some(Self::Relay),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::Receiver => 1,
            Self::Relay => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Plugin status as shown to the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunningStatus {
    Checking,
    Running,
    Error,
    Disabled,
}

impl From<ConnectionStatus> for RunningStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connecting => Self::Checking,
            ConnectionStatus::Connected => Self::Running,
            ConnectionStatus::Error => Self::Error,
            ConnectionStatus::Disconnected => Self::Disabled,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Cloud storage service selected for backups, keyed by its persisted code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum CloudService {
    #[default]
    None,
    GoogleDrive,
    OneDrive,
    TencentCos,
    QiniuKodo,
}

impl CloudService {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1001 => Some(Self::GoogleDrive),
            1002 => Some(Self::OneDrive),
            1003 => Some(Self::TencentCos),
            1004 => Some(Self::QiniuKodo),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::GoogleDrive => 1001,
            Self::OneDrive => 1002,
            Self::TencentCos => 1003,
            Self::QiniuKodo => 1004,
        }
    }

    /// Settings keys that must be present before this service can be used.
    pub fn required_credentials(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::GoogleDrive => &["google_drive_folder_id"],
            Self::OneDrive => &["onedrive_folder_id"],
            Self::TencentCos => &[
                "tencent_cos_secret_id",
                "tencent_cos_secret_key",
                "tencent_cos_bucket",
                "tencent_cos_region",
            ],
            Self::QiniuKodo => &[
                "qiniu_kodo_access_key",
                "qiniu_kodo_secret_key",
                "qiniu_kodo_bucket",
                "qiniu_kodo_domain",
            ],
        }
    }
}

impl std::fmt::Display for CloudService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::GoogleDrive => "google-drive",
            Self::OneDrive => "onedrive",
            Self::TencentCos => "tencent-cos",
            Self::QiniuKodo => "qiniu-kodo",
        };
        f.write_str(name)
    }
}

/// Download progress of a file attachment.
///
/// `None -> Downloading -> Done | Failure`; both `None` and `Failure` may be
/// retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadingState {
    #[default]
    None,
    Downloading { downloaded: u64, total: u64 },
    Done,
    Failure,
}

impl DownloadingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failure)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::None | Self::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_metadata_defaults() {
        assert_eq!(ChannelType::from_metadata(Some("7")), ChannelType(7));
        assert_eq!(ChannelType::from_metadata(Some("qq")), ChannelType::UNKNOWN);
        assert_eq!(ChannelType::from_metadata(None), ChannelType::UNKNOWN);
        assert_eq!(channel_name_from_metadata(Some("  ")), "Unknown");
        assert_eq!(channel_name_from_metadata(Some("Telegram")), "Telegram");
    }

    #[test]
    fn conversation_key_ignores_session() {
        let a = PluginConnection::new(ChannelType(3), "room-1");
        let b = a.clone().with_session("s-9");
        assert_eq!(a.conversation_key(), "3:room-1");
        assert_eq!(a.conversation_key(), b.conversation_key());
    }

    #[test]
    fn persisted_codes() {
        for mode in [OperatingMode::Normal, OperatingMode::Receiver, OperatingMode::Relay] {
            assert_eq!(OperatingMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(CloudService::from_code(1002), Some(CloudService::OneDrive));
        assert_eq!(CloudService::from_code(55), None);
    }

    #[test]
    fn running_status_mapping() {
        assert_eq!(RunningStatus::from(ConnectionStatus::Connected), RunningStatus::Running);
        assert_eq!(RunningStatus::from(ConnectionStatus::Disconnected), RunningStatus::Disabled);
    }
}
