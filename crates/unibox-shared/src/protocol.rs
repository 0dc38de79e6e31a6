use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::PluginConnection;

/// One typed block of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        local_path: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
    },
    Audio {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        local_path: Option<String>,
        #[serde(default)]
        length_ms: u64,
        #[serde(default)]
        file_name: Option<String>,
    },
    File {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        local_path: Option<String>,
        name: String,
        size: u64,
    },
    Mention {
        target: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Image { url, .. } | Self::Audio { url, .. } | Self::File { url, .. } => {
                url.as_deref()
            }
            _ => None,
        }
    }

    pub fn local_path(&self) -> Option<&str> {
        match self {
            Self::Image { local_path, .. }
            | Self::Audio { local_path, .. }
            | Self::File { local_path, .. } => local_path.as_deref(),
            _ => None,
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Image { .. } | Self::Audio { .. } | Self::File { .. })
    }

    /// A block only resolvable on this device (local file, no remote URL).
    pub fn needs_externalizing(&self) -> bool {
        self.is_resource() && self.url().is_none() && self.local_path().is_some()
    }

    /// Replace the remote URL and drop the local reference.
    pub fn with_remote_url(self, remote: String) -> Self {
        match self {
            Self::Image { file_name, .. } => Self::Image {
                url: Some(remote),
                local_path: None,
                file_name,
            },
            Self::Audio {
                length_ms,
                file_name,
                ..
            } => Self::Audio {
                url: Some(remote),
                local_path: None,
                length_ms,
                file_name,
            },
            Self::File { name, size, .. } => Self::File {
                url: Some(remote),
                local_path: None,
                name,
                size,
            },
            other => other,
        }
    }

    /// Server-side form used on the relay path; `None` if not addressable remotely.
    pub fn to_relay_content(&self) -> Option<RelayContent> {
        match self {
            Self::Text { text } => Some(RelayContent::PlainText { text: text.clone() }),
            Self::Image { url, .. } => url.clone().map(|url| RelayContent::Image { url }),
            Self::Audio { url, length_ms, .. } => url.clone().map(|url| RelayContent::Audio {
                url,
                length: *length_ms,
            }),
            Self::File { url, name, size, .. } => url.clone().map(|url| RelayContent::File {
                url,
                name: name.clone(),
                size: *size,
            }),
            Self::Mention { target, name } => Some(RelayContent::At {
                target: target.clone(),
                name: name.clone(),
            }),
        }
    }
}

/// Drop resource blocks that cannot be resolved by a remote party.
pub fn filter_missing(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter(|b| !b.is_resource() || b.url().is_some())
        .collect()
}

/// Content block in the relay server's canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RelayContent {
    PlainText { text: String },
    Image { url: String },
    Audio { url: String, length: u64 },
    File { url: String, name: String, size: u64 },
    At { target: String, name: Option<String> },
}

/// Outbound message handed to a plugin or pushed to a remote sender device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageDto {
    pub contents: Vec<ContentBlock>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub plugin_connection: PluginConnection,
    /// Ledger-assigned local message id.
    pub message_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Stable sender id within the channel, when the plugin has one.
    #[serde(default)]
    pub id: Option<String>,
}

/// Inbound message as delivered by a plugin or the push relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveMessageDto {
    pub contents: Vec<ContentBlock>,
    pub profile: Profile,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Message id assigned by the source, if any.
    #[serde(default)]
    pub message_id: Option<String>,
    pub plugin_connection: PluginConnection,
}

impl ReceiveMessageDto {
    /// Identity of the sender, scoped to the conversation it spoke in.
    pub fn sender_key(&self) -> String {
        let who = self.profile.id.as_deref().unwrap_or(&self.profile.name);
        format!("{}:{}", self.plugin_connection.conversation_key(), who)
    }

    /// Deduplication id: the source id, or a digest of the message when absent.
    pub fn external_id(&self) -> String {
        if let Some(id) = self.message_id.as_deref().filter(|s| !s.is_empty()) {
            return id.to_string();
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.sender_key().as_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        for block in &self.contents {
            if let Ok(bytes) = serde_json::to_vec(block) {
                hasher.update(&bytes);
            }
        }
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// Payload sent to the relay server on the `Relay` path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSendMessageDto {
    pub contents: Vec<RelayContent>,
    pub slave_origin_uid: String,
    pub timestamp: i64,
}

/// Push message addressed to `<token>@<provider domain>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushEnvelope {
    pub to: String,
    pub message_id: String,
    pub data: BTreeMap<String, String>,
}

impl PushEnvelope {
    pub fn new(token: &str, domain: &str, message_id: impl Into<String>) -> Self {
        Self {
            to: format!("{token}@{domain}"),
            message_id: message_id.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Relay-path envelope carrying a [`ServerSendMessageDto`].
    pub fn relay(
        from: &str,
        domain: &str,
        message_id: i64,
        dto: &ServerSendMessageDto,
        session_id: &str,
    ) -> Result<Self, CoreError> {
        Ok(Self::new(from, domain, message_id.to_string())
            .with_data("message", serde_json::to_string(dto)?)
            .with_data("session_id", session_id))
    }

    /// Receiver-path envelope asking a remote sender device to deliver `dto`.
    pub fn send_request(token: &str, domain: &str, dto: &SendMessageDto) -> Result<Self, CoreError> {
        Ok(Self::new(token, domain, dto.message_id.to_string())
            .with_data("type", "send")
            .with_data("dto", serde_json::to_string(dto)?))
    }
}

/// Data messages arriving through the push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPush {
    /// A message received by a remote sender device, to be shown here.
    Receive(ReceiveMessageDto),
    /// A remote receiver asks this device to deliver through its plugins.
    Send(SendMessageDto),
}

impl InboundPush {
    /// Parse the `type` / `dto` data fields. `Ok(None)` for unknown types.
    pub fn from_data(data: &HashMap<String, String>) -> Result<Option<Self>, CoreError> {
        let Some(dto) = data.get("dto") else {
            return Ok(None);
        };
        match data.get("type").map(String::as_str) {
            Some("receive") => Ok(Some(Self::Receive(serde_json::from_str(dto)?))),
            Some("send") => Ok(Some(Self::Send(serde_json::from_str(dto)?))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelType;

    fn image(url: Option<&str>, local: Option<&str>) -> ContentBlock {
        ContentBlock::Image {
            url: url.map(String::from),
            local_path: local.map(String::from),
            file_name: None,
        }
    }

    #[test]
    fn filter_missing_drops_local_only_resources() {
        let blocks = vec![
            ContentBlock::text("hi"),
            image(None, Some("/tmp/a.png")),
            image(Some("https://x/b.png"), None),
        ];
        let kept = filter_missing(blocks);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|b| b.local_path().is_none()));
    }

    #[test]
    fn relay_json_field_names() {
        let dto = ServerSendMessageDto {
            contents: vec![ContentBlock::text("yo").to_relay_content().unwrap()],
            slave_origin_uid: "uid-1".into(),
            timestamp: 42,
        };
        let json: serde_json::Value = serde_json::to_value(&dto).unwrap();
        assert!(json.get("contents").is_some());
        assert_eq!(json["slaveOriginUid"], "uid-1");
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn relay_envelope_addressing() {
        let dto = ServerSendMessageDto {
            contents: vec![],
            slave_origin_uid: "u".into(),
            timestamp: 1,
        };
        let env = PushEnvelope::relay("tok", "fcm.googleapis.com", 9, &dto, "sess").unwrap();
        assert_eq!(env.to, "tok@fcm.googleapis.com");
        assert_eq!(env.message_id, "9");
        assert_eq!(env.data["session_id"], "sess");
        assert!(env.data["message"].contains("slaveOriginUid"));
    }

    #[test]
    fn external_id_is_stable_without_source_id() {
        let dto = ReceiveMessageDto {
            contents: vec![ContentBlock::text("ping")],
            profile: Profile {
                name: "alice".into(),
                ..Default::default()
            },
            timestamp: 1_700_000_000_000,
            message_id: None,
            plugin_connection: PluginConnection::new(ChannelType(1), "c"),
        };
        assert_eq!(dto.external_id(), dto.clone().external_id());

        let mut other = dto.clone();
        other.contents = vec![ContentBlock::text("pong")];
        assert_ne!(dto.external_id(), other.external_id());

        let mut with_id = dto;
        with_id.message_id = Some("m-1".into());
        assert_eq!(with_id.external_id(), "m-1");
    }

    #[test]
    fn inbound_push_parsing() {
        let mut data = HashMap::new();
        data.insert("type".to_string(), "unknown".to_string());
        data.insert("dto".to_string(), "{}".to_string());
        assert_eq!(InboundPush::from_data(&data).unwrap(), None);

        data.insert("type".to_string(), "receive".to_string());
        assert!(InboundPush::from_data(&data).is_err());
    }
}
