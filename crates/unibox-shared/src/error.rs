use thiserror::Error;

use crate::types::{ChannelType, CloudService};

/// Failures of the routing and delivery core.
///
/// None of these are fatal: the router and the backup pipeline reduce them
/// to a `verified = false` state or a failed stage plus a user notice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Plugin not installed for channel type {0}")]
    ChannelNotInstalled(ChannelType),

    #[error("Channel {channel_type} bind failure: {reason}")]
    ChannelBindFailure {
        channel_type: ChannelType,
        reason: String,
    },

    #[error("Push delivery failed: {0}")]
    TransportPushFailure(String),

    #[error("Cloud storage {service} failed: {reason}")]
    CloudAdapterFailure {
        service: CloudService,
        reason: String,
    },

    #[error("Invalid cloud storage configuration: {0}")]
    ConfigurationMissing(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
