//! The capability every channel integration implements.
//!
//! A [`ChannelTransport`] is one bound plugin. It is driven exclusively by its
//! [`ChannelConnection`](crate::connection::ChannelConnection) worker, so calls
//! on one transport never overlap.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use unibox_shared::protocol::{ReceiveMessageDto, SendMessageDto};
use unibox_shared::types::ChannelType;

use crate::discovery::PluginInfo;

/// Something a plugin reported on its own initiative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Message(ReceiveMessageDto),
    /// Delivery confirmation for a message this device sent (local id).
    Verified { message_id: i64, verified: bool },
    /// The remote side removed a message (local id).
    Deleted { message_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub channel_type: ChannelType,
    pub kind: InboundKind,
}

/// Handle given to a transport on connect. Tags everything with the channel type.
#[derive(Debug, Clone)]
pub struct InboundSink {
    channel_type: ChannelType,
    tx: mpsc::Sender<InboundEvent>,
}

impl InboundSink {
    pub fn new(channel_type: ChannelType, tx: mpsc::Sender<InboundEvent>) -> Self {
        Self { channel_type, tx }
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    pub async fn message(&self, dto: ReceiveMessageDto) {
        self.emit(InboundKind::Message(dto)).await;
    }

    pub async fn verified(&self, message_id: i64, verified: bool) {
        self.emit(InboundKind::Verified {
            message_id,
            verified,
        })
        .await;
    }

    pub async fn deleted(&self, message_id: i64) {
        self.emit(InboundKind::Deleted { message_id }).await;
    }

    async fn emit(&self, kind: InboundKind) {
        let event = InboundEvent {
            channel_type: self.channel_type,
            kind,
        };
        if self.tx.send(event).await.is_err() {
            warn!(channel_type = %self.channel_type, "Inbound receiver dropped, event lost");
        }
    }
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Establish the binding. Inbound traffic goes to `sink` until disconnect.
    async fn connect(&self, sink: InboundSink) -> anyhow::Result<()>;

    async fn send(&self, dto: &SendMessageDto) -> anyhow::Result<()>;

    async fn recall(&self, message_id: i64) -> anyhow::Result<()>;

    async fn disconnect(&self);

    /// Whether the binding is still alive.
    async fn probe(&self) -> bool {
        true
    }
}

/// Builds transports for discovered plugins.
pub trait ChannelTransportFactory: Send + Sync {
    fn create(&self, plugin: &PluginInfo) -> anyhow::Result<Box<dyn ChannelTransport>>;
}
