//! Entry point for data messages arriving through the push provider.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use tracing::{debug, info, warn};

use unibox_shared::protocol::InboundPush;
use unibox_shared::types::OperatingMode;
use unibox_shared::CoreError;
use unibox_store::{DeliveryLedger, InsertOutcome};

use crate::events::EventBus;
use crate::router::{MessageRouter, OutboundRequest, SendReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushHandling {
    /// A `receive` message was recorded (or was already known).
    Ingested(InsertOutcome),
    /// A `send` request was delivered through the local plugins.
    Delivered(SendReport),
    /// Unknown type, or a type the current mode does not accept.
    Ignored,
}

pub struct PushReceiver {
    ledger: DeliveryLedger,
    router: Arc<MessageRouter>,
    events: EventBus,
}

impl PushReceiver {
    pub fn new(ledger: DeliveryLedger, router: Arc<MessageRouter>, events: EventBus) -> Self {
        Self {
            ledger,
            router,
            events,
        }
    }

    pub async fn on_message(&self, data: HashMap<String, String>) -> Result<PushHandling, CoreError> {
        let push = match InboundPush::from_data(&data) {
            Ok(Some(push)) => push,
            Ok(None) => {
                debug!(kind = ?data.get("type"), "Ignoring push data message");
                return Ok(PushHandling::Ignored);
            }
            Err(e) => {
                warn!(error = %e, "Malformed push data message");
                self.events.notice(&e);
                return Err(e);
            }
        };

        let mode = self.ledger.settings().await?.operating_mode;
        match (push, mode) {
            (InboundPush::Receive(dto), OperatingMode::Receiver | OperatingMode::Relay) => {
                let outcome = self.router.handle_inbound(dto).await?;
                Ok(PushHandling::Ingested(outcome))
            }
            (InboundPush::Send(dto), OperatingMode::Normal) => {
                let remote_id = dto.message_id;
                let request = OutboundRequest {
                    timestamp: DateTime::from_timestamp_millis(dto.timestamp),
                    client_id: Some(format!("remote-{}-{remote_id}", dto.plugin_connection.conversation_key())),
                    connection: dto.plugin_connection,
                    contents: dto.contents,
                };
                let report = self.router.send_message(request).await;
                info!(remote_id, msg_id = report.local_id, verified = report.verified, "Delivered on behalf of receiver");
                Ok(PushHandling::Delivered(report))
            }
            (push, mode) => {
                let kind = match push {
                    InboundPush::Receive(_) => "receive",
                    InboundPush::Send(_) => "send",
                };
                debug!(kind, ?mode, "Push type not accepted in this mode");
                Ok(PushHandling::Ignored)
            }
        }
    }

    /// The provider rotated this device's token.
    pub async fn on_new_token(&self, token: &str) -> Result<bool, CoreError> {
        let changed = self.ledger.store_push_token(token).await?;
        if changed {
            info!("Push token refreshed");
        }
        Ok(changed)
    }
}
