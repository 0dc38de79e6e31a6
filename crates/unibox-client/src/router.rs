//! Mode-aware routing of outbound messages and ingestion of inbound ones.
//!
//! Every message passes through the ledger first; transport outcomes only
//! ever move `verified` from false to true. Transport failures end as
//! `verified = false` plus one notice and are never returned as faults.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use unibox_net::{ChannelRegistry, InboundEvent, InboundKind, RelayTransport};
use unibox_shared::constants::LOCAL_SENDER_KEY;
use unibox_shared::protocol::{
    filter_missing, ContentBlock, PushEnvelope, ReceiveMessageDto, SendMessageDto,
    ServerSendMessageDto,
};
use unibox_shared::types::{ChannelType, Direction, OperatingMode, PluginConnection};
use unibox_shared::CoreError;
use unibox_store::{DeliveryLedger, InsertOutcome, MessageDraft, Settings};

use crate::cloud::{ActiveCloud, CloudServiceTable};
use crate::events::{CoreEvent, EventBus};

/// A message composed on this device.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub connection: PluginConnection,
    pub contents: Vec<ContentBlock>,
    /// Defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Caller-chosen id; resubmitting the same id does not send twice.
    pub client_id: Option<String>,
}

impl OutboundRequest {
    pub fn new(connection: PluginConnection, contents: Vec<ContentBlock>) -> Self {
        Self {
            connection,
            contents,
            timestamp: None,
            client_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Bound plugin through the channel registry.
    Channel,
    /// Push to remote sender devices (Receiver mode).
    PushToSender,
    /// Push through a relay mapping (Relay mode).
    Relay,
    /// Push is disabled for the current mode; nothing was sent.
    Skipped,
    /// The client id was already recorded; nothing was sent.
    AlreadyRecorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub local_id: i64,
    pub route: Route,
    pub verified: bool,
    pub failure: Option<CoreError>,
}

pub struct MessageRouter {
    ledger: DeliveryLedger,
    registry: Arc<ChannelRegistry>,
    relay: Option<Arc<dyn RelayTransport>>,
    cloud: Arc<CloudServiceTable>,
    events: EventBus,
    push_domain: String,
    relay_grace: Duration,
    id_epoch: u128,
    id_seq: AtomicU64,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: DeliveryLedger,
        registry: Arc<ChannelRegistry>,
        relay: Option<Arc<dyn RelayTransport>>,
        cloud: Arc<CloudServiceTable>,
        events: EventBus,
        push_domain: impl Into<String>,
        relay_grace: Duration,
    ) -> Self {
        let id_epoch = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u128;
        Self {
            ledger,
            registry,
            relay,
            cloud,
            events,
            push_domain: push_domain.into(),
            relay_grace,
            id_epoch,
            id_seq: AtomicU64::new(0),
        }
    }

    fn next_external_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("out-{:x}-{seq}", self.id_epoch)
    }

    // -- outbound -----------------------------------------------------------

    /// Record and deliver a message according to the current operating mode.
    pub async fn send_message(&self, request: OutboundRequest) -> SendReport {
        let timestamp = request.timestamp.unwrap_or_else(Utc::now);
        let conversation = request.connection.conversation_key();
        let draft = MessageDraft {
            direction: Direction::Outbound,
            sender_key: format!("{conversation}:{LOCAL_SENDER_KEY}"),
            external_id: request
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| self.next_external_id()),
            connection: request.connection.clone(),
            contents: request.contents.clone(),
            timestamp,
        };

        let outcome = match self.ledger.insert(draft).await {
            Ok(o) => o,
            Err(e) => return self.failed(0, Route::Skipped, e.into()),
        };
        let local_id = outcome.local_id;
        if !outcome.inserted {
            debug!(msg_id = local_id, "Outbound message already recorded");
            let verified = self.ledger.is_verified(local_id).await.unwrap_or(false);
            return SendReport {
                local_id,
                route: Route::AlreadyRecorded,
                verified,
                failure: None,
            };
        }
        self.events.emit(CoreEvent::NewMessage {
            local_id,
            conversation,
        });

        let dto = SendMessageDto {
            contents: request.contents,
            timestamp: timestamp.timestamp_millis(),
            plugin_connection: request.connection,
            message_id: local_id,
        };

        let settings = match self.ledger.settings().await {
            Ok(s) => s,
            Err(e) => return self.failed(local_id, Route::Skipped, e.into()),
        };

        match settings.operating_mode {
            OperatingMode::Normal => self.send_via_channel(dto).await,
            OperatingMode::Receiver if settings.push_enabled => {
                self.send_via_push(dto, &settings).await
            }
            OperatingMode::Relay if settings.push_enabled => {
                self.send_via_relay(dto).await
            }
            mode => {
                debug!(msg_id = local_id, ?mode, "Push disabled, message kept unsent");
                SendReport {
                    local_id,
                    route: Route::Skipped,
                    verified: false,
                    failure: None,
                }
            }
        }
    }

    async fn send_via_channel(&self, dto: SendMessageDto) -> SendReport {
        let local_id = dto.message_id;
        match self.registry.send_message(dto).await {
            Ok(()) => self.verified(local_id, Route::Channel).await,
            Err(e) => self.failed(local_id, Route::Channel, e),
        }
    }

    async fn send_via_push(&self, mut dto: SendMessageDto, settings: &Settings) -> SendReport {
        let local_id = dto.message_id;
        let Some(relay) = self.relay.as_ref() else {
            return self.failed(
                local_id,
                Route::PushToSender,
                CoreError::TransportPushFailure("no push gateway configured".into()),
            );
        };
        if settings.push_target_tokens.is_empty() {
            return self.failed(
                local_id,
                Route::PushToSender,
                CoreError::TransportPushFailure("no target devices configured".into()),
            );
        }

        dto.contents = filter_missing(self.externalize(dto.contents, settings).await);

        let mut last_error = None;
        let mut accepted = 0usize;
        for token in &settings.push_target_tokens {
            let pushed = match PushEnvelope::send_request(token, &self.push_domain, &dto) {
                Ok(envelope) => relay.push(&envelope, token).await,
                Err(e) => Err(e),
            };
            match pushed {
                Ok(()) => accepted += 1,
                Err(e) => last_error = Some(e),
            }
        }

        if accepted > 0 {
            debug!(msg_id = local_id, accepted, "Pushed to sender devices");
            self.verified(local_id, Route::PushToSender).await
        } else {
            let e = last_error
                .unwrap_or_else(|| CoreError::TransportPushFailure("push not accepted".into()));
            self.failed(local_id, Route::PushToSender, e)
        }
    }

    /// Upload local-only resources so remote devices can resolve them.
    ///
    /// Blocks that cannot be uploaded are left untouched and later dropped
    /// by `filter_missing`.
    async fn externalize(&self, contents: Vec<ContentBlock>, settings: &Settings) -> Vec<ContentBlock> {
        if !contents.iter().any(ContentBlock::needs_externalizing) {
            return contents;
        }
        let active: Option<ActiveCloud> = match self.cloud.resolve(settings) {
            Ok(active) => Some(active),
            Err(e) => {
                warn!(error = %e, "Cannot externalize attachments");
                None
            }
        };

        let mut out = Vec::with_capacity(contents.len());
        for block in contents {
            let upload = match (&active, block.needs_externalizing(), block.local_path()) {
                (Some(active), true, Some(path)) => {
                    let path = Path::new(path);
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "attachment".to_string());
                    Some(active.upload(path, &name).await)
                }
                _ => None,
            };
            match upload {
                Some(Ok(uploaded)) => match uploaded.url {
                    Some(url) => out.push(block.with_remote_url(url)),
                    None => out.push(block),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "Attachment upload failed, block dropped");
                    out.push(block);
                }
                None => out.push(block),
            }
        }
        out
    }

    /// Relay path.
    ///
    /// The provider gives no delivery acknowledgement here: a push that was
    /// accepted is marked verified after a fixed grace period. This is the
    /// weakest guarantee in the delivery chain.
    async fn send_via_relay(&self, dto: SendMessageDto) -> SendReport {
        let local_id = dto.message_id;
        let Some(relay) = self.relay.as_ref() else {
            return self.failed(
                local_id,
                Route::Relay,
                CoreError::TransportPushFailure("no push gateway configured".into()),
            );
        };

        let mapping = match self.ledger.relay_mapping(dto.plugin_connection.clone()).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                let e = CoreError::TransportPushFailure(format!(
                    "no relay route for {}",
                    dto.plugin_connection.conversation_key()
                ));
                return self.failed(local_id, Route::Relay, e);
            }
            Err(e) => return self.failed(local_id, Route::Relay, e.into()),
        };

        let server_dto = ServerSendMessageDto {
            contents: dto
                .contents
                .iter()
                .filter_map(ContentBlock::to_relay_content)
                .collect(),
            slave_origin_uid: mapping.uid.clone(),
            timestamp: dto.timestamp,
        };
        let pushed = match PushEnvelope::relay(
            &mapping.from,
            &self.push_domain,
            local_id,
            &server_dto,
            &mapping.session_id,
        ) {
            Ok(envelope) => relay.push(&envelope, &mapping.from).await,
            Err(e) => Err(e),
        };

        match pushed {
            Ok(()) => {
                // TODO: replace the grace period with a provider acknowledgement once the relay server reports delivery.
                tokio::time::sleep(self.relay_grace).await;
                self.verified(local_id, Route::Relay).await
            }
            Err(e) => self.failed(local_id, Route::Relay, e),
        }
    }

    async fn verified(&self, local_id: i64, route: Route) -> SendReport {
        match self.ledger.set_verified(local_id, true).await {
            Ok(changed) => {
                if changed {
                    self.events.emit(CoreEvent::VerifiedChanged { local_id });
                }
                info!(msg_id = local_id, ?route, "Message delivered");
                SendReport {
                    local_id,
                    route,
                    verified: true,
                    failure: None,
                }
            }
            Err(e) => self.failed(local_id, route, e.into()),
        }
    }

    fn failed(&self, local_id: i64, route: Route, error: CoreError) -> SendReport {
        warn!(msg_id = local_id, ?route, error = %error, "Message not delivered");
        self.events.notice(&error);
        SendReport {
            local_id,
            route,
            verified: false,
            failure: Some(error),
        }
    }

    /// Ask the plugin to retract a message. Only meaningful in `Normal` mode.
    pub async fn recall_message(&self, channel_type: ChannelType, message_id: i64) -> bool {
        match self.ledger.settings().await {
            Ok(s) if s.operating_mode == OperatingMode::Normal => {}
            Ok(s) => {
                debug!(msg_id = message_id, mode = ?s.operating_mode, "Recall ignored outside Normal mode");
                return false;
            }
            Err(e) => {
                self.events.notice(&e.into());
                return false;
            }
        }

        match self.registry.recall_message(channel_type, message_id).await {
            Ok(recalled) => recalled,
            Err(e) => {
                self.events.notice(&e);
                false
            }
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Record an inbound message once. Only a fresh insert notifies.
    pub async fn handle_inbound(&self, dto: ReceiveMessageDto) -> Result<InsertOutcome, CoreError> {
        let conversation = dto.plugin_connection.conversation_key();
        let draft = MessageDraft {
            direction: Direction::Inbound,
            sender_key: dto.sender_key(),
            external_id: dto.external_id(),
            timestamp: DateTime::<Utc>::from_timestamp_millis(dto.timestamp)
                .unwrap_or_else(Utc::now),
            connection: dto.plugin_connection,
            contents: dto.contents,
        };

        let outcome = self.ledger.insert(draft).await?;
        if outcome.inserted {
            self.events.emit(CoreEvent::NewMessage {
                local_id: outcome.local_id,
                conversation,
            });
        }
        Ok(outcome)
    }

    async fn handle_event(&self, event: InboundEvent) -> Result<(), CoreError> {
        match event.kind {
            InboundKind::Message(dto) => {
                self.handle_inbound(dto).await?;
            }
            InboundKind::Verified {
                message_id,
                verified,
            } => {
                if self.ledger.set_verified(message_id, verified).await? {
                    self.events.emit(CoreEvent::VerifiedChanged {
                        local_id: message_id,
                    });
                }
            }
            InboundKind::Deleted { message_id } => {
                if self.ledger.delete_message(message_id).await? {
                    self.events.emit(CoreEvent::MessageRemoved {
                        local_id: message_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drain plugin events until cancelled or every sender is gone.
    pub async fn run_inbound(&self, mut rx: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let channel_type = event.channel_type;
            if let Err(e) = self.handle_event(event).await {
                warn!(channel_type = %channel_type, error = %e, "Inbound event dropped");
                self.events.notice(&e);
            }
        }
        debug!("Inbound loop stopped");
    }
}
