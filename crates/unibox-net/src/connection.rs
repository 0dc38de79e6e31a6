//! One bound plugin and its worker task.
//!
//! All transport calls for a connection run on a dedicated tokio task fed
//! through an mpsc command channel, so sends on one channel execute in
//! submission order and callers only wait for the enqueue. Status is
//! published through a `watch` channel.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use unibox_shared::constants::CONNECTION_QUEUE_DEPTH;
use unibox_shared::protocol::SendMessageDto;
use unibox_shared::types::{ChannelType, ConnectionStatus};
use unibox_shared::CoreError;

use crate::discovery::PluginInfo;
use crate::transport::{ChannelTransport, InboundEvent, InboundSink};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum ConnCommand {
    Connect(oneshot::Sender<Result<(), CoreError>>),
    Send(Box<SendMessageDto>, oneshot::Sender<Result<(), CoreError>>),
    Recall(i64, oneshot::Sender<bool>),
    Disconnect(oneshot::Sender<()>),
}

/// Pending outcome of a queued send.
#[derive(Debug)]
pub struct SendReceipt {
    channel_type: ChannelType,
    rx: oneshot::Receiver<Result<(), CoreError>>,
}

impl SendReceipt {
    pub async fn outcome(self) -> Result<(), CoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(worker_gone(self.channel_type)),
        }
    }
}

fn worker_gone(channel_type: ChannelType) -> CoreError {
    CoreError::ChannelBindFailure {
        channel_type,
        reason: "connection worker stopped".into(),
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

pub struct ChannelConnection {
    info: PluginInfo,
    cmd_tx: mpsc::Sender<ConnCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
}

impl ChannelConnection {
    /// Spawn the worker for `transport`. The connection starts `Disconnected`.
    pub fn spawn(
        info: PluginInfo,
        transport: Box<dyn ChannelTransport>,
        inbound: mpsc::Sender<InboundEvent>,
        health_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let cancel = CancellationToken::new();

        let worker = Worker {
            channel_type: info.channel_type,
            transport,
            sink: InboundSink::new(info.channel_type, inbound),
            status_tx,
        };
        tokio::spawn(worker.run(cmd_rx, cancel.clone(), health_interval));

        Self {
            info,
            cmd_tx,
            status_rx,
            cancel,
        }
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn channel_type(&self) -> ChannelType {
        self.info.channel_type
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Bind the plugin. A no-op while already connected.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ConnCommand::Connect(tx)).await.is_err() {
            return Err(worker_gone(self.channel_type()));
        }
        rx.await.unwrap_or_else(|_| Err(worker_gone(self.channel_type())))
    }

    /// Queue `dto` for delivery.
    pub async fn send(&self, dto: SendMessageDto) -> SendReceipt {
        let (tx, rx) = oneshot::channel();
        // On failure the reply sender is dropped with the command and the
        // receipt resolves to a worker error.
        let _ = self.cmd_tx.send(ConnCommand::Send(Box::new(dto), tx)).await;
        SendReceipt {
            channel_type: self.channel_type(),
            rx,
        }
    }

    /// Ask the plugin to retract a message. Ignored unless connected.
    pub async fn recall(&self, message_id: i64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ConnCommand::Recall(message_id, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Release the binding. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ConnCommand::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the worker, releasing the binding if one is held.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    channel_type: ChannelType,
    transport: Box<dyn ChannelTransport>,
    sink: InboundSink,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Worker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ConnCommand>,
        cancel: CancellationToken,
        health_interval: Duration,
    ) {
        let mut health = interval_at(Instant::now() + health_interval, health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = health.tick() => self.check_health().await,
            }
        }

        self.release().await;
        debug!(channel_type = %self.channel_type, "Connection worker stopped");
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(channel_type = %self.channel_type, from = ?previous, to = ?status, "Connection status changed");
        }
    }

    async fn handle(&mut self, cmd: ConnCommand) {
        match cmd {
            ConnCommand::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            ConnCommand::Send(dto, reply) => {
                let _ = reply.send(self.send(&dto).await);
            }
            ConnCommand::Recall(message_id, reply) => {
                let _ = reply.send(self.recall(message_id).await);
            }
            ConnCommand::Disconnect(reply) => {
                self.release().await;
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self) -> Result<(), CoreError> {
        if matches!(
            self.status(),
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting);
        match self.transport.connect(self.sink.clone()).await {
            Ok(()) => {
                self.set_status(ConnectionStatus::Connected);
                info!(channel_type = %self.channel_type, "Channel connected");
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Error);
                warn!(channel_type = %self.channel_type, error = %e, "Channel bind failed");
                Err(CoreError::ChannelBindFailure {
                    channel_type: self.channel_type,
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    async fn send(&mut self, dto: &SendMessageDto) -> Result<(), CoreError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(CoreError::ChannelBindFailure {
                channel_type: self.channel_type,
                reason: "not connected".into(),
            });
        }

        self.transport.send(dto).await.map_err(|e| {
            warn!(
                channel_type = %self.channel_type,
                msg_id = dto.message_id,
                error = %e,
                "Plugin rejected message"
            );
            CoreError::ChannelBindFailure {
                channel_type: self.channel_type,
                reason: format!("{e:#}"),
            }
        })
    }

    async fn recall(&mut self, message_id: i64) -> bool {
        if self.status() != ConnectionStatus::Connected {
            warn!(channel_type = %self.channel_type, msg_id = message_id, "Recall ignored, channel not connected");
            return false;
        }

        match self.transport.recall(message_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel_type = %self.channel_type, msg_id = message_id, error = %e, "Recall failed");
                false
            }
        }
    }

    async fn check_health(&mut self) {
        if self.status() != ConnectionStatus::Connected {
            return;
        }
        if !self.transport.probe().await {
            warn!(channel_type = %self.channel_type, "Channel binding lost");
            self.transport.disconnect().await;
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    async fn release(&mut self) {
        if self.status() == ConnectionStatus::Connected {
            self.transport.disconnect().await;
            info!(channel_type = %self.channel_type, "Channel disconnected");
        }
        self.set_status(ConnectionStatus::Disconnected);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
