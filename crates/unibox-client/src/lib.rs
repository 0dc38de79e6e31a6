//! # unibox-client
//!
//! The routing and delivery core of Unibox. [`Core::start`] wires the
//! ledger, the channel registry, the message router, the push receiver and
//! the attachment pipelines together; the application shell drives it through
//! the handles it exposes and listens on [`EventBus`].

pub mod backup;
pub mod cloud;
pub mod config;
pub mod download;
pub mod events;
pub mod push;
pub mod router;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use unibox_net::{
    ChannelRegistry, ChannelTransportFactory, HttpPushTransport, PluginDiscovery, RegistryConfig,
    RelayTransport,
};
use unibox_shared::CoreError;
use unibox_store::{Database, DeliveryLedger};

pub use backup::{BackupPipeline, BackupSnapshot, BackupStage, EnqueueOutcome, JobState};
pub use cloud::{CloudServiceTable, CloudStorage};
pub use config::CoreConfig;
pub use download::{Downloader, FileFetcher, HttpFetcher};
pub use events::{CoreEvent, EventBus};
pub use push::{PushHandling, PushReceiver};
pub use router::{MessageRouter, OutboundRequest, Route, SendReport};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("unibox_client=debug,unibox_net=debug,unibox_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Host-provided pieces the core cannot build on its own.
pub struct CoreCollaborators {
    /// Enumerates installed channel plugins.
    pub discovery: Arc<dyn PluginDiscovery>,
    /// Binds a transport for each discovered plugin.
    pub transports: Arc<dyn ChannelTransportFactory>,
    /// Vendor cloud adapters, keyed by service.
    pub cloud: CloudServiceTable,
    /// Overrides the HTTP fetcher used for attachment downloads.
    pub fetcher: Option<Arc<dyn FileFetcher>>,
    /// Overrides the push transport built from `push_gateway_url`.
    pub relay: Option<Arc<dyn RelayTransport>>,
}

/// A running core.
pub struct Core {
    /// Persistent message, file, relay-mapping and settings store.
    pub ledger: DeliveryLedger,

    /// Installed plugins and their live connections.
    pub registry: Arc<ChannelRegistry>,

    /// Mode-aware outbound routing and inbound ingestion.
    pub router: Arc<MessageRouter>,

    /// Handles data messages and token refreshes from the push provider.
    pub push: PushReceiver,

    pub downloader: Downloader,

    pub backup: BackupPipeline,

    /// Notifications for the shell.
    pub events: EventBus,

    cancel: CancellationToken,
    inbound_task: JoinHandle<()>,
}

impl Core {
    /// Open the ledger, discover and bind plugins, and start ingesting.
    ///
    /// Plugins that fail to bind do not fail startup; they show up as
    /// `Error` in the registry status.
    pub async fn start(config: CoreConfig, collaborators: CoreCollaborators) -> Result<Self, CoreError> {
        let ledger = match &config.database_path {
            Some(path) => DeliveryLedger::open_at(path)?,
            None => DeliveryLedger::new(Database::new()?),
        };
        let events = EventBus::default();

        let relay = match (collaborators.relay, &config.push_gateway_url) {
            (Some(relay), _) => Some(relay),
            (None, Some(url)) => {
                let transport = HttpPushTransport::new(url.clone(), config.push_timeout)?;
                Some(Arc::new(transport) as Arc<dyn RelayTransport>)
            }
            (None, None) => {
                tracing::info!("No push gateway configured, push delivery unavailable");
                None
            }
        };
        let fetcher = collaborators
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new(reqwest::Client::new())));
        let cloud = Arc::new(collaborators.cloud);

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth);
        let registry = Arc::new(ChannelRegistry::new(
            collaborators.discovery,
            collaborators.transports,
            inbound_tx,
            RegistryConfig {
                status_poll_interval: config.status_poll_interval,
                health_interval: config.health_interval,
            },
        ));

        let router = Arc::new(MessageRouter::new(
            ledger.clone(),
            Arc::clone(&registry),
            relay,
            Arc::clone(&cloud),
            events.clone(),
            config.push_domain.clone(),
            config.relay_grace,
        ));
        let push = PushReceiver::new(ledger.clone(), Arc::clone(&router), events.clone());
        let downloader = Downloader::new(
            ledger.clone(),
            fetcher,
            Arc::clone(&cloud),
            config.download_dir.clone(),
            config.download_poll_interval,
        );
        let backup = BackupPipeline::new(
            ledger.clone(),
            downloader.clone(),
            Arc::clone(&cloud),
            events.clone(),
        );

        let cancel = CancellationToken::new();
        let inbound_task = tokio::spawn({
            let router = Arc::clone(&router);
            let cancel = cancel.clone();
            async move { router.run_inbound(inbound_rx, cancel).await }
        });

        registry.discover().await;
        let status = registry.connect_all().await;
        tracing::info!(channels = status.len(), "Unibox core started");

        Ok(Self {
            ledger,
            registry,
            router,
            push,
            downloader,
            backup,
            events,
            cancel,
            inbound_task,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub async fn send_message(&self, request: OutboundRequest) -> SendReport {
        self.router.send_message(request).await
    }

    /// Release every plugin binding and stop the inbound loop.
    pub async fn shutdown(self) {
        self.registry.disconnect_all().await;
        self.cancel.cancel();
        if self.inbound_task.await.is_err() {
            tracing::warn!("Inbound loop panicked");
        }
        tracing::info!("Unibox core stopped");
    }
}

#[cfg(test)]
mod tests {
    use unibox_shared::protocol::ContentBlock;
    use unibox_shared::types::{ChannelType, PluginConnection, RunningStatus};

    use super::*;
    use crate::testing::{RecordingFactory, RecordingRelay, StaticPlugins};

    #[tokio::test]
    async fn start_send_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            database_path: Some(dir.path().join("core.db")),
            download_dir: dir.path().join("downloads"),
            ..CoreConfig::default()
        };
        let factory = Arc::new(RecordingFactory::default());
        let core = Core::start(
            config,
            CoreCollaborators {
                discovery: Arc::new(StaticPlugins(vec![1, 2])),
                transports: factory.clone(),
                cloud: CloudServiceTable::new(),
                fetcher: None,
                relay: Some(Arc::new(RecordingRelay::default())),
            },
        )
        .await
        .unwrap();

        let status = core.registry.status_snapshot();
        assert_eq!(status.get(&ChannelType(1)), Some(&RunningStatus::Running));
        assert_eq!(status.len(), 2);

        let mut events = core.subscribe();
        let report = core
            .send_message(OutboundRequest::new(
                PluginConnection::new(ChannelType(2), "room"),
                vec![ContentBlock::text("hello")],
            ))
            .await;
        assert!(report.verified);
        assert_eq!(*factory.plugin(2).sent.lock().unwrap(), vec![report.local_id]);
        assert_eq!(events.recv().await.unwrap().name(), crate::events::EVENT_NEW_MESSAGE);

        core.shutdown().await;
    }

    #[test]
    fn tracing_init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
