//! In-process fakes shared by the client tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use unibox_net::{
    ChannelRegistry, ChannelTransport, ChannelTransportFactory, InboundEvent, InboundSink,
    PluginDiscovery, PluginInfo, PluginManifest, RegistryConfig, RelayTransport,
};
use unibox_shared::constants::{META_CONNECTION_NAME, META_CONNECTION_TYPE};
use unibox_shared::protocol::{PushEnvelope, SendMessageDto};
use unibox_shared::types::{ChannelType, CloudService};
use unibox_shared::CoreError;
use unibox_store::DeliveryLedger;

use crate::cloud::tests::MemoryCloud;
use crate::cloud::CloudServiceTable;
use crate::events::EventBus;
use crate::router::MessageRouter;

pub(crate) struct StaticPlugins(pub Vec<i32>);

#[async_trait]
impl PluginDiscovery for StaticPlugins {
    async fn installed(&self) -> anyhow::Result<Vec<PluginManifest>> {
        Ok(self
            .0
            .iter()
            .map(|ty| PluginManifest {
                package: format!("plugin.{ty}"),
                label: format!("Plugin {ty}"),
                version: "1.0".into(),
                metadata: HashMap::from([
                    (META_CONNECTION_TYPE.to_string(), ty.to_string()),
                    (META_CONNECTION_NAME.to_string(), format!("Channel {ty}")),
                ]),
            })
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct RecordingPlugin {
    pub sent: Mutex<Vec<i64>>,
    pub recalled: Mutex<Vec<i64>>,
}

struct PluginHandle(Arc<RecordingPlugin>);

#[async_trait]
impl ChannelTransport for PluginHandle {
    async fn connect(&self, _sink: InboundSink) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, dto: &SendMessageDto) -> anyhow::Result<()> {
        self.0.sent.lock().unwrap().push(dto.message_id);
        Ok(())
    }

    async fn recall(&self, message_id: i64) -> anyhow::Result<()> {
        self.0.recalled.lock().unwrap().push(message_id);
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[derive(Default)]
pub(crate) struct RecordingFactory {
    plugins: Mutex<HashMap<ChannelType, Arc<RecordingPlugin>>>,
}

impl RecordingFactory {
    pub(crate) fn plugin(&self, ty: i32) -> Arc<RecordingPlugin> {
        Arc::clone(
            self.plugins
                .lock()
                .unwrap()
                .entry(ChannelType(ty))
                .or_default(),
        )
    }
}

impl ChannelTransportFactory for RecordingFactory {
    fn create(&self, plugin: &PluginInfo) -> anyhow::Result<Box<dyn ChannelTransport>> {
        Ok(Box::new(PluginHandle(self.plugin(plugin.channel_type.0))))
    }
}

/// Accepts every push except those addressed to rejected tokens.
#[derive(Default)]
pub(crate) struct RecordingRelay {
    sent: Mutex<Vec<(PushEnvelope, String)>>,
    rejected: Mutex<HashSet<String>>,
}

impl RecordingRelay {
    pub(crate) fn reject(&self, token: &str) {
        self.rejected.lock().unwrap().insert(token.to_string());
    }

    pub(crate) fn pushes(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub(crate) fn sent(&self) -> Vec<(PushEnvelope, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for RecordingRelay {
    async fn push(&self, envelope: &PushEnvelope, target_token: &str) -> Result<(), CoreError> {
        self.sent
            .lock()
            .unwrap()
            .push((envelope.clone(), target_token.to_string()));
        if self.rejected.lock().unwrap().contains(target_token) {
            return Err(CoreError::TransportPushFailure(format!("{target_token} unregistered")));
        }
        Ok(())
    }
}

/// A router over an in-memory ledger with recording plugins and relay.
pub(crate) struct Harness {
    pub ledger: DeliveryLedger,
    pub events: EventBus,
    pub registry: Arc<ChannelRegistry>,
    pub factory: Arc<RecordingFactory>,
    pub relay: Arc<RecordingRelay>,
    pub cloud: Arc<MemoryCloud>,
    pub router: Arc<MessageRouter>,
    _inbound: mpsc::Receiver<InboundEvent>,
}

impl Harness {
    pub(crate) async fn new(channel_types: &[i32]) -> Self {
        let ledger = DeliveryLedger::open_in_memory().unwrap();
        let events = EventBus::default();
        let factory = Arc::new(RecordingFactory::default());
        let (tx, rx) = mpsc::channel(64);
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(StaticPlugins(channel_types.to_vec())),
            factory.clone(),
            tx,
            RegistryConfig {
                status_poll_interval: Duration::from_millis(20),
                health_interval: Duration::from_secs(3600),
            },
        ));
        registry.discover().await;
        registry.connect_all().await;

        let relay = Arc::new(RecordingRelay::default());
        let cloud = Arc::new(MemoryCloud::default());
        let table = CloudServiceTable::new().register(CloudService::OneDrive, cloud.clone());
        let router = Arc::new(MessageRouter::new(
            ledger.clone(),
            Arc::clone(&registry),
            Some(relay.clone() as Arc<dyn RelayTransport>),
            Arc::new(table),
            events.clone(),
            "push.test",
            Duration::from_millis(500),
        ));

        Self {
            ledger,
            events,
            registry,
            factory,
            relay,
            cloud,
            router,
            _inbound: rx,
        }
    }

    pub(crate) fn plugin(&self, ty: i32) -> Arc<RecordingPlugin> {
        self.factory.plugin(ty)
    }
}
