//! The set of bound channels, keyed by channel type.
//!
//! The map is replaced whole by the lifecycle methods and read through
//! cheap `Arc` snapshots by everyone else.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use unibox_shared::constants::{HEALTH_PROBE_SECS, STATUS_POLL_SECS};
use unibox_shared::protocol::SendMessageDto;
use unibox_shared::types::{ChannelType, RunningStatus};
use unibox_shared::CoreError;

use crate::connection::ChannelConnection;
use crate::discovery::{PluginDirectory, PluginDiscovery, PluginInfo};
use crate::transport::{ChannelTransportFactory, InboundEvent};

type ChannelMap = HashMap<ChannelType, Arc<ChannelConnection>>;

/// Snapshot of every discovered plugin's status.
pub type StatusSnapshot = BTreeMap<ChannelType, RunningStatus>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub status_poll_interval: Duration,
    pub health_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(STATUS_POLL_SECS),
            health_interval: Duration::from_secs(HEALTH_PROBE_SECS),
        }
    }
}

pub struct ChannelRegistry {
    discovery: Arc<dyn PluginDiscovery>,
    factory: Arc<dyn ChannelTransportFactory>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    config: RegistryConfig,
    directory: PluginDirectory,
    plugins: RwLock<Arc<Vec<PluginInfo>>>,
    channels: RwLock<Arc<ChannelMap>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ChannelRegistry {
    pub fn new(
        discovery: Arc<dyn PluginDiscovery>,
        factory: Arc<dyn ChannelTransportFactory>,
        inbound_tx: mpsc::Sender<InboundEvent>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            discovery,
            factory,
            inbound_tx,
            config,
            directory: PluginDirectory::new(),
            plugins: RwLock::new(Arc::new(Vec::new())),
            channels: RwLock::new(Arc::new(HashMap::new())),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    // -- discovery ----------------------------------------------------------

    /// Enumerate installed plugins. A channel type claimed twice keeps its first plugin.
    pub async fn discover(&self) -> Vec<PluginInfo> {
        let manifests = match self.discovery.installed().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Plugin discovery failed");
                Vec::new()
            }
        };

        let mut found: Vec<PluginInfo> = Vec::with_capacity(manifests.len());
        for manifest in &manifests {
            let plugin = PluginInfo::from_manifest(manifest);
            if found.iter().any(|p| p.channel_type == plugin.channel_type) {
                warn!(
                    channel_type = %plugin.channel_type,
                    package = %plugin.package,
                    "Duplicate channel type, plugin ignored"
                );
                continue;
            }
            self.directory.record(plugin.channel_type, &plugin.channel_name);
            found.push(plugin);
        }

        info!(count = found.len(), "Discovered plugins");
        *self.plugins.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(found.clone());
        found
    }

    pub fn installed(&self) -> Arc<Vec<PluginInfo>> {
        Arc::clone(&self.plugins.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn plugin_name(&self, channel_type: ChannelType) -> String {
        self.directory.name(channel_type)
    }

    pub fn directory(&self) -> &PluginDirectory {
        &self.directory
    }

    // -- lifecycle ----------------------------------------------------------

    fn snapshot(&self) -> Arc<ChannelMap> {
        Arc::clone(&self.channels.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn replace(&self, map: ChannelMap) {
        *self.channels.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);
    }

    /// Bind every discovered plugin concurrently.
    ///
    /// Plugins that fail to bind are left in `Error`; the others are unaffected.
    pub async fn connect_all(&self) -> StatusSnapshot {
        let _guard = self.lifecycle.lock().await;

        let mut map: ChannelMap = (*self.snapshot()).clone();
        for plugin in self.installed().iter() {
            if map.contains_key(&plugin.channel_type) {
                continue;
            }
            match self.factory.create(plugin) {
                Ok(transport) => {
                    let conn = ChannelConnection::spawn(
                        plugin.clone(),
                        transport,
                        self.inbound_tx.clone(),
                        self.config.health_interval,
                    );
                    map.insert(plugin.channel_type, Arc::new(conn));
                }
                Err(e) => {
                    warn!(channel_type = %plugin.channel_type, error = %e, "No transport for plugin");
                }
            }
        }
        let connections: Vec<Arc<ChannelConnection>> = map.values().cloned().collect();
        self.replace(map);

        // Failures are logged by the connection and reflected in its status.
        join_all(connections.iter().map(|c| c.connect())).await;

        self.status_snapshot()
    }

    /// Tear down every connection and release its binding.
    pub async fn disconnect_all(&self) {
        let _guard = self.lifecycle.lock().await;

        let previous = self.snapshot();
        self.replace(HashMap::new());

        join_all(previous.values().map(|conn| async move {
            conn.disconnect().await;
            conn.shutdown();
        }))
        .await;
        info!(count = previous.len(), "All channels disconnected");
    }

    // -- status -------------------------------------------------------------

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let channels = self.snapshot();
        self.installed()
            .iter()
            .map(|p| {
                let status = channels
                    .get(&p.channel_type)
                    .map(|c| RunningStatus::from(c.status()))
                    .unwrap_or(RunningStatus::Disabled);
                (p.channel_type, status)
            })
            .collect()
    }

    /// Poll [`status_snapshot`](Self::status_snapshot) on the configured interval.
    ///
    /// The first snapshot is immediate. Each call starts a fresh stream; the
    /// stream ends when the registry is dropped and stops polling as soon as
    /// it is dropped itself.
    pub fn status_stream(self: &Arc<Self>) -> impl Stream<Item = StatusSnapshot> + Send + 'static {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.status_poll_interval;

        stream::unfold((weak, None::<tokio::time::Interval>), move |(weak, ticker)| async move {
            let mut ticker = ticker.unwrap_or_else(|| {
                let mut t = tokio::time::interval(period);
                t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                t
            });
            ticker.tick().await;
            let snapshot = weak.upgrade()?.status_snapshot();
            Some((snapshot, (weak, Some(ticker))))
        })
    }

    // -- messaging ----------------------------------------------------------

    pub fn connection(&self, channel_type: ChannelType) -> Option<Arc<ChannelConnection>> {
        self.snapshot().get(&channel_type).cloned()
    }

    /// Deliver through the plugin bound for the DTO's channel type.
    pub async fn send_message(&self, dto: SendMessageDto) -> Result<(), CoreError> {
        let channel_type = dto.plugin_connection.channel_type;
        let Some(conn) = self.connection(channel_type) else {
            warn!(channel_type = %channel_type, msg_id = dto.message_id, "Send to uninstalled channel");
            return Err(CoreError::ChannelNotInstalled(channel_type));
        };
        conn.send(dto).await.outcome().await
    }

    pub async fn recall_message(
        &self,
        channel_type: ChannelType,
        message_id: i64,
    ) -> Result<bool, CoreError> {
        let Some(conn) = self.connection(channel_type) else {
            warn!(channel_type = %channel_type, msg_id = message_id, "Recall on uninstalled channel");
            return Err(CoreError::ChannelNotInstalled(channel_type));
        };
        Ok(conn.recall(message_id).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::connection::tests::{dto, FakeTransport, Shared};
    use crate::discovery::PluginManifest;
    use crate::transport::ChannelTransport;

    struct StaticDiscovery(Vec<PluginManifest>);

    #[async_trait]
    impl PluginDiscovery for StaticDiscovery {
        async fn installed(&self) -> anyhow::Result<Vec<PluginManifest>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        transports: Mutex<HashMap<ChannelType, Arc<FakeTransport>>>,
        failing: Vec<ChannelType>,
    }

    impl FakeFactory {
        fn transport(&self, ty: i32) -> Arc<FakeTransport> {
            Arc::clone(&self.transports.lock().unwrap()[&ChannelType(ty)])
        }
    }

    impl ChannelTransportFactory for FakeFactory {
        fn create(&self, plugin: &PluginInfo) -> anyhow::Result<Box<dyn ChannelTransport>> {
            let fake = FakeTransport::new();
            if self.failing.contains(&plugin.channel_type) {
                fake.fail_connect.store(true, Ordering::SeqCst);
            }
            self.transports
                .lock()
                .unwrap()
                .insert(plugin.channel_type, Arc::clone(&fake));
            Ok(Box::new(Shared(fake)))
        }
    }

    fn manifest(ty: &str, name: &str) -> PluginManifest {
        PluginManifest {
            package: format!("org.example.{name}"),
            label: name.to_string(),
            version: "1".into(),
            metadata: [
                ("connection_type".to_string(), ty.to_string()),
                ("connection_name".to_string(), name.to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn registry(manifests: Vec<PluginManifest>, factory: Arc<FakeFactory>) -> Arc<ChannelRegistry> {
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(ChannelRegistry::new(
            Arc::new(StaticDiscovery(manifests)),
            factory,
            tx,
            RegistryConfig {
                status_poll_interval: Duration::from_millis(10),
                health_interval: Duration::from_secs(60),
            },
        ))
    }

    #[tokio::test]
    async fn failed_bind_does_not_block_others() {
        let factory = Arc::new(FakeFactory {
            failing: vec![ChannelType(2)],
            ..Default::default()
        });
        let reg = registry(
            vec![manifest("1", "Alpha"), manifest("2", "Beta")],
            Arc::clone(&factory),
        );
        reg.discover().await;

        let status = reg.connect_all().await;
        assert_eq!(status[&ChannelType(1)], RunningStatus::Running);
        assert_eq!(status[&ChannelType(2)], RunningStatus::Error);
        assert_eq!(reg.plugin_name(ChannelType(2)), "Beta");
        assert_eq!(reg.plugin_name(ChannelType(9)), "Unknown");
    }

    #[tokio::test]
    async fn uninstalled_channel_is_reported() {
        let reg = registry(vec![manifest("1", "Alpha")], Arc::new(FakeFactory::default()));
        reg.discover().await;
        reg.connect_all().await;

        let err = reg.send_message(dto(5, 1)).await.unwrap_err();
        assert_eq!(err, CoreError::ChannelNotInstalled(ChannelType(5)));
        assert!(matches!(
            reg.recall_message(ChannelType(5), 1).await,
            Err(CoreError::ChannelNotInstalled(_))
        ));
    }

    #[tokio::test]
    async fn send_routes_to_matching_channel() {
        let factory = Arc::new(FakeFactory::default());
        let reg = registry(
            vec![manifest("1", "Alpha"), manifest("2", "Beta")],
            Arc::clone(&factory),
        );
        reg.discover().await;
        reg.connect_all().await;

        reg.send_message(dto(2, 11)).await.unwrap();
        assert_eq!(*factory.transport(2).sent.lock().unwrap(), vec![11]);
        assert!(factory.transport(1).sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_stream_restarts_and_stops() {
        let reg = registry(vec![manifest("1", "Alpha")], Arc::new(FakeFactory::default()));
        reg.discover().await;

        let first: Vec<_> = reg.status_stream().take(2).collect().await;
        assert!(first
            .iter()
            .all(|s| s[&ChannelType(1)] == RunningStatus::Disabled));

        reg.connect_all().await;
        let mut again = Box::pin(reg.status_stream());
        assert_eq!(
            again.next().await.unwrap()[&ChannelType(1)],
            RunningStatus::Running
        );

        let weak = Arc::downgrade(&reg);
        drop(reg);
        assert!(weak.upgrade().is_none());
        assert!(again.next().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_all_clears_map() {
        let factory = Arc::new(FakeFactory::default());
        let reg = registry(vec![manifest("1", "Alpha")], Arc::clone(&factory));
        reg.discover().await;
        reg.connect_all().await;

        reg.disconnect_all().await;
        assert!(reg.connection(ChannelType(1)).is_none());
        assert_eq!(reg.status_snapshot()[&ChannelType(1)], RunningStatus::Disabled);
        assert_eq!(factory.transport(1).disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_channel_type_keeps_first() {
        let reg = registry(
            vec![manifest("3", "First"), manifest("3", "Second")],
            Arc::new(FakeFactory::default()),
        );
        let found = reg.discover().await;
        assert_eq!(found.len(), 1);
        assert_eq!(reg.plugin_name(ChannelType(3)), "First");
    }
}
