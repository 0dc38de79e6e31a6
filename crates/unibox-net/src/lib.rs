// Channel plumbing: plugin transports, per-channel workers, the registry and
// the push relay.

pub mod connection;
pub mod discovery;
pub mod registry;
pub mod relay;
pub mod transport;

pub use connection::{ChannelConnection, SendReceipt};
pub use discovery::{PluginDirectory, PluginDiscovery, PluginInfo, PluginManifest};
pub use registry::{ChannelRegistry, RegistryConfig, StatusSnapshot};
pub use relay::{HttpPushTransport, RelayTransport};
pub use transport::{ChannelTransport, ChannelTransportFactory, InboundEvent, InboundKind, InboundSink};
