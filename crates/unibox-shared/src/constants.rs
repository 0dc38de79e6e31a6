/// Application name
pub const APP_NAME: &str = "Unibox";

/// Name used when a plugin does not advertise `connection_name`
pub const UNKNOWN_CHANNEL_NAME: &str = "Unknown";

/// Plugin metadata keys
pub const META_CONNECTION_TYPE: &str = "connection_type";
pub const META_CONNECTION_NAME: &str = "connection_name";

/// Registry status polling interval in seconds
pub const STATUS_POLL_SECS: u64 = 2;

/// Connection health probe interval in seconds
pub const HEALTH_PROBE_SECS: u64 = 5;

/// Grace period before a relay push is considered verified (no provider ack)
pub const RELAY_GRACE_MS: u64 = 500;

/// Download progress polling interval in milliseconds
pub const DOWNLOAD_POLL_MS: u64 = 1000;

/// Push provider domain used to address `<token>@<domain>`
pub const PUSH_PROVIDER_DOMAIN: &str = "fcm.googleapis.com";

/// Sender key recorded for messages authored on this device
pub const LOCAL_SENDER_KEY: &str = "self";

/// Auto-backup size threshold meaning "no limit", in MiB
pub const AUTO_BACKUP_UNLIMITED_MB: f64 = 100.0;

/// Default auto-backup size threshold, in MiB
pub const AUTO_BACKUP_DEFAULT_MB: f64 = 10.0;

/// Per-connection command queue depth
pub const CONNECTION_QUEUE_DEPTH: usize = 256;
