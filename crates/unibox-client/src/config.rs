//! Process configuration loaded from environment variables.
//!
//! Every setting has a default so the core starts with zero configuration.
//! User-facing preferences (mode, cloud service, credentials) live in the
//! persisted settings table instead and are read at the point of use.

use std::path::PathBuf;
use std::time::Duration;

use unibox_shared::constants::{
    DOWNLOAD_POLL_MS, HEALTH_PROBE_SECS, PUSH_PROVIDER_DOMAIN, RELAY_GRACE_MS, STATUS_POLL_SECS,
};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite database file.
    /// Env: `UNIBOX_DB_PATH`
    /// Default: `<data dir>/unibox.db`
    pub database_path: Option<PathBuf>,

    /// Where downloaded attachments are written.
    /// Env: `UNIBOX_DOWNLOAD_DIR`
    /// Default: `<data dir>/downloads`
    pub download_dir: PathBuf,

    /// Env: `UNIBOX_STATUS_POLL_SECS`
    pub status_poll_interval: Duration,

    /// Env: `UNIBOX_HEALTH_PROBE_SECS`
    pub health_interval: Duration,

    /// Wait after an accepted relay push before marking it verified.
    /// Env: `UNIBOX_RELAY_GRACE_MS`
    pub relay_grace: Duration,

    /// Env: `UNIBOX_DOWNLOAD_POLL_MS`
    pub download_poll_interval: Duration,

    /// Domain appended to push tokens when addressing envelopes.
    /// Env: `UNIBOX_PUSH_DOMAIN`
    pub push_domain: String,

    /// Push gateway endpoint. Push delivery is unavailable when unset.
    /// Env: `UNIBOX_PUSH_GATEWAY_URL`
    pub push_gateway_url: Option<String>,

    /// Env: `UNIBOX_PUSH_TIMEOUT_SECS`
    pub push_timeout: Duration,

    /// Capacity of the shared inbound event queue.
    /// Env: `UNIBOX_INBOUND_QUEUE`
    pub inbound_queue_depth: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let download_dir = unibox_store::database::default_data_dir()
            .map(|d| d.join("downloads"))
            .unwrap_or_else(|_| PathBuf::from("./downloads"));

        Self {
            database_path: None,
            download_dir,
            status_poll_interval: Duration::from_secs(STATUS_POLL_SECS),
            health_interval: Duration::from_secs(HEALTH_PROBE_SECS),
            relay_grace: Duration::from_millis(RELAY_GRACE_MS),
            download_poll_interval: Duration::from_millis(DOWNLOAD_POLL_MS),
            push_domain: PUSH_PROVIDER_DOMAIN.to_string(),
            push_gateway_url: None,
            push_timeout: Duration::from_secs(10),
            inbound_queue_depth: 256,
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("UNIBOX_DB_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("UNIBOX_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }

        if let Some(d) = duration_var(&lookup, "UNIBOX_STATUS_POLL_SECS", Duration::from_secs) {
            config.status_poll_interval = d;
        }
        if let Some(d) = duration_var(&lookup, "UNIBOX_HEALTH_PROBE_SECS", Duration::from_secs) {
            config.health_interval = d;
        }
        if let Some(d) = duration_var(&lookup, "UNIBOX_RELAY_GRACE_MS", Duration::from_millis) {
            config.relay_grace = d;
        }
        if let Some(d) = duration_var(&lookup, "UNIBOX_DOWNLOAD_POLL_MS", Duration::from_millis) {
            config.download_poll_interval = d;
        }
        if let Some(d) = duration_var(&lookup, "UNIBOX_PUSH_TIMEOUT_SECS", Duration::from_secs) {
            config.push_timeout = d;
        }

        if let Some(domain) = lookup("UNIBOX_PUSH_DOMAIN").filter(|d| !d.trim().is_empty()) {
            config.push_domain = domain.trim().to_string();
        }
        if let Some(url) = lookup("UNIBOX_PUSH_GATEWAY_URL") {
            if url.starts_with("http://") || url.starts_with("https://") {
                config.push_gateway_url = Some(url);
            } else {
                tracing::warn!(value = %url, "Invalid UNIBOX_PUSH_GATEWAY_URL, push disabled");
            }
        }

        if let Some(raw) = lookup("UNIBOX_INBOUND_QUEUE") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.inbound_queue_depth = n,
                _ => tracing::warn!(value = %raw, "Invalid UNIBOX_INBOUND_QUEUE, using default"),
            }
        }

        config
    }
}

/// Parse a positive integer variable. Zero and garbage are rejected with a warning.
fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    unit: fn(u64) -> Duration,
) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(unit(n)),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> CoreConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CoreConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]);
        assert_eq!(config.status_poll_interval, Duration::from_secs(2));
        assert_eq!(config.relay_grace, Duration::from_millis(500));
        assert_eq!(config.download_poll_interval, Duration::from_secs(1));
        assert_eq!(config.push_domain, "fcm.googleapis.com");
        assert!(config.push_gateway_url.is_none());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn overrides_and_invalid_values() {
        let config = load(&[
            ("UNIBOX_RELAY_GRACE_MS", "50"),
            ("UNIBOX_STATUS_POLL_SECS", "zero"),
            ("UNIBOX_HEALTH_PROBE_SECS", "0"),
            ("UNIBOX_PUSH_GATEWAY_URL", "ftp://nope"),
            ("UNIBOX_DB_PATH", "/tmp/x.db"),
        ]);
        assert_eq!(config.relay_grace, Duration::from_millis(50));
        assert_eq!(config.status_poll_interval, Duration::from_secs(2));
        assert_eq!(config.health_interval, Duration::from_secs(5));
        assert!(config.push_gateway_url.is_none());
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/x.db")));
    }
}
