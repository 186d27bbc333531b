//! Engine configuration.

use crate::error::{PubSubError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Largest NOTIFY payload Postgres accepts (it must be shorter than 8000 bytes).
pub const DEFAULT_NOTIFY_PAYLOAD_LIMIT: usize = 7999;

/// How many messages a stream keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep all messages (no cleanup).
    KeepAll,
    /// Keep the newest N messages.
    KeepCount(u64),
}

impl RetentionPolicy {
    /// The number of messages to keep, if bounded.
    pub fn threshold(&self) -> Option<u64> {
        match self {
            RetentionPolicy::KeepAll => None,
            RetentionPolicy::KeepCount(n) => Some(*n),
        }
    }
}

/// Which notification transport to connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportConfig {
    /// In-process hub; single node only.
    Loopback,
    /// Postgres LISTEN/NOTIFY.
    Postgres { url: String },
}

/// Pub/sub engine configuration.
#[derive(Clone, Debug)]
pub struct PubSubConfig {
    /// SQLite database holding streams and messages (None = in-memory).
    pub database_path: Option<PathBuf>,

    /// Notification transport.
    pub transport: TransportConfig,

    /// Max serialized envelope size before the payload is stripped.
    pub notify_payload_limit: usize,

    /// Reconnect attempts before the dispatcher gives up.
    pub reconnect_attempts: u32,

    /// Delay before the first reconnect; doubles per attempt.
    pub reconnect_base_delay: Duration,

    /// Per-stream retention.
    pub retention: RetentionPolicy,

    /// Command queue depth that triggers a backlog warning.
    pub queue_high_water: usize,

    /// Upper bound on a single transport wait.
    pub poll_interval: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            transport: TransportConfig::Loopback,
            notify_payload_limit: DEFAULT_NOTIFY_PAYLOAD_LIMIT,
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            retention: RetentionPolicy::KeepCount(1000),
            queue_high_water: 10_000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl PubSubConfig {
    /// Build a configuration from `PUBSUB_*` environment variables.
    ///
    /// Unset variables keep their defaults. `PUBSUB_DATABASE_URL` selects the
    /// Postgres transport. `PUBSUB_RETENTION` takes a message count, or `all`
    /// to disable cleanup.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("PUBSUB_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("PUBSUB_DATABASE_URL") {
            config.transport = TransportConfig::Postgres { url };
        }
        if let Some(v) = lookup("PUBSUB_NOTIFY_PAYLOAD_LIMIT") {
            config.notify_payload_limit = parse_number("PUBSUB_NOTIFY_PAYLOAD_LIMIT", &v)?;
        }
        if let Some(v) = lookup("PUBSUB_RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = parse_number("PUBSUB_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("PUBSUB_RECONNECT_DELAY") {
            let secs: f64 = parse_number("PUBSUB_RECONNECT_DELAY", &v)?;
            config.reconnect_base_delay = Duration::try_from_secs_f64(secs)
                .map_err(|e| PubSubError::Config(format!("PUBSUB_RECONNECT_DELAY: {e}")))?;
        }
        if let Some(v) = lookup("PUBSUB_RETENTION") {
            config.retention = if v.eq_ignore_ascii_case("all") {
                RetentionPolicy::KeepAll
            } else {
                RetentionPolicy::KeepCount(parse_number("PUBSUB_RETENTION", &v)?)
            };
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PubSubError::Config(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = PubSubConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.transport, TransportConfig::Loopback);
        assert_eq!(config.notify_payload_limit, DEFAULT_NOTIFY_PAYLOAD_LIMIT);
        assert_eq!(config.retention, RetentionPolicy::KeepCount(1000));
    }

    #[test]
    fn test_env_overrides() {
        let config = PubSubConfig::from_lookup(lookup(&[
            ("PUBSUB_DATABASE_URL", "postgres://localhost/app"),
            ("PUBSUB_RECONNECT_ATTEMPTS", "3"),
            ("PUBSUB_RECONNECT_DELAY", "0.25"),
            ("PUBSUB_RETENTION", "all"),
        ]))
        .unwrap();

        assert_eq!(
            config.transport,
            TransportConfig::Postgres {
                url: "postgres://localhost/app".to_string()
            }
        );
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(config.retention, RetentionPolicy::KeepAll);
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let result = PubSubConfig::from_lookup(lookup(&[("PUBSUB_RETENTION", "lots")]));
        assert!(matches!(result, Err(PubSubError::Config(_))));
    }
}
