//! Agent configuration.

use crate::broadcast::BroadcastConfig;
use crate::queue::QueueConfig;
use crate::transport::TransportConfig;
use anyhow::{Context, Result};
use opsync_remote::RemoteStoreConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device configuration
    pub device: DeviceConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Offline queue configuration
    pub queue: QueueConfig,

    /// Transport configuration
    pub transport: TransportSettings,

    /// Broadcast sync configuration
    pub broadcast: BroadcastConfig,

    /// Remote store; without one queued operations are only delivered to
    /// the peer
    pub remote: Option<RemoteStoreConfig>,

    /// How often the offline queue is drained
    pub drain_interval: Duration,
}

/// Device configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Fixed device id; persisted or generated when absent
    pub id: Option<String>,

    /// Human-readable name announced through presence
    pub name: String,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Database path
    pub db_path: PathBuf,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,

    /// Peer device for a point-to-point link; tenant-wide when absent
    pub peer_id: Option<String>,

    /// Channel tuning
    pub channel: TransportConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                id: None,
                name: "device".to_string(),
            },
            persistence: PersistenceConfig {
                db_path: PathBuf::from("./opsync.db"),
            },
            queue: QueueConfig::default(),
            transport: TransportSettings {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
                peer_id: None,
                channel: TransportConfig::default(),
            },
            broadcast: BroadcastConfig::default(),
            remote: None,
            drain_interval: Duration::from_secs(15),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPSYNC_DEVICE_ID`: Device identifier
    /// - `OPSYNC_DEVICE_NAME`: Display name
    /// - `OPSYNC_DB_PATH`: SQLite database path
    /// - `OPSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `OPSYNC_TENANT`: Tenant identifier
    /// - `OPSYNC_PEER_ID`: Peer device for the point-to-point link
    /// - `OPSYNC_REMOTE_URL`: Remote store URL
    /// - `OPSYNC_BEARER_TOKEN`: Remote store token
    /// - `OPSYNC_QUEUE_TTL_SECS`: Queue TTL in seconds
    /// - `OPSYNC_DRAIN_INTERVAL_SECS`: Queue drain cadence in seconds
    ///
    /// # Errors
    ///
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = var("OPSYNC_DEVICE_ID").filter(|id| !id.trim().is_empty()) {
            config.device.id = Some(id);
        }

        if let Some(name) = var("OPSYNC_DEVICE_NAME") {
            config.device.name = name;
        }

        if let Some(db_path) = var("OPSYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(mqtt) = var("OPSYNC_MQTT_BROKER") {
            config.transport.mqtt_broker = mqtt;
        }

        if let Some(tenant) = var("OPSYNC_TENANT") {
            config.transport.tenant = tenant;
        }

        if let Some(peer) = var("OPSYNC_PEER_ID") {
            config.transport.peer_id = Some(peer);
        }

        if let Some(url) = var("OPSYNC_REMOTE_URL") {
            config.remote = Some(RemoteStoreConfig {
                base_url: url,
                ..RemoteStoreConfig::default()
            });
        }

        if let Some(token) = var("OPSYNC_BEARER_TOKEN") {
            if let Some(remote) = config.remote.as_mut() {
                remote.bearer_token = Some(token);
            }
        }

        if let Some(ttl) = var("OPSYNC_QUEUE_TTL_SECS") {
            let secs: u64 = ttl.parse().context("Invalid OPSYNC_QUEUE_TTL_SECS")?;
            config.queue.ttl = Duration::from_secs(secs);
        }

        if let Some(interval) = var("OPSYNC_DRAIN_INTERVAL_SECS") {
            let secs: u64 = interval
                .parse()
                .context("Invalid OPSYNC_DRAIN_INTERVAL_SECS")?;
            config.drain_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert!(config.device.id.is_none());
        assert_eq!(config.persistence.db_path, PathBuf::from("./opsync.db"));
        assert_eq!(config.transport.mqtt_broker, "tcp://localhost:1883");
        assert_eq!(config.queue.ttl, Duration::from_secs(604_800));
        assert_eq!(config.drain_interval, Duration::from_secs(15));
        assert!(config.remote.is_none());
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("OPSYNC_DEVICE_ID", "phone"),
            ("OPSYNC_TENANT", "home"),
            ("OPSYNC_REMOTE_URL", "http://store:8090"),
            ("OPSYNC_BEARER_TOKEN", "secret"),
            ("OPSYNC_QUEUE_TTL_SECS", "60"),
        ])
        .unwrap();

        assert_eq!(config.device.id.as_deref(), Some("phone"));
        assert_eq!(config.transport.tenant, "home");
        let remote = config.remote.unwrap();
        assert_eq!(remote.base_url, "http://store:8090");
        assert_eq!(remote.bearer_token.as_deref(), Some("secret"));
        assert_eq!(config.queue.ttl, Duration::from_secs(60));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(load(&[("OPSYNC_QUEUE_TTL_SECS", "week")]).is_err());
    }
}
