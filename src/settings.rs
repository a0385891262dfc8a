//! Layered configuration for the registry server and its clients.
//!
//! Values resolve in order: compiled defaults, then an optional config
//! file, then `SVCREG__`-prefixed environment variables. Each subsystem
//! gets its own section so a process embedding only the client does not
//! need server settings.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::connector::{BackoffStrategy, JitterStrategy};

/// Default port for the request/reply channel.
pub const DEFAULT_REQ_PORT: u16 = 4242;
/// Default port for the publish channel.
pub const DEFAULT_PUB_PORT: u16 = 4243;
/// Default lease duration granted to registrations, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 30;

/// Root configuration combining all subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub connector: ConnectorSettings,
}

/// Registry server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Port for the request/reply channel.
    pub req_port: u16,
    /// Port for the publish channel.
    pub pub_port: u16,
    /// Lease granted when a registration does not specify a ttl, seconds.
    pub default_ttl: u64,
    /// Seconds between expiry sweeps.
    pub cleanup_interval: u64,
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            req_port: DEFAULT_REQ_PORT,
            pub_port: DEFAULT_PUB_PORT,
            default_ttl: DEFAULT_TTL_SECS,
            cleanup_interval: 10,
            storage: StorageSettings::default(),
        }
    }
}

/// Which backend holds the registry state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum StorageSettings {
    /// In-process map, lost on restart.
    #[default]
    Memory,
    /// Embedded database surviving restarts.
    Persistent { db_path: PathBuf },
}

/// Registry client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Registry server host.
    pub host: String,
    /// Port for the request/reply channel.
    pub req_port: u16,
    /// Port for the publish channel.
    pub pub_port: u16,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Heartbeat period in seconds; `None` derives ttl/3 at start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            req_port: DEFAULT_REQ_PORT,
            pub_port: DEFAULT_PUB_PORT,
            timeout_ms: 5000,
            heartbeat_interval: None,
        }
    }
}

/// Connection-management policy for service connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSettings {
    /// Base retry interval in seconds.
    pub base_retry_interval: u64,
    /// Cap on the computed retry interval in seconds.
    pub max_retry_interval: u64,
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,
    /// How long an open circuit rejects attempts, in seconds.
    pub circuit_open_duration: u64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            base_retry_interval: 1,
            max_retry_interval: 300,
            max_failures: 5,
            circuit_open_duration: 60,
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RegistrySettings {
    /// Load settings from defaults, an optional file and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&RegistrySettings::default())?);

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path.to_path_buf()));
        } else {
            builder = builder.add_source(File::with_name("svcreg").required(false));
        }

        builder
            .add_source(Environment::with_prefix("SVCREG").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RegistrySettings::default();
        assert_eq!(settings.server.req_port, 4242);
        assert_eq!(settings.server.pub_port, 4243);
        assert_eq!(settings.server.default_ttl, 30);
        assert_eq!(settings.server.storage, StorageSettings::Memory);
        assert_eq!(settings.client.timeout_ms, 5000);
        assert_eq!(settings.connector.base_retry_interval, 1);
        assert_eq!(settings.connector.max_retry_interval, 300);
        assert_eq!(settings.connector.max_failures, 5);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let settings = RegistrySettings::load(None).unwrap();
        assert_eq!(settings.server.req_port, DEFAULT_REQ_PORT);
        assert_eq!(settings.client.host, "localhost");
    }

    #[test]
    fn test_storage_settings_from_toml() {
        let parsed: StorageSettings =
            toml::from_str("kind = \"persistent\"\ndb_path = \"/tmp/reg.redb\"").unwrap();
        assert_eq!(
            parsed,
            StorageSettings::Persistent { db_path: PathBuf::from("/tmp/reg.redb") }
        );
    }
}
