//! Service registry infrastructure for distributed lab control systems.
//!
//! This crate provides:
//! - A ZMQ-based registry server ([`RegistryServer`](server::RegistryServer))
//!   exposing a REQ/REP channel for registration, renewal, discovery and
//!   expiry of leased service records, and a PUB channel for lifecycle events
//! - Pluggable TTL storage backends ([`MemoryBackend`](backend::MemoryBackend),
//!   [`PersistentBackend`](backend::PersistentBackend))
//! - Async and blocking registry clients with a background heartbeat
//! - A backoff/circuit-breaker connector for resilient outbound links to
//!   discovered services
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use svcreg_core::prelude::*;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let server = RegistryServer::bind_tcp(backend, ServerSettings::default());
//! let context = Arc::clone(server.context());
//! let mut handle = server.start().await?;
//!
//! let client = RegistryClient::new(context, &TransportConfig::tcp("localhost", 4242), 5000);
//! let service_id = client.register("hexapod-cs", "127.0.0.1", 6700, Some("hexapod"), None).await?;
//! client.start_heartbeat(None).await?;
//! ```

pub mod backend;
pub mod client;
pub mod connector;
pub mod error;
pub mod events;
pub mod protocol;
pub mod record;
pub mod server;
pub mod settings;
pub mod transport;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{MemoryBackend, PersistentBackend, RegistryBackend, SelectionPolicy};
    pub use crate::client::{RegistryClient, SyncRegistryClient};
    pub use crate::connector::{
        apply_jitter, calculate_retry_interval, BackoffStrategy, ConnectionState, JitterStrategy,
        ServiceConnector,
    };
    pub use crate::error::{RegistryError, Result};
    pub use crate::events::{EventPublisher, EventSubscriber};
    pub use crate::protocol::{RegistryEvent, Reply, Request};
    pub use crate::record::{HealthStatus, ServiceInfo, ServiceRecord};
    pub use crate::server::{RegistryServer, ServerHandle};
    pub use crate::settings::{
        ClientSettings, ConnectorSettings, RegistrySettings, ServerSettings, StorageSettings,
        DEFAULT_PUB_PORT, DEFAULT_REQ_PORT, DEFAULT_TTL_SECS,
    };
    pub use crate::transport::TransportConfig;
}

pub use error::{RegistryError, Result};
pub use record::{HealthStatus, ServiceInfo, ServiceRecord};
