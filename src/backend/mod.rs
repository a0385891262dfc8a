//! Storage behind the registry server.
//!
//! The server owns exactly one [`RegistryBackend`] and never reaches
//! around it; everything the backend returns on a read path has its
//! `health` field recomputed for the current instant, so a lapsed record
//! that the reaper has not yet removed can never be observed as healthy.

mod memory;
mod persistent;

pub use memory::MemoryBackend;
pub use persistent::PersistentBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::ServiceRecord;

/// How `discover_service` chooses among multiple healthy candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First record in the backend's iteration order.
    FirstFound,
    /// Uniformly random among healthy candidates.
    #[default]
    Random,
    /// Cycle through candidates across successive calls.
    RoundRobin,
}

/// Storage contract for service records with TTL leases.
///
/// Renewal is deliberately allowed on a record whose lease has lapsed but
/// that the reaper has not yet removed; this tolerates scheduling jitter
/// at the reaper boundary. A deregistered or reaped id can never be
/// renewed.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Prepare storage. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Insert or overwrite a record, starting a fresh lease.
    async fn register(&self, record: ServiceRecord) -> Result<()>;

    /// Extend the lease of an existing record by its own ttl.
    /// Returns `false` for an unknown id.
    async fn renew(&self, service_id: &str) -> Result<bool>;

    /// Remove a record outright. Returns `false` for an unknown id.
    async fn deregister(&self, service_id: &str) -> Result<bool>;

    /// Fetch one record by id, with health derived for now.
    async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>>;

    /// All non-expired records, optionally filtered by type.
    async fn list_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceRecord>>;

    /// One healthy record of the given type, per the backend's
    /// [`SelectionPolicy`], or `None`.
    async fn discover_service(&self, service_type: &str) -> Result<Option<ServiceRecord>>;

    /// Remove every record whose lease has lapsed and return their ids.
    async fn clean_expired_services(&self) -> Result<Vec<String>>;

    /// Release resources.
    async fn close(&self) -> Result<()>;
}
