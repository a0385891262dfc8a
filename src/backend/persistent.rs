//! Embedded-database backend; registrations survive a server restart.
//!
//! One table, `&str` keys (service ids) and `&[u8]` values
//! (JSON-serialized [`ServiceRecord`]s). Each operation is one
//! transaction; redb gives single-writer semantics, so a cleanup sweep
//! and a concurrent register cannot interleave mid-write.

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RegistryBackend, SelectionPolicy};
use crate::error::{RegistryError, Result};
use crate::record::ServiceRecord;

const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// redb-backed storage.
pub struct PersistentBackend {
    db: Database,
    policy: SelectionPolicy,
    round_robin: AtomicUsize,
}

impl PersistentBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Ok(Self {
            db,
            policy: SelectionPolicy::default(),
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn encode(record: &ServiceRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(record)
            .map_err(|e| RegistryError::Backend(format!("encode record: {e}")))
    }

    fn decode(raw: &[u8]) -> Result<ServiceRecord> {
        serde_json::from_slice(raw)
            .map_err(|e| RegistryError::Backend(format!("decode record: {e}")))
    }

    fn read_all(&self) -> Result<Vec<ServiceRecord>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(SERVICES) {
            Ok(table) => table,
            // First read before any write: the table does not exist yet.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(Self::decode(value.value())?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RegistryBackend for PersistentBackend {
    async fn initialize(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(SERVICES)?;
        txn.commit()?;
        Ok(())
    }

    async fn register(&self, record: ServiceRecord) -> Result<()> {
        let encoded = Self::encode(&record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SERVICES)?;
            table.insert(record.id.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn renew(&self, service_id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let renewed = {
            let mut table = txn.open_table(SERVICES)?;
            let existing = table.get(service_id)?.map(|v| v.value().to_vec());
            match existing {
                Some(raw) => {
                    let mut record = Self::decode(&raw)?;
                    record.renew(Utc::now());
                    let encoded = Self::encode(&record)?;
                    table.insert(service_id, encoded.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(renewed)
    }

    async fn deregister(&self, service_id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SERVICES)?;
            let removed = table.remove(service_id)?.is_some();
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(SERVICES) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = table.get(service_id)?.map(|v| v.value().to_vec());
        match raw {
            Some(raw) => Ok(Some(Self::decode(&raw)?.refreshed(Utc::now()))),
            None => Ok(None),
        }
    }

    async fn list_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceRecord>> {
        let now = Utc::now();
        let mut records: Vec<_> = self
            .read_all()?
            .into_iter()
            .filter(|record| !record.is_expired(now))
            .filter(|record| service_type.map_or(true, |t| record.matches_type(t)))
            .map(|record| record.refreshed(now))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn discover_service(&self, service_type: &str) -> Result<Option<ServiceRecord>> {
        let candidates = self.list_services(Some(service_type)).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        let chosen = match self.policy {
            SelectionPolicy::FirstFound => candidates.into_iter().next(),
            SelectionPolicy::Random => candidates.choose(&mut rand::thread_rng()).cloned(),
            SelectionPolicy::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.into_iter().nth(index)
            }
        };
        Ok(chosen)
    }

    async fn clean_expired_services(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let txn = self.db.begin_write()?;
        let expired = {
            let mut table = txn.open_table(SERVICES)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let record = Self::decode(value.value())?;
                if record.is_expired(now) {
                    expired.push(key.value().to_owned());
                }
            }
            for id in &expired {
                table.remove(id.as_str())?;
            }
            expired
        };
        txn.commit()?;
        Ok(expired)
    }

    async fn close(&self) -> Result<()> {
        // Database flushes on drop; committed transactions are durable.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HealthStatus, ServiceInfo};
    use chrono::Duration as ChronoDuration;

    fn record(name: &str) -> ServiceRecord {
        let mut info = ServiceInfo::new(name, "127.0.0.1", 6100).with_type("daq");
        info.ensure_id();
        ServiceRecord::from_info(info, 30, Utc::now())
    }

    #[tokio::test]
    async fn test_round_trip_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.redb");
        let stored = record("daq-cs");

        {
            let backend = PersistentBackend::open(&path).unwrap();
            backend.initialize().await.unwrap();
            backend.register(stored.clone()).await.unwrap();
        }

        // Reopen: the registration must still be there.
        let backend = PersistentBackend::open(&path).unwrap();
        let fetched = backend.get_service(&stored.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, stored.id);
        assert_eq!(fetched.port, 6100);
        assert_eq!(fetched.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_reads_before_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PersistentBackend::open(dir.path().join("empty.redb")).unwrap();
        assert!(backend.get_service("nobody").await.unwrap().is_none());
        assert!(backend.list_services(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_expired_removes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PersistentBackend::open(dir.path().join("reap.redb")).unwrap();
        backend.initialize().await.unwrap();

        let mut stale = record("stale-cs");
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        let live = record("live-cs");
        backend.register(stale.clone()).await.unwrap();
        backend.register(live.clone()).await.unwrap();

        let reaped = backend.clean_expired_services().await.unwrap();
        assert_eq!(reaped, vec![stale.id.clone()]);
        assert!(backend.get_service(&stale.id).await.unwrap().is_none());
        assert!(backend.get_service(&live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_renew_and_deregister() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PersistentBackend::open(dir.path().join("renew.redb")).unwrap();
        backend.initialize().await.unwrap();

        let stored = record("daq-cs");
        backend.register(stored.clone()).await.unwrap();

        assert!(backend.renew(&stored.id).await.unwrap());
        assert!(!backend.renew("unknown").await.unwrap());

        assert!(backend.deregister(&stored.id).await.unwrap());
        assert!(!backend.deregister(&stored.id).await.unwrap());
        assert!(backend.get_service(&stored.id).await.unwrap().is_none());
    }
}
