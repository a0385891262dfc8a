//! In-process backend; the default for tests and single-host setups.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RegistryBackend, SelectionPolicy};
use crate::error::Result;
use crate::record::ServiceRecord;

/// Map-backed storage. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    services: RwLock<HashMap<String, ServiceRecord>>,
    policy: SelectionPolicy,
    round_robin: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: SelectionPolicy) -> Self {
        Self { policy, ..Self::default() }
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn register(&self, record: ServiceRecord) -> Result<()> {
        self.services.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn renew(&self, service_id: &str) -> Result<bool> {
        let mut services = self.services.write();
        match services.get_mut(service_id) {
            Some(record) => {
                record.renew(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister(&self, service_id: &str) -> Result<bool> {
        Ok(self.services.write().remove(service_id).is_some())
    }

    async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        let now = Utc::now();
        Ok(self
            .services
            .read()
            .get(service_id)
            .cloned()
            .map(|record| record.refreshed(now)))
    }

    async fn list_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceRecord>> {
        let now = Utc::now();
        let services = self.services.read();
        let mut records: Vec<_> = services
            .values()
            .filter(|record| !record.is_expired(now))
            .filter(|record| service_type.map_or(true, |t| record.matches_type(t)))
            .cloned()
            .map(|record| record.refreshed(now))
            .collect();
        // Stable order keeps list output and round-robin deterministic.
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
            SelectionPolicy::Random => {
                candidates.choose(&mut rand::thread_rng()).cloned()
            }
            SelectionPolicy::RoundRobin => {
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.into_iter().nth(index)
            }
        };
        Ok(chosen)
    }

    async fn clean_expired_services(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut services = self.services.write();
        let expired: Vec<String> = services
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            services.remove(id);
        }
        Ok(expired)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HealthStatus, ServiceInfo};
    use chrono::Duration as ChronoDuration;

    fn record(name: &str, ttl: u64) -> ServiceRecord {
        let mut info = ServiceInfo::new(name, "127.0.0.1", 6000).with_type("daq");
        info.ensure_id();
        ServiceRecord::from_info(info, ttl, Utc::now())
    }

    #[tokio::test]
    async fn test_register_overwrites_same_id() {
        let backend = MemoryBackend::new();
        let mut first = record("daq-cs", 30);
        first.id = "daq-cs-fixed".to_owned();
        backend.register(first.clone()).await.unwrap();

        let mut second = first.clone();
        second.port = 7000;
        backend.register(second).await.unwrap();

        let fetched = backend.get_service("daq-cs-fixed").await.unwrap().unwrap();
        assert_eq!(fetched.port, 7000);
        assert_eq!(backend.list_services(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_record_hidden_from_reads() {
        let backend = MemoryBackend::new();
        let mut stale = record("daq-cs", 30);
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        backend.register(stale.clone()).await.unwrap();

        assert!(backend.list_services(None).await.unwrap().is_empty());
        assert!(backend.discover_service("daq").await.unwrap().is_none());
        // get still returns it, flagged expired, until the reaper runs.
        let fetched = backend.get_service(&stale.id).await.unwrap().unwrap();
        assert_eq!(fetched.health, HealthStatus::Expired);
    }

    #[tokio::test]
    async fn test_renew_resurrects_lapsed_record() {
        let backend = MemoryBackend::new();
        let mut stale = record("daq-cs", 30);
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        backend.register(stale.clone()).await.unwrap();

        assert!(backend.renew(&stale.id).await.unwrap());
        let fetched = backend.get_service(&stale.id).await.unwrap().unwrap();
        assert_eq!(fetched.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_renew_unknown_id() {
        let backend = MemoryBackend::new();
        assert!(!backend.renew("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_expired_reports_each_id_once() {
        let backend = MemoryBackend::new();
        let mut stale = record("daq-cs", 30);
        stale.expires_at = Utc::now() - ChronoDuration::seconds(1);
        let live = record("hexapod-cs", 30);
        backend.register(stale.clone()).await.unwrap();
        backend.register(live.clone()).await.unwrap();

        let reaped = backend.clean_expired_services().await.unwrap();
        assert_eq!(reaped, vec![stale.id.clone()]);
        // Second pass finds nothing; the id was removed, not flagged.
        assert!(backend.clean_expired_services().await.unwrap().is_empty());
        assert!(backend.get_service(&stale.id).await.unwrap().is_none());
        assert!(backend.get_service(&live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let backend = MemoryBackend::with_policy(SelectionPolicy::RoundRobin);
        for port in [6001u16, 6002] {
            let mut info = ServiceInfo::new(format!("daq-{port}"), "127.0.0.1", port)
                .with_type("daq");
            info.ensure_id();
            backend
                .register(ServiceRecord::from_info(info, 30, Utc::now()))
                .await
                .unwrap();
        }
        let first = backend.discover_service("daq").await.unwrap().unwrap();
        let second = backend.discover_service("daq").await.unwrap().unwrap();
        let third = backend.discover_service("daq").await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.id, third.id);
    }

    #[tokio::test]
    async fn test_list_filters_by_type() {
        let backend = MemoryBackend::new();
        backend.register(record("daq-cs", 30)).await.unwrap();
        let mut other = ServiceInfo::new("hexapod-cs", "127.0.0.1", 6010).with_type("hexapod");
        other.ensure_id();
        backend
            .register(ServiceRecord::from_info(other, 30, Utc::now()))
            .await
            .unwrap();

        assert_eq!(backend.list_services(None).await.unwrap().len(), 2);
        let daq = backend.list_services(Some("daq")).await.unwrap();
        assert_eq!(daq.len(), 1);
        assert_eq!(daq[0].name, "daq-cs");
    }
}
