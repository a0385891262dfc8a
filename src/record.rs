//! Service records: the registry's unit of state.
//!
//! A `ServiceRecord` carries one instance's identity, network location and
//! lease. Health is derived from the lease at read time, never stored:
//! a record with `expires_at <= now` is expired regardless of what any
//! storage layer still holds.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Derived liveness of a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Expired,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Registration payload sent by a service instance.
///
/// The server fills `id` with `"{name}-{uuid}"` when the caller does not
/// supply one, and mirrors `service_type` into `tags` for discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            name: name.into(),
            host: host.into(),
            port,
            service_type: None,
            metadata: HashMap::new(),
            tags: Vec::new(),
        }
    }

    /// Set the service type and mirror it into the tags.
    pub fn with_type(mut self, service_type: impl Into<String>) -> Self {
        let service_type = service_type.into();
        if !self.tags.contains(&service_type) {
            self.tags.push(service_type.clone());
        }
        self.service_type = Some(service_type);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The instance id, generating `"{name}-{uuid}"` when absent.
    pub fn ensure_id(&mut self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let id = format!("{}-{}", self.name, Uuid::new_v4());
                self.id = Some(id.clone());
                id
            }
        }
    }
}

/// One registered service instance with its lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Lease duration in seconds, as granted at the last register/renew.
    pub ttl: u64,
    /// End of the current lease.
    pub expires_at: DateTime<Utc>,
    /// Derived at read time; `Healthy` while `now < expires_at`.
    pub health: HealthStatus,
}

impl ServiceRecord {
    /// Build a record from a registration payload, starting a fresh lease.
    ///
    /// The payload must already carry an id (see [`ServiceInfo::ensure_id`]).
    pub fn from_info(info: ServiceInfo, ttl: u64, now: DateTime<Utc>) -> Self {
        let id = info.id.unwrap_or_default();
        Self {
            id,
            name: info.name,
            host: info.host,
            port: info.port,
            service_type: info.service_type,
            metadata: info.metadata,
            tags: info.tags,
            ttl,
            expires_at: now + ChronoDuration::seconds(ttl as i64),
            health: HealthStatus::Healthy,
        }
    }

    /// Whether the lease has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Recompute the derived health field for `now`.
    pub fn refreshed(mut self, now: DateTime<Utc>) -> Self {
        self.health = if self.is_expired(now) {
            HealthStatus::Expired
        } else {
            HealthStatus::Healthy
        };
        self
    }

    /// Extend the lease by the record's own ttl, starting from `now`.
    pub fn renew(&mut self, now: DateTime<Utc>) {
        self.expires_at = now + ChronoDuration::seconds(self.ttl as i64);
        self.health = HealthStatus::Healthy;
    }

    /// Whether this record serves the given type, by field or by tag.
    pub fn matches_type(&self, service_type: &str) -> bool {
        self.service_type.as_deref() == Some(service_type)
            || self.tags.iter().any(|t| t == service_type)
    }

    /// Primary connection string for this instance.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ServiceInfo {
        ServiceInfo::new("hexapod-cs", "127.0.0.1", 6700).with_type("hexapod")
    }

    #[test]
    fn test_ensure_id_generates_name_uuid() {
        let mut info = info();
        let id = info.ensure_id();
        assert!(id.starts_with("hexapod-cs-"));
        // Idempotent: a second call returns the same id.
        assert_eq!(info.ensure_id(), id);
    }

    #[test]
    fn test_type_mirrored_into_tags() {
        let info = info();
        assert_eq!(info.service_type.as_deref(), Some("hexapod"));
        assert_eq!(info.tags, vec!["hexapod".to_owned()]);
    }

    #[test]
    fn test_lease_lifecycle() {
        let now = Utc::now();
        let mut info = info();
        info.ensure_id();
        let mut record = ServiceRecord::from_info(info, 30, now);

        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + ChronoDuration::seconds(30)));

        // Renewal pushes the lease out from the renewal instant.
        let later = now + ChronoDuration::seconds(25);
        record.renew(later);
        assert!(!record.is_expired(now + ChronoDuration::seconds(40)));
        assert!(record.is_expired(later + ChronoDuration::seconds(30)));
    }

    #[test]
    fn test_refreshed_health() {
        let now = Utc::now();
        let mut info = info();
        info.ensure_id();
        let record = ServiceRecord::from_info(info, 1, now);

        assert_eq!(record.clone().refreshed(now).health, HealthStatus::Healthy);
        let after = now + ChronoDuration::seconds(2);
        assert_eq!(record.refreshed(after).health, HealthStatus::Expired);
    }

    #[test]
    fn test_matches_type_by_tag() {
        let mut record = ServiceRecord::from_info(info(), 30, Utc::now());
        record.service_type = None;
        assert!(record.matches_type("hexapod"));
        assert!(!record.matches_type("daq"));
    }

    #[test]
    fn test_endpoint() {
        let record = ServiceRecord::from_info(info(), 30, Utc::now());
        assert_eq!(record.endpoint(), "tcp://127.0.0.1:6700");
    }
}
