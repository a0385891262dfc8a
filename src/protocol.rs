//! Wire protocol for the request/reply and publish channels.
//!
//! Every request is a single JSON frame with an `action` field; every reply
//! is a single JSON frame with a `success` boolean. Decoding is done with
//! explicit field checks so that malformed input produces a precise,
//! client-visible message instead of a serde type error.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{ServiceInfo, ServiceRecord};

/// A decoded registry request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Register { service_info: ServiceInfo, ttl: Option<u64> },
    Deregister { service_id: String },
    Renew { service_id: String },
    Get { service_id: String },
    List { service_type: Option<String> },
    Discover { service_type: String },
    Info,
    Health,
    Terminate,
}

impl Request {
    /// Decode a raw frame, mapping each failure mode to its exact
    /// client-visible message.
    pub fn decode(raw: &[u8]) -> Result<Self, String> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|_| "Invalid JSON format".to_owned())?;
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing required field: action".to_owned())?;

        match action {
            "register" => {
                let info = value
                    .get("service_info")
                    .ok_or_else(|| "Missing required field: service_info".to_owned())?;
                let service_info = decode_service_info(info)?;
                let ttl = value.get("ttl").and_then(Value::as_u64);
                Ok(Self::Register { service_info, ttl })
            }
            "deregister" => Ok(Self::Deregister { service_id: required_str(value, "service_id")? }),
            "renew" => Ok(Self::Renew { service_id: required_str(value, "service_id")? }),
            "get" => Ok(Self::Get { service_id: required_str(value, "service_id")? }),
            "list" => {
                let service_type = value
                    .get("service_type")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                Ok(Self::List { service_type })
            }
            "discover" => {
                Ok(Self::Discover { service_type: required_str(value, "service_type")? })
            }
            "info" => Ok(Self::Info),
            "health" => Ok(Self::Health),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("Unknown action: {other}")),
        }
    }

    /// Encode for the wire. The inverse of [`Request::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Self::Register { service_info, ttl } => {
                let mut body = serde_json::json!({
                    "action": "register",
                    "service_info": service_info,
                });
                if let Some(ttl) = ttl {
                    body["ttl"] = Value::from(*ttl);
                }
                body
            }
            Self::Deregister { service_id } => {
                serde_json::json!({"action": "deregister", "service_id": service_id})
            }
            Self::Renew { service_id } => {
                serde_json::json!({"action": "renew", "service_id": service_id})
            }
            Self::Get { service_id } => {
                serde_json::json!({"action": "get", "service_id": service_id})
            }
            Self::List { service_type } => {
                let mut body = serde_json::json!({"action": "list"});
                if let Some(service_type) = service_type {
                    body["service_type"] = Value::from(service_type.clone());
                }
                body
            }
            Self::Discover { service_type } => {
                serde_json::json!({"action": "discover", "service_type": service_type})
            }
            Self::Info => serde_json::json!({"action": "info"}),
            Self::Health => serde_json::json!({"action": "health"}),
            Self::Terminate => serde_json::json!({"action": "terminate"}),
        };
        // A json! literal of plain fields cannot fail to serialize.
        serde_json::to_vec(&value).unwrap_or_default()
    }
}

fn required_str(value: &Value, field: &str) -> Result<String, String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| format!("Missing required field: {field}"))
}

fn decode_service_info(value: &Value) -> Result<ServiceInfo, String> {
    for field in ["name", "host", "port"] {
        if value.get(field).is_none() {
            return Err(format!("Missing required field in service_info: {field}"));
        }
    }
    serde_json::from_value(value.clone()).map_err(|_| "Invalid JSON format".to_owned())
}

/// A registry reply. Only fields relevant to the answered action are
/// present on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_port: Option<u16>,
}

impl Reply {
    pub fn ok() -> Self {
        Self { success: true, ..Self::default() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Self::default() }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_service(mut self, service: ServiceRecord) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_services(mut self, services: Vec<ServiceRecord>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = Some(Utc::now().to_rfc3339());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| br#"{"success":false}"#.to_vec())
    }

    pub fn decode(raw: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(raw).map_err(crate::RegistryError::InvalidPayload)
    }
}

/// Lifecycle event published on the pub channel after a state change.
///
/// The event type doubles as the subscription topic; the payload JSON
/// repeats it so a subscriber can demultiplex from the body alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    pub data: Value,
    /// Correlates an event with the request that caused it; generated
    /// fresh when the producer did not supply one.
    #[serde(default = "uuid::Uuid::new_v4")]
    pub correlation_id: uuid::Uuid,
}

impl RegistryEvent {
    pub const REGISTER: &'static str = "register";
    pub const DEREGISTER: &'static str = "deregister";
    pub const EXPIRE: &'static str = "expire";

    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now().to_rfc3339(),
            data,
            correlation_id: uuid::Uuid::new_v4(),
        }
    }

    pub fn register(record: &ServiceRecord) -> Self {
        Self::new(
            Self::REGISTER,
            serde_json::json!({"service_id": record.id, "service": record}),
        )
    }

    pub fn deregister(record: &ServiceRecord) -> Self {
        Self::new(
            Self::DEREGISTER,
            serde_json::json!({"service_id": record.id, "service": record}),
        )
    }

    pub fn expire(service_id: &str) -> Self {
        Self::new(Self::EXPIRE, serde_json::json!({"service_id": service_id}))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(raw).map_err(crate::RegistryError::InvalidPayload)
    }
}
