//! Transport endpoint configuration for registry channels.
//!
//! The registry binds two sockets (REQ/REP and PUB); clients connect to
//! them. `TransportConfig` names an endpoint independently of socket type
//! so the same configuration works for servers (bind) and clients
//! (connect). TCP is the production transport; `inproc://` endpoints are
//! used by in-process deployments and tests, where server and clients
//! must share one `zmq::Context`.

use serde::{Deserialize, Serialize};

/// ZMQ endpoint configuration.
///
/// # Examples
///
/// ```
/// use svcreg_core::transport::TransportConfig;
///
/// let tcp = TransportConfig::tcp("localhost", 4242);
/// assert_eq!(tcp.connect_endpoint(), "tcp://localhost:4242");
/// assert_eq!(tcp.bind_endpoint(), "tcp://*:4242");
///
/// let inproc = TransportConfig::inproc("svcreg/requests");
/// assert_eq!(inproc.connect_endpoint(), "inproc://svcreg/requests");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportConfig {
    /// TCP endpoint. Servers bind all interfaces on `port`; clients
    /// connect to `host:port`.
    Tcp { host: String, port: u16 },

    /// In-process endpoint (zero-copy, same process and context).
    Inproc { endpoint: String },
}

impl TransportConfig {
    /// Create a TCP endpoint configuration.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Create an in-process endpoint configuration.
    pub fn inproc(endpoint: impl Into<String>) -> Self {
        Self::Inproc {
            endpoint: endpoint.into(),
        }
    }

    /// Endpoint string used by clients (connect side).
    pub fn connect_endpoint(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
            Self::Inproc { endpoint } => format!("inproc://{endpoint}"),
        }
    }

    /// Endpoint string used by the server (bind side).
    ///
    /// For TCP this binds every interface; the advertised host is a
    /// client-side concern.
    pub fn bind_endpoint(&self) -> String {
        match self {
            Self::Tcp { port, .. } => format!("tcp://*:{port}"),
            Self::Inproc { endpoint } => format!("inproc://{endpoint}"),
        }
    }

    /// The TCP port, if this is a TCP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(*port),
            Self::Inproc { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_endpoint() {
        let config = TransportConfig::tcp("192.168.1.7", 4242);
        assert_eq!(config.connect_endpoint(), "tcp://192.168.1.7:4242");
        assert_eq!(config.bind_endpoint(), "tcp://*:4242");
        assert_eq!(config.port(), Some(4242));
    }

    #[test]
    fn test_inproc_endpoint() {
        let config = TransportConfig::inproc("svcreg/events");
        assert_eq!(config.connect_endpoint(), "inproc://svcreg/events");
        assert_eq!(config.bind_endpoint(), "inproc://svcreg/events");
        assert_eq!(config.port(), None);
    }
}
