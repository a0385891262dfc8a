//! Publish side and subscribe side of the registry's event channel.
//!
//! Events are multipart `[topic, payload]` frames where the topic is the
//! event type string, so subscribers can use ZMQ prefix filtering to
//! receive only `register`, `deregister` or `expire` notifications.
//! Delivery is fire-and-forget: the server never waits for subscribers.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tmq::{publish, subscribe, Multipart};

use crate::error::{RegistryError, Result};
use crate::protocol::RegistryEvent;
use crate::transport::TransportConfig;

/// Bound PUB socket the server pushes lifecycle events through.
pub struct EventPublisher {
    socket: tmq::publish::Publish,
}

impl EventPublisher {
    /// Bind the publish channel. The context must be shared with any
    /// inproc subscriber.
    pub fn bind(context: &Arc<zmq::Context>, transport: &TransportConfig) -> Result<Self> {
        let endpoint = transport.bind_endpoint();
        let socket = publish(context)
            .bind(&endpoint)
            .map_err(|e| RegistryError::Other(format!("bind publisher to {endpoint}: {e}")))?;
        Ok(Self { socket })
    }

    /// Send one event, topic-prefixed with its type.
    pub async fn publish(&mut self, event: &RegistryEvent) -> Result<()> {
        let multipart = Multipart::from(vec![
            event.event_type.clone().into_bytes(),
            event.encode(),
        ]);
        self.socket
            .send(multipart)
            .await
            .map_err(|e| RegistryError::Other(format!("publish {}: {e}", event.event_type)))?;
        Ok(())
    }
}

/// SUB socket for watching registry lifecycle events.
///
/// ZMQ SUB sockets deliver nothing until subscribed; `connect` takes the
/// initial topic filter up front so the socket is never in that silent
/// state.
pub struct EventSubscriber {
    socket: tmq::subscribe::Subscribe,
}

impl EventSubscriber {
    /// Connect and subscribe to a topic prefix. An empty prefix receives
    /// every event.
    pub fn connect(
        context: &Arc<zmq::Context>,
        transport: &TransportConfig,
        topic_prefix: &str,
    ) -> Result<Self> {
        let endpoint = transport.connect_endpoint();
        let socket = subscribe(context)
            .connect(&endpoint)
            .map_err(|e| RegistryError::Other(format!("connect subscriber to {endpoint}: {e}")))?
            .subscribe(topic_prefix.as_bytes())
            .map_err(|e| RegistryError::Other(format!("subscribe '{topic_prefix}': {e}")))?;
        Ok(Self { socket })
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<(String, RegistryEvent)> {
        match self.socket.next().await {
            Some(Ok(multipart)) => {
                let parts: Vec<_> = multipart.into_iter().collect();
                if parts.len() < 2 {
                    return Err(RegistryError::Other(format!(
                        "event frame count {}, expected 2",
                        parts.len()
                    )));
                }
                let topic = String::from_utf8(parts[0].to_vec())
                    .map_err(|e| RegistryError::Other(format!("non-utf8 topic: {e}")))?;
                let event = RegistryEvent::decode(&parts[1])?;
                Ok((topic, event))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(RegistryError::Other("event stream ended".to_owned())),
        }
    }

    /// Wait for the next event, giving up after `timeout`.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(String, RegistryEvent)>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}
