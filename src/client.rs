//! Registry clients: the request/reply counterpart to the server.
//!
//! Two variants share the wire protocol. [`RegistryClient`] is async and
//! lives on the tokio runtime; [`SyncRegistryClient`] is a plain blocking
//! client for processes without a runtime (CLI, tests, device control
//! scripts). Both keep one persistent REQ socket, serialize concurrent
//! callers, and recover from a lost reply by recreating the socket.

use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tmq::request_reply::RequestSender;
use tmq::Multipart;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::protocol::{Reply, Request};
use crate::record::{ServiceInfo, ServiceRecord};
use crate::settings::ClientSettings;
use crate::transport::TransportConfig;

/// Recommended heartbeat period for a given lease, ttl/3 with a 1s floor.
pub fn heartbeat_interval_for_ttl(ttl: u64) -> Duration {
    Duration::from_secs((ttl / 3).max(1))
}

struct ClientInner {
    endpoint: String,
    context: Arc<zmq::Context>,
    timeout_ms: u64,
    /// Persistent socket wrapped in a TMQ sender. Taken out for each
    /// call and stored back only on success; a timed-out socket is
    /// dropped so the next call starts clean.
    sender: Mutex<Option<RequestSender>>,
    /// Id obtained at this client's own last registration.
    service_id: SyncMutex<Option<String>>,
    /// Payload and lease of the last registration, so the heartbeat can
    /// re-register after the record expired during an outage.
    last_info: SyncMutex<Option<ServiceInfo>>,
    last_ttl: SyncMutex<Option<u64>>,
    /// Configured heartbeat period; falls back to ttl/3 when unset.
    default_heartbeat_interval: Option<Duration>,
}

impl ClientInner {
    async fn take_or_connect(&self) -> Result<RequestSender> {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.take() {
            return Ok(sender);
        }
        let sender = tmq::request(&self.context)
            .connect(&self.endpoint)
            .map_err(|e| {
                RegistryError::Other(format!("connect to {}: {e}", self.endpoint))
            })?;
        debug!(endpoint = %self.endpoint, "registry client connected");
        Ok(sender)
    }

    async fn store(&self, sender: RequestSender) {
        *self.sender.lock().await = Some(sender);
    }

    /// One request/reply round trip. REQ discipline allows a single
    /// outstanding request, so concurrent callers queue on the sender
    /// mutex inside `take_or_connect`.
    async fn call(&self, request: &Request) -> Result<Reply> {
        let sender = self.take_or_connect().await?;
        let receiver = sender
            .send(Multipart::from(vec![request.encode()]))
            .await
            .map_err(|e| RegistryError::Other(format!("send to {}: {e}", self.endpoint)))?;

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), receiver.recv()).await
        {
            Ok(Ok((multipart, sender))) => {
                self.store(sender).await;
                let raw: Vec<u8> = multipart.into_iter().flat_map(|f| f.to_vec()).collect();
                Reply::decode(&raw)
            }
            Ok(Err(e)) => Err(RegistryError::Other(format!(
                "recv from {}: {e}",
                self.endpoint
            ))),
            Err(_) => Err(RegistryError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout_ms: self.timeout_ms,
            }),
        }
    }
}

struct HeartbeatTask {
    task: tokio::task::JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Async registry client.
///
/// Cloning is cheap and clones share the underlying socket; use separate
/// clients for truly concurrent request streams.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<ClientInner>,
    heartbeat: Arc<Mutex<Option<HeartbeatTask>>>,
}

impl RegistryClient {
    /// Connect to the registry's request channel.
    pub fn new(context: Arc<zmq::Context>, transport: &TransportConfig, timeout_ms: u64) -> Self {
        Self::with_heartbeat_interval(context, transport, timeout_ms, None)
    }

    /// Like [`Self::new`], with a fixed heartbeat period overriding the
    /// ttl-derived default.
    pub fn with_heartbeat_interval(
        context: Arc<zmq::Context>,
        transport: &TransportConfig,
        timeout_ms: u64,
        heartbeat_interval: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint: transport.connect_endpoint(),
                context,
                timeout_ms,
                sender: Mutex::new(None),
                service_id: SyncMutex::new(None),
                last_info: SyncMutex::new(None),
                last_ttl: SyncMutex::new(None),
                default_heartbeat_interval: heartbeat_interval,
            }),
            heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    /// Client for the TCP host/port in `settings`, with its own context.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let transport = TransportConfig::tcp(&settings.host, settings.req_port);
        Self::with_heartbeat_interval(
            Arc::new(zmq::Context::new()),
            &transport,
            settings.timeout_ms,
            settings.heartbeat_interval.map(Duration::from_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Id from this client's own last successful registration.
    pub fn service_id(&self) -> Option<String> {
        self.inner.service_id.lock().clone()
    }

    /// Register under `name` and remember the returned id for
    /// self-deregistration and heartbeating.
    pub async fn register(
        &self,
        name: &str,
        host: &str,
        port: u16,
        service_type: Option<&str>,
        ttl: Option<u64>,
    ) -> Result<String> {
        let mut info = ServiceInfo::new(name, host, port);
        if let Some(service_type) = service_type {
            info = info.with_type(service_type);
        }
        self.register_info(info, ttl).await
    }

    /// Register a prepared [`ServiceInfo`].
    pub async fn register_info(&self, mut info: ServiceInfo, ttl: Option<u64>) -> Result<String> {
        let reply = self
            .inner
            .call(&Request::Register { service_info: info.clone(), ttl })
            .await?;
        let service_id = expect_success(reply)?
            .service_id
            .ok_or_else(|| RegistryError::Server("reply carried no service_id".to_owned()))?;
        // Pin the id so a heartbeat re-registration keeps it stable.
        info.id = Some(service_id.clone());
        *self.inner.service_id.lock() = Some(service_id.clone());
        *self.inner.last_info.lock() = Some(info);
        *self.inner.last_ttl.lock() = ttl.or(Some(crate::settings::DEFAULT_TTL_SECS));
        Ok(service_id)
    }

    /// Deregister `service_id`, defaulting to this client's own
    /// registration.
    pub async fn deregister(&self, service_id: Option<&str>) -> Result<bool> {
        let service_id = match service_id.map(str::to_owned).or_else(|| self.service_id()) {
            Some(id) => id,
            None => return Ok(false),
        };
        let reply = self
            .inner
            .call(&Request::Deregister { service_id: service_id.clone() })
            .await?;
        if reply.success && self.service_id().as_deref() == Some(service_id.as_str()) {
            *self.inner.service_id.lock() = None;
        }
        Ok(reply.success)
    }

    pub async fn renew(&self, service_id: &str) -> Result<bool> {
        let reply = self
            .inner
            .call(&Request::Renew { service_id: service_id.to_owned() })
            .await?;
        Ok(reply.success)
    }

    pub async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        let reply = self
            .inner
            .call(&Request::Get { service_id: service_id.to_owned() })
            .await?;
        Ok(reply.service)
    }

    pub async fn list_services(
        &self,
        service_type: Option<&str>,
    ) -> Result<Vec<ServiceRecord>> {
        let reply = self
            .inner
            .call(&Request::List { service_type: service_type.map(str::to_owned) })
            .await?;
        Ok(expect_success(reply)?.services.unwrap_or_default())
    }

    pub async fn discover_service(&self, service_type: &str) -> Result<Option<ServiceRecord>> {
        let reply = self
            .inner
            .call(&Request::Discover { service_type: service_type.to_owned() })
            .await?;
        Ok(reply.service)
    }

    /// Connection string for one healthy instance of `service_type`.
    pub async fn get_endpoint(&self, service_type: &str) -> Result<Option<String>> {
        Ok(self
            .discover_service(service_type)
            .await?
            .map(|record| record.endpoint()))
    }

    /// Whether the server answers a `health` request in time.
    pub async fn health_check(&self) -> bool {
        matches!(self.inner.call(&Request::Health).await, Ok(reply) if reply.success)
    }

    /// Full server status: ports and the current service list.
    pub async fn server_status(&self) -> Result<Reply> {
        expect_success(self.inner.call(&Request::Info).await?)
    }

    /// Ask the server to shut down.
    pub async fn terminate_registry_server(&self) -> Result<bool> {
        let reply = self.inner.call(&Request::Terminate).await?;
        Ok(reply.success)
    }

    /// Launch the heartbeat task, renewing this client's registration
    /// every `interval` (default: ttl/3 of the last registration).
    ///
    /// A failed renew is logged and the loop keeps going; it will succeed
    /// again once the id is re-registered.
    pub async fn start_heartbeat(&self, interval: Option<Duration>) -> Result<()> {
        let service_id = self
            .service_id()
            .ok_or_else(|| RegistryError::Other("not registered, nothing to heartbeat".into()))?;
        let interval = interval.or(self.inner.default_heartbeat_interval).unwrap_or_else(|| {
            heartbeat_interval_for_ttl(
                (*self.inner.last_ttl.lock()).unwrap_or(crate::settings::DEFAULT_TTL_SECS),
            )
        });

        let mut guard = self.heartbeat.lock().await;
        if guard.is_some() {
            return Err(RegistryError::Other("heartbeat already running".into()));
        }

        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = Arc::clone(&shutdown);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            debug!(service_id = %service_id, interval_secs = interval.as_secs(), "heartbeat started");
            loop {
                tokio::select! {
                    _ = shutdown_clone.notified() => break,
                    _ = tokio::time::sleep(interval) => {
                        match inner.call(&Request::Renew { service_id: service_id.clone() }).await {
                            Ok(reply) if reply.success => {
                                debug!(service_id = %service_id, "heartbeat renewed");
                            }
                            Ok(reply) => {
                                warn!(
                                    service_id = %service_id,
                                    error = reply.error.as_deref().unwrap_or("unknown"),
                                    "heartbeat renew rejected, re-registering"
                                );
                                // The record likely expired during an
                                // outage; re-register under the same id.
                                let info = inner.last_info.lock().clone();
                                if let Some(info) = info {
                                    let ttl = *inner.last_ttl.lock();
                                    match inner
                                        .call(&Request::Register { service_info: info, ttl })
                                        .await
                                    {
                                        Ok(reply) if reply.success => {
                                            info!(service_id = %service_id, "heartbeat re-registered");
                                        }
                                        Ok(reply) => warn!(
                                            service_id = %service_id,
                                            error = reply.error.as_deref().unwrap_or("unknown"),
                                            "heartbeat re-registration rejected"
                                        ),
                                        Err(e) => warn!(
                                            service_id = %service_id,
                                            error = %e,
                                            "heartbeat re-registration failed"
                                        ),
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(service_id = %service_id, error = %e, "heartbeat renew failed");
                            }
                        }
                    }
                }
            }
            debug!("heartbeat stopped");
        });

        *guard = Some(HeartbeatTask { task, shutdown });
        Ok(())
    }

    /// Stop the heartbeat task, if running. Idempotent.
    pub async fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.shutdown.notify_one();
            let _ = heartbeat.task.await;
        }
    }

    /// Scoped teardown: stop the heartbeat and drop the socket.
    pub async fn close(&self) {
        self.stop_heartbeat().await;
        *self.inner.sender.lock().await = None;
        info!(endpoint = %self.inner.endpoint, "registry client closed");
    }
}

fn expect_success(reply: Reply) -> Result<Reply> {
    if reply.success {
        Ok(reply)
    } else {
        Err(RegistryError::Server(
            reply.error.unwrap_or_else(|| "unspecified server error".to_owned()),
        ))
    }
}

struct SyncHeartbeat {
    thread: std::thread::JoinHandle<()>,
    running: Arc<AtomicBool>,
}

/// Blocking registry client for processes without an async runtime.
///
/// The socket runs with `REQ_RELAXED` and `REQ_CORRELATE` so a lost
/// reply does not wedge the state machine; the next send simply starts a
/// new exchange.
pub struct SyncRegistryClient {
    endpoint: String,
    timeout_ms: u64,
    socket: SyncMutex<zmq::Socket>,
    // Kept alive for the heartbeat thread's own socket.
    context: Arc<zmq::Context>,
    service_id: SyncMutex<Option<String>>,
    last_info: SyncMutex<Option<ServiceInfo>>,
    last_ttl: SyncMutex<Option<u64>>,
    /// Configured heartbeat period; falls back to ttl/3 when unset.
    default_heartbeat_interval: Option<Duration>,
    heartbeat: SyncMutex<Option<SyncHeartbeat>>,
}

impl SyncRegistryClient {
    pub fn connect(
        context: Arc<zmq::Context>,
        transport: &TransportConfig,
        timeout_ms: u64,
    ) -> Result<Self> {
        let endpoint = transport.connect_endpoint();
        let socket = Self::create_socket(&context, &endpoint, timeout_ms)?;
        Ok(Self {
            endpoint,
            timeout_ms,
            socket: SyncMutex::new(socket),
            context,
            service_id: SyncMutex::new(None),
            last_info: SyncMutex::new(None),
            last_ttl: SyncMutex::new(None),
            default_heartbeat_interval: None,
            heartbeat: SyncMutex::new(None),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let transport = TransportConfig::tcp(&settings.host, settings.req_port);
        let mut client =
            Self::connect(Arc::new(zmq::Context::new()), &transport, settings.timeout_ms)?;
        client.default_heartbeat_interval = settings.heartbeat_interval.map(Duration::from_secs);
        Ok(client)
    }

    fn create_socket(
        context: &Arc<zmq::Context>,
        endpoint: &str,
        timeout_ms: u64,
    ) -> Result<zmq::Socket> {
        let socket = context.socket(zmq::REQ)?;
        socket.set_req_relaxed(true)?;
        socket.set_req_correlate(true)?;
        socket.set_rcvtimeo(timeout_ms as i32)?;
        socket.set_sndtimeo(timeout_ms as i32)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        Ok(socket)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn service_id(&self) -> Option<String> {
        self.service_id.lock().clone()
    }

    /// One blocking request/reply round trip.
    pub fn call(&self, request: &Request) -> Result<Reply> {
        let socket = self.socket.lock();
        socket.send(request.encode(), 0)?;
        match socket.recv_bytes(0) {
            Ok(raw) => Reply::decode(&raw),
            Err(zmq::Error::EAGAIN) => Err(RegistryError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout_ms: self.timeout_ms,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn register(
        &self,
        name: &str,
        host: &str,
        port: u16,
        service_type: Option<&str>,
        ttl: Option<u64>,
    ) -> Result<String> {
        let mut info = ServiceInfo::new(name, host, port);
        if let Some(service_type) = service_type {
            info = info.with_type(service_type);
        }
        let reply = self.call(&Request::Register { service_info: info.clone(), ttl })?;
        let service_id = expect_success(reply)?
            .service_id
            .ok_or_else(|| RegistryError::Server("reply carried no service_id".to_owned()))?;
        info.id = Some(service_id.clone());
        *self.service_id.lock() = Some(service_id.clone());
        *self.last_info.lock() = Some(info);
        *self.last_ttl.lock() = ttl.or(Some(crate::settings::DEFAULT_TTL_SECS));
        Ok(service_id)
    }

    pub fn deregister(&self, service_id: Option<&str>) -> Result<bool> {
        let service_id = match service_id.map(str::to_owned).or_else(|| self.service_id()) {
            Some(id) => id,
            None => return Ok(false),
        };
        let reply = self.call(&Request::Deregister { service_id: service_id.clone() })?;
        if reply.success && self.service_id().as_deref() == Some(service_id.as_str()) {
            *self.service_id.lock() = None;
        }
        Ok(reply.success)
    }

    pub fn renew(&self, service_id: &str) -> Result<bool> {
        Ok(self.call(&Request::Renew { service_id: service_id.to_owned() })?.success)
    }

    pub fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.call(&Request::Get { service_id: service_id.to_owned() })?.service)
    }

    pub fn list_services(&self, service_type: Option<&str>) -> Result<Vec<ServiceRecord>> {
        let reply = self.call(&Request::List { service_type: service_type.map(str::to_owned) })?;
        Ok(expect_success(reply)?.services.unwrap_or_default())
    }

    pub fn discover_service(&self, service_type: &str) -> Result<Option<ServiceRecord>> {
        Ok(self
            .call(&Request::Discover { service_type: service_type.to_owned() })?
            .service)
    }

    pub fn get_endpoint(&self, service_type: &str) -> Result<Option<String>> {
        Ok(self.discover_service(service_type)?.map(|r| r.endpoint()))
    }

    pub fn health_check(&self) -> bool {
        matches!(self.call(&Request::Health), Ok(reply) if reply.success)
    }

    pub fn server_status(&self) -> Result<Reply> {
        expect_success(self.call(&Request::Info)?)
    }

    pub fn terminate_registry_server(&self) -> Result<bool> {
        Ok(self.call(&Request::Terminate)?.success)
    }

    /// Launch a heartbeat thread renewing this client's registration.
    ///
    /// The thread owns its own socket; the main socket stays free for
    /// foreground calls.
    pub fn start_heartbeat(&self, interval: Option<Duration>) -> Result<()> {
        let service_id = self
            .service_id()
            .ok_or_else(|| RegistryError::Other("not registered, nothing to heartbeat".into()))?;
        let interval = interval.or(self.default_heartbeat_interval).unwrap_or_else(|| {
            heartbeat_interval_for_ttl(
                (*self.last_ttl.lock()).unwrap_or(crate::settings::DEFAULT_TTL_SECS),
            )
        });

        let mut guard = self.heartbeat.lock();
        if guard.is_some() {
            return Err(RegistryError::Other("heartbeat already running".into()));
        }

        let socket = Self::create_socket(&self.context, &self.endpoint, self.timeout_ms)?;
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let endpoint = self.endpoint.clone();
        let timeout_ms = self.timeout_ms;
        let info = self.last_info.lock().clone();
        let ttl = *self.last_ttl.lock();

        let thread = std::thread::Builder::new()
            .name("registry-heartbeat".to_owned())
            .spawn(move || {
                debug!(service_id = %service_id, interval_secs = interval.as_secs(), "heartbeat started");
                // Sleep in short slices so stop() is prompt.
                let slice = Duration::from_millis(100);
                'outer: while running_clone.load(Ordering::Relaxed) {
                    let mut slept = Duration::ZERO;
                    while slept < interval {
                        if !running_clone.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        std::thread::sleep(slice.min(interval - slept));
                        slept += slice;
                    }
                    let result = socket
                        .send(
                            Request::Renew { service_id: service_id.clone() }.encode(),
                            0,
                        )
                        .and_then(|()| socket.recv_bytes(0));
                    match result {
                        Ok(raw) => match Reply::decode(&raw) {
                            Ok(reply) if reply.success => {
                                debug!(service_id = %service_id, "heartbeat renewed");
                            }
                            Ok(reply) => {
                                warn!(
                                    service_id = %service_id,
                                    error = reply.error.as_deref().unwrap_or("unknown"),
                                    "heartbeat renew rejected, re-registering"
                                );
                                if let Some(info) = info.clone() {
                                    let request = Request::Register { service_info: info, ttl };
                                    let result = socket
                                        .send(request.encode(), 0)
                                        .and_then(|()| socket.recv_bytes(0));
                                    match result {
                                        Ok(_) => info!(service_id = %service_id, "heartbeat re-registered"),
                                        Err(e) => warn!(
                                            service_id = %service_id,
                                            error = %e,
                                            "heartbeat re-registration failed"
                                        ),
                                    }
                                }
                            }
                            Err(e) => warn!(service_id = %service_id, error = %e, "heartbeat decode failed"),
                        },
                        Err(zmq::Error::EAGAIN) => warn!(
                            service_id = %service_id,
                            %endpoint,
                            timeout_ms,
                            "heartbeat renew timed out"
                        ),
                        Err(e) => warn!(service_id = %service_id, error = %e, "heartbeat renew failed"),
                    }
                }
                debug!("heartbeat stopped");
            })
            .map_err(|e| RegistryError::Other(format!("spawn heartbeat thread: {e}")))?;

        *guard = Some(SyncHeartbeat { thread, running });
        Ok(())
    }

    /// Stop the heartbeat thread, if running. Idempotent.
    pub fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.running.store(false, Ordering::Relaxed);
            let _ = heartbeat.thread.join();
        }
    }
}

impl Drop for SyncRegistryClient {
    // No leaked threads on any exit path.
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_interval_derivation() {
        assert_eq!(heartbeat_interval_for_ttl(30), Duration::from_secs(10));
        assert_eq!(heartbeat_interval_for_ttl(3), Duration::from_secs(1));
        // Floor at one second for tiny leases.
        assert_eq!(heartbeat_interval_for_ttl(1), Duration::from_secs(1));
        assert_eq!(heartbeat_interval_for_ttl(0), Duration::from_secs(1));
    }

    #[test]
    fn test_settings_heartbeat_interval_reaches_both_clients() {
        let settings = ClientSettings {
            heartbeat_interval: Some(7),
            ..ClientSettings::default()
        };

        let client = RegistryClient::from_settings(&settings);
        assert_eq!(
            client.inner.default_heartbeat_interval,
            Some(Duration::from_secs(7))
        );

        let sync_client = SyncRegistryClient::from_settings(&settings).unwrap();
        assert_eq!(
            sync_client.default_heartbeat_interval,
            Some(Duration::from_secs(7))
        );
    }
}
