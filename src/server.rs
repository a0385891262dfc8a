//! Registry server: request loop, cleanup loop, event publication.
//!
//! The server binds two channels. The REP channel answers registry
//! actions one request at a time; the PUB channel broadcasts lifecycle
//! events. Both loops run as independent tokio tasks and stop
//! cooperatively when the handle (or a `terminate` request) signals
//! shutdown.

use std::sync::Arc;
use std::time::Duration;
use tmq::Multipart;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::backend::RegistryBackend;
use crate::error::{RegistryError, Result};
use crate::events::EventPublisher;
use crate::protocol::{RegistryEvent, Reply, Request};
use crate::record::ServiceRecord;
use crate::settings::ServerSettings;
use crate::transport::TransportConfig;

/// Shutdown fan-out for the server's two loops.
///
/// Each loop gets its own `Notify` so a single trigger cannot be consumed
/// by one loop and missed by the other.
#[derive(Clone)]
struct ShutdownSignal {
    request_loop: Arc<Notify>,
    cleanup_loop: Arc<Notify>,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self {
            request_loop: Arc::new(Notify::new()),
            cleanup_loop: Arc::new(Notify::new()),
        }
    }

    fn trigger(&self) {
        self.request_loop.notify_one();
        self.cleanup_loop.notify_one();
    }
}

/// A running registry server.
///
/// Dropping the handle detaches the tasks; call [`ServerHandle::stop`]
/// for an orderly shutdown.
pub struct ServerHandle {
    request_task: Option<tokio::task::JoinHandle<()>>,
    cleanup_task: Option<tokio::task::JoinHandle<()>>,
    shutdown: ShutdownSignal,
    backend: Arc<dyn RegistryBackend>,
}

impl ServerHandle {
    /// Stop both loops, wait for them to finish and close the backend.
    /// Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(task) = self.request_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.cleanup_task.take() {
            let _ = task.await;
        }
        if let Err(e) = self.backend.close().await {
            warn!(error = %e, "backend close failed");
        }
    }

    /// Whether the request loop is still running.
    pub fn is_running(&self) -> bool {
        self.request_task
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the server to exit on its own (e.g. via `terminate`).
    pub async fn wait(&mut self) {
        if let Some(task) = self.request_task.take() {
            let _ = task.await;
        }
        // The request loop triggers shutdown on terminate; make sure the
        // cleanup loop is told even if it exited another way.
        self.shutdown.cleanup_loop.notify_one();
        if let Some(task) = self.cleanup_task.take() {
            let _ = task.await;
        }
        if let Err(e) = self.backend.close().await {
            warn!(error = %e, "backend close failed");
        }
    }
}

/// The registry server. Owns one backend and both channel bindings.
pub struct RegistryServer {
    context: Arc<zmq::Context>,
    req_transport: TransportConfig,
    pub_transport: TransportConfig,
    backend: Arc<dyn RegistryBackend>,
    settings: ServerSettings,
}

impl RegistryServer {
    pub fn new(
        context: Arc<zmq::Context>,
        req_transport: TransportConfig,
        pub_transport: TransportConfig,
        backend: Arc<dyn RegistryBackend>,
        settings: ServerSettings,
    ) -> Self {
        Self { context, req_transport, pub_transport, backend, settings }
    }

    /// Bind on the configured TCP ports with the given backend.
    pub fn bind_tcp(backend: Arc<dyn RegistryBackend>, settings: ServerSettings) -> Self {
        let req = TransportConfig::tcp("*", settings.req_port);
        let publ = TransportConfig::tcp("*", settings.pub_port);
        Self::new(Arc::new(zmq::Context::new()), req, publ, backend, settings)
    }

    pub fn context(&self) -> &Arc<zmq::Context> {
        &self.context
    }

    /// Initialize the backend, bind both channels and launch the loops.
    ///
    /// Returns once the REP socket is bound, so a caller can connect
    /// immediately after.
    pub async fn start(self) -> Result<ServerHandle> {
        self.backend.initialize().await?;

        let publisher = EventPublisher::bind(&self.context, &self.pub_transport)?;
        let publisher = Arc::new(Mutex::new(publisher));

        let shutdown = ShutdownSignal::new();
        let service = Arc::new(RegistryService {
            backend: Arc::clone(&self.backend),
            publisher: Arc::clone(&publisher),
            req_port: self.req_transport.port(),
            pub_port: self.pub_transport.port(),
            default_ttl: self.settings.default_ttl,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let request_task = tokio::spawn(request_loop(
            Arc::clone(&self.context),
            self.req_transport.clone(),
            Arc::clone(&service),
            shutdown.clone(),
            ready_tx,
        ));

        // Wait for the REP socket to bind, surfacing any bind error.
        ready_rx
            .await
            .map_err(|_| RegistryError::Other("request loop exited before binding".to_owned()))??;

        let cleanup_task = tokio::spawn(cleanup_loop(
            Arc::clone(&self.backend),
            publisher,
            Duration::from_secs(self.settings.cleanup_interval),
            Arc::clone(&shutdown.cleanup_loop),
        ));

        Ok(ServerHandle {
            request_task: Some(request_task),
            cleanup_task: Some(cleanup_task),
            shutdown,
            backend: self.backend,
        })
    }
}

/// Per-request dispatch: backend calls plus event publication.
struct RegistryService {
    backend: Arc<dyn RegistryBackend>,
    publisher: Arc<Mutex<EventPublisher>>,
    req_port: Option<u16>,
    pub_port: Option<u16>,
    default_ttl: u64,
}

impl RegistryService {
    /// Handle one decoded request. The boolean asks the request loop to
    /// shut the server down after the reply is sent.
    async fn handle(&self, request: Request) -> (Reply, bool) {
        match request {
            Request::Register { service_info, ttl } => {
                (self.register(service_info, ttl).await, false)
            }
            Request::Deregister { service_id } => (self.deregister(&service_id).await, false),
            Request::Renew { service_id } => (self.renew(&service_id).await, false),
            Request::Get { service_id } => (self.get(&service_id).await, false),
            Request::List { service_type } => (self.list(service_type.as_deref()).await, false),
            Request::Discover { service_type } => (self.discover(&service_type).await, false),
            Request::Info => (self.info().await, false),
            Request::Health => (Reply::ok().with_status("ok").with_timestamp(), false),
            Request::Terminate => (
                Reply::ok().with_status("terminating").with_timestamp(),
                true,
            ),
        }
    }

    async fn register(&self, mut info: crate::record::ServiceInfo, ttl: Option<u64>) -> Reply {
        let service_id = info.ensure_id();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let record = ServiceRecord::from_info(info, ttl, chrono::Utc::now());
        match self.backend.register(record.clone()).await {
            Ok(()) => {
                self.publish(RegistryEvent::register(&record)).await;
                info!(service_id = %service_id, name = %record.name, ttl, "service registered");
                Reply::ok()
                    .with_service_id(service_id.clone())
                    .with_message(format!("Service {service_id} registered"))
            }
            Err(e) => {
                error!(service_id = %service_id, error = %e, "register failed");
                Reply::failure(e.to_string())
            }
        }
    }

    async fn deregister(&self, service_id: &str) -> Reply {
        // Fetch first so the event can carry the record being removed.
        let old = match self.backend.get_service(service_id).await {
            Ok(old) => old,
            Err(e) => return Reply::failure(e.to_string()),
        };
        match self.backend.deregister(service_id).await {
            Ok(true) => {
                if let Some(record) = old {
                    self.publish(RegistryEvent::deregister(&record)).await;
                }
                info!(service_id, "service deregistered");
                Reply::ok().with_message(format!("Service {service_id} deregistered"))
            }
            Ok(false) => Reply::failure(format!("Service not found: {service_id}")),
            Err(e) => {
                error!(service_id, error = %e, "deregister failed");
                Reply::failure(e.to_string())
            }
        }
    }

    async fn renew(&self, service_id: &str) -> Reply {
        match self.backend.renew(service_id).await {
            Ok(true) => {
                debug!(service_id, "lease renewed");
                Reply::ok().with_message(format!("Service {service_id} renewed"))
            }
            Ok(false) => Reply::failure(format!("Service not found: {service_id}")),
            Err(e) => Reply::failure(e.to_string()),
        }
    }

    async fn get(&self, service_id: &str) -> Reply {
        match self.backend.get_service(service_id).await {
            Ok(Some(record)) => Reply::ok().with_service(record),
            Ok(None) => Reply::failure(format!("Service not found: {service_id}")),
            Err(e) => Reply::failure(e.to_string()),
        }
    }

    async fn list(&self, service_type: Option<&str>) -> Reply {
        match self.backend.list_services(service_type).await {
            Ok(records) => Reply::ok().with_services(records),
            Err(e) => Reply::failure(e.to_string()),
        }
    }

    async fn discover(&self, service_type: &str) -> Reply {
        match self.backend.discover_service(service_type).await {
            Ok(Some(record)) => Reply::ok().with_service(record),
            Ok(None) => Reply::failure(format!("No service of type {service_type} found")),
            Err(e) => Reply::failure(e.to_string()),
        }
    }

    async fn info(&self) -> Reply {
        match self.backend.list_services(None).await {
            Ok(records) => {
                let mut reply = Reply::ok().with_status("ok").with_services(records);
                reply.req_port = self.req_port;
                reply.pub_port = self.pub_port;
                reply
            }
            Err(e) => Reply::failure(e.to_string()),
        }
    }

    /// Best-effort event delivery. The backend change already committed,
    /// so a publish failure is logged and swallowed.
    async fn publish(&self, event: RegistryEvent) {
        let mut publisher = self.publisher.lock().await;
        if let Err(e) = publisher.publish(&event).await {
            warn!(event_type = %event.event_type, error = %e, "event publish failed");
        }
    }
}

async fn request_loop(
    context: Arc<zmq::Context>,
    transport: TransportConfig,
    service: Arc<RegistryService>,
    shutdown: ShutdownSignal,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let endpoint = transport.bind_endpoint();
    let mut receiver = match tmq::reply(&context).bind(&endpoint) {
        Ok(receiver) => {
            let _ = ready_tx.send(Ok(()));
            receiver
        }
        Err(e) => {
            let _ = ready_tx.send(Err(RegistryError::Other(format!(
                "bind request channel to {endpoint}: {e}"
            ))));
            return;
        }
    };

    info!(%endpoint, "registry request channel bound");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.request_loop.notified() => {
                debug!("request loop received shutdown signal");
                break;
            }

            result = receiver.recv() => {
                let (multipart, sender) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "request channel recv error");
                        break;
                    }
                };
                let raw: Vec<u8> = multipart
                    .into_iter()
                    .flat_map(|frame| frame.to_vec())
                    .collect();

                // A failed request must never take the loop down.
                let (reply, terminate) = match Request::decode(&raw) {
                    Ok(request) => service.handle(request).await,
                    Err(message) => {
                        warn!(%message, "rejecting malformed request");
                        (Reply::failure(message), false)
                    }
                };

                let msg: Multipart = vec![reply.encode()].into();
                receiver = match sender.send(msg).await {
                    Ok(receiver) => receiver,
                    Err(e) => {
                        error!(error = %e, "request channel send error");
                        break;
                    }
                };

                if terminate {
                    info!("terminate requested, shutting down");
                    shutdown.trigger();
                    break;
                }
            }
        }
    }

    info!("registry request loop stopped");
}

async fn cleanup_loop(
    backend: Arc<dyn RegistryBackend>,
    publisher: Arc<Mutex<EventPublisher>>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    debug!(interval_secs = interval.as_secs(), "cleanup loop started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                debug!("cleanup loop received shutdown signal");
                break;
            }

            _ = tokio::time::sleep(interval) => {
                match backend.clean_expired_services().await {
                    Ok(expired) => {
                        for service_id in expired {
                            info!(service_id = %service_id, "service lease expired");
                            let event = RegistryEvent::expire(&service_id);
                            let mut publisher = publisher.lock().await;
                            if let Err(e) = publisher.publish(&event).await {
                                warn!(service_id = %service_id, error = %e, "expire event publish failed");
                            }
                        }
                    }
                    // One failed sweep must not stop the reaper.
                    Err(e) => error!(error = %e, "cleanup pass failed"),
                }
            }
        }
    }
    debug!("cleanup loop stopped");
}
