//! svcreg binary: run and manage the service registry.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use svcreg_core::backend::{MemoryBackend, PersistentBackend, RegistryBackend};
use svcreg_core::client::SyncRegistryClient;
use svcreg_core::server::RegistryServer;
use svcreg_core::settings::{RegistrySettings, StorageSettings};
use svcreg_core::transport::TransportConfig;

const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "svcreg", author, version, about = "ZeroMQ service registry")]
struct Cli {
    /// Path to a config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "svcreg_core=debug"
    #[arg(long, global = true, env = "SVCREG_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry server in the foreground
    Start(StartArgs),
    /// Query a running registry server
    Status(ConnectArgs),
    /// Ask a running registry server to shut down
    Stop(ConnectArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Port for the request/reply channel
    #[arg(long)]
    req_port: Option<u16>,

    /// Port for the publish channel
    #[arg(long)]
    pub_port: Option<u16>,

    /// Path to the embedded database; omit for in-memory storage
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Seconds between expiry sweeps
    #[arg(long)]
    cleanup_interval: Option<u64>,
}

#[derive(Args)]
struct ConnectArgs {
    /// Registry server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Request/reply port of the server
    #[arg(long)]
    port: Option<u16>,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .parse_lossy(cli.log.as_deref().unwrap_or("svcreg_core=info,svcreg=info")),
        )
        .with_target(true)
        .init();

    let mut settings = RegistrySettings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start(args) => {
            if let Some(port) = args.req_port {
                settings.server.req_port = port;
            }
            if let Some(port) = args.pub_port {
                settings.server.pub_port = port;
            }
            if let Some(interval) = args.cleanup_interval {
                settings.server.cleanup_interval = interval;
            }
            if let Some(db_path) = args.db_path {
                settings.server.storage = StorageSettings::Persistent { db_path };
            }
            start(settings).await
        }
        Commands::Status(args) => status(&settings, &args),
        Commands::Stop(args) => stop(&settings, &args),
    }
}

async fn start(settings: RegistrySettings) -> anyhow::Result<()> {
    let backend: Arc<dyn RegistryBackend> = match &settings.server.storage {
        StorageSettings::Memory => Arc::new(MemoryBackend::new()),
        StorageSettings::Persistent { db_path } => {
            info!(db_path = %db_path.display(), "opening persistent backend");
            Arc::new(PersistentBackend::open(db_path)?)
        }
    };

    info!(
        req_port = settings.server.req_port,
        pub_port = settings.server.pub_port,
        cleanup_interval = settings.server.cleanup_interval,
        "starting registry server"
    );
    let server = RegistryServer::bind_tcp(backend, settings.server);
    let mut handle = server.start().await?;

    // Run until ctrl-c or a terminate request stops the loops.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = handle.wait() => {}
    }
    handle.stop().await;
    Ok(())
}

fn connect(settings: &RegistrySettings, args: &ConnectArgs) -> anyhow::Result<SyncRegistryClient> {
    let port = args.port.unwrap_or(settings.server.req_port);
    let transport = TransportConfig::tcp(&args.host, port);
    Ok(SyncRegistryClient::connect(
        Arc::new(zmq::Context::new()),
        &transport,
        args.timeout,
    )?)
}

fn status(settings: &RegistrySettings, args: &ConnectArgs) -> anyhow::Result<()> {
    let client = connect(settings, args)?;
    match client.server_status() {
        Ok(reply) => {
            println!("Registry server: {}", reply.status.as_deref().unwrap_or("ok"));
            if let (Some(req), Some(publ)) = (reply.req_port, reply.pub_port) {
                println!("  req port: {req}");
                println!("  pub port: {publ}");
            }
            let services = reply.services.unwrap_or_default();
            println!("  services: {}", services.len());
            for service in services {
                println!(
                    "    {}  {}  {}  [{}]",
                    service.id,
                    service.endpoint(),
                    service.health,
                    service.tags.join(", ")
                );
            }
            Ok(())
        }
        Err(svcreg_core::RegistryError::Server(message)) => {
            eprintln!("{RED}Registry server is active but returned an error: {message}{RESET}");
            Ok(())
        }
        Err(e) => {
            eprintln!("{RED}Registry server is not active at {}: {e}{RESET}", client.endpoint());
            Ok(())
        }
    }
}

fn stop(settings: &RegistrySettings, args: &ConnectArgs) -> anyhow::Result<()> {
    let client = connect(settings, args)?;
    match client.terminate_registry_server() {
        Ok(true) => {
            println!("Registry server is terminating");
            Ok(())
        }
        Ok(false) => {
            eprintln!("{RED}Registry server refused to terminate{RESET}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{RED}Registry server is not active at {}: {e}{RESET}", client.endpoint());
            std::process::exit(1);
        }
    }
}
