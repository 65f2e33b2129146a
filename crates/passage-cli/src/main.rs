//! Passage CLI - expose local servers through a relay

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use passage_api::{ApiServer, ApiServerConfig};
use passage_client::{LocalTls, SessionOptions, TunnelEvent, TunnelSession};
use passage_proxy::{ProxyConfig, ProxyServer};
use passage_registry::{CreationBus, MemoryRegistry};

/// Expose local servers to the internet through a relay
#[derive(Parser, Debug)]
#[command(name = "passage")]
#[command(about = "Expose local servers through a tunnel relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel for a local port
    Http {
        /// Local port to expose
        #[arg(short, long)]
        port: u16,

        /// Host the local service listens on
        #[arg(long, default_value = "localhost")]
        local_host: String,

        /// Desired subdomain (validated by the relay)
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Relay server URL
        #[arg(short, long, env = "PASSAGE_RELAY", default_value = "http://localhost:3000")]
        relay: String,

        /// Relay credential username
        #[arg(long, env = "PASSAGE_USERNAME")]
        username: Option<String>,

        /// Relay credential password
        #[arg(long, env = "PASSAGE_PASSWORD")]
        password: Option<String>,

        /// Reconnection attempts before giving up
        #[arg(long, default_value = "10")]
        max_reconnect_attempts: u32,

        /// Reach the local service over HTTPS
        #[arg(long)]
        local_https: bool,

        /// Client certificate for the local service
        #[arg(long, requires = "local_https")]
        local_cert: Option<PathBuf>,

        /// Private key for the client certificate
        #[arg(long, requires = "local_https")]
        local_key: Option<PathBuf>,

        /// Extra CA bundle trusted for the local service
        #[arg(long, requires = "local_https")]
        local_ca: Option<PathBuf>,

        /// Skip certificate verification for self-signed local services
        #[arg(long, requires = "local_https")]
        allow_invalid_cert: bool,
    },
    /// Run the relay: control-plane API plus data-plane proxy
    Serve {
        /// Address for the control-plane API
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: SocketAddr,

        /// Shared credential username (gate disabled when unset)
        #[arg(long, env = "PASSAGE_USERNAME")]
        username: Option<String>,

        /// Shared credential password
        #[arg(long, env = "PASSAGE_PASSWORD")]
        password: Option<String>,

        /// First public port handed out by the allocator
        #[arg(long, default_value = "2000")]
        base_port: u16,

        /// Pool size advertised to clients
        #[arg(long)]
        max_connections: Option<u32>,

        /// Interface the public listeners bind on
        #[arg(long, default_value = "0.0.0.0")]
        proxy_bind_host: String,

        /// Host the proxy dials for tunnel endpoints
        #[arg(long, default_value = "127.0.0.1")]
        upstream_host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Http {
            port,
            local_host,
            subdomain,
            relay,
            username,
            password,
            max_reconnect_attempts,
            local_https,
            local_cert,
            local_key,
            local_ca,
            allow_invalid_cert,
        } => {
            let local_tls = local_https.then_some(LocalTls {
                cert_path: local_cert,
                key_path: local_key,
                ca_path: local_ca,
                allow_invalid_cert,
            });
            run_http(
                port,
                local_host,
                subdomain,
                relay,
                username.zip(password),
                max_reconnect_attempts,
                local_tls,
            )
            .await
        }
        Commands::Serve {
            bind,
            username,
            password,
            base_port,
            max_connections,
            proxy_bind_host,
            upstream_host,
        } => {
            run_serve(
                bind,
                username.zip(password),
                base_port,
                max_connections,
                proxy_bind_host,
                upstream_host,
            )
            .await
        }
    }
}

async fn run_http(
    port: u16,
    local_host: String,
    subdomain: Option<String>,
    relay: String,
    credentials: Option<(String, String)>,
    max_reconnect_attempts: u32,
    local_tls: Option<LocalTls>,
) -> Result<()> {
    let mut builder = SessionOptions::builder()
        .local_port(port)
        .local_host(local_host)
        .relay_url(relay)
        .max_reconnect_attempts(max_reconnect_attempts);
    if let Some(subdomain) = subdomain {
        builder = builder.subdomain(subdomain);
    }
    if let Some((username, password)) = credentials {
        builder = builder.credentials(username, password);
    }
    if let Some(tls) = local_tls {
        builder = builder.local_tls(tls);
    }
    let options = builder.build().context("Invalid session options")?;

    let session = TunnelSession::new(options);
    let mut events = session.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TunnelEvent::Connecting => info!("Connecting to relay..."),
                TunnelEvent::Connected { url } => info!("Tunnel ready at {}", url),
                TunnelEvent::Reconnecting { attempt, delay } => {
                    warn!("Connection lost, retry {} in {:?}", attempt, delay)
                }
                TunnelEvent::Reconnected { url } => info!("Tunnel restored at {}", url),
                TunnelEvent::ReconnectError { error } => warn!("Reconnect failed: {}", error),
                TunnelEvent::Error { error } => error!("{}", error),
                TunnelEvent::Request(request) => {
                    info!("{} {} [{}]", request.method, request.path, request.id)
                }
                TunnelEvent::Status(report) => {
                    info!(
                        "status={} idle={:?} attempts={}",
                        report.status, report.idle, report.reconnect_attempts
                    )
                }
                TunnelEvent::Closed => info!("Tunnel closed"),
            }
        }
    });

    session.open().await.context("Failed to open tunnel")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    session.close().await;

    Ok(())
}

async fn run_serve(
    bind: SocketAddr,
    credentials: Option<(String, String)>,
    base_port: u16,
    max_connections: Option<u32>,
    proxy_bind_host: String,
    upstream_host: String,
) -> Result<()> {
    let registry = Arc::new(MemoryRegistry::new());
    let events = CreationBus::new();

    let proxy = Arc::new(ProxyServer::new(
        registry.clone(),
        ProxyConfig {
            bind_host: proxy_bind_host,
            upstream_host,
        },
    ));
    let notifications = events.subscribe();
    tokio::spawn(async move {
        proxy.run(notifications).await;
    });

    let config = ApiServerConfig {
        bind_addr: bind,
        credentials,
        base_port,
        max_connections,
        ..Default::default()
    };
    let server = ApiServer::new(config, registry, events);
    server.start().await
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
