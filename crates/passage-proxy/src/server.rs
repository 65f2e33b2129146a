//! Dynamic per-tunnel listener management

use passage_proto::TunnelRecord;
use passage_registry::{Registry, RegistryError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Data-plane proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Interface the public listeners bind on
    pub bind_host: String,
    /// Host the companion socket dials; the tunnel's allocated port on this
    /// host is the local endpoint
    pub upstream_host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            upstream_host: "127.0.0.1".to_string(),
        }
    }
}

/// One running listener: its shutdown token and live bridge count
struct ListenerEntry {
    shutdown: CancellationToken,
    bridged: Arc<AtomicUsize>,
}

/// Data-plane proxy: one public TCP listener per active tunnel
pub struct ProxyServer {
    registry: Arc<dyn Registry>,
    config: ProxyConfig,
    listeners: Mutex<HashMap<String, ListenerEntry>>,
}

impl ProxyServer {
    pub fn new(registry: Arc<dyn Registry>, config: ProxyConfig) -> Self {
        Self {
            registry,
            config,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Recover listeners for every tunnel already in the active set
    ///
    /// No creation notification is needed for tunnels that existed before
    /// this process started. A failing tunnel is logged and skipped; it never
    /// takes the process down.
    pub async fn recover(&self) {
        let ids = match self.registry.active_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Error loading active tunnels: {}", e);
                return;
            }
        };

        let mut recovered = 0usize;
        for id in &ids {
            match self.registry.record(id).await {
                Ok(Some(record)) => {
                    if let Err(e) = self.start_listener(record).await {
                        error!(id = %id, "Failed to recover tunnel: {}", e);
                    } else {
                        recovered += 1;
                    }
                }
                Ok(None) => {
                    warn!(id = %id, "Active tunnel has no record, skipping");
                }
                Err(e) => {
                    error!(id = %id, "Error reading tunnel record: {}", e);
                }
            }
        }
        info!("Recovered {} of {} existing tunnels", recovered, ids.len());
    }

    /// Recover existing tunnels, then serve creation notifications until the
    /// channel closes
    pub async fn run(&self, mut notifications: broadcast::Receiver<TunnelRecord>) {
        self.recover().await;

        loop {
            match notifications.recv().await {
                Ok(record) => {
                    if let Err(e) = self.start_listener(record).await {
                        error!("Failed to create listener from notification: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Creation notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Notification channel closed, proxy loop exiting");
                    break;
                }
            }
        }
    }

    /// Bind the tunnel's public listener and start accepting
    ///
    /// At most one listener exists per tunnel id; a duplicate request is a
    /// no-op. Bind failures are returned for the caller to log, leaving other
    /// tunnels untouched.
    pub async fn start_listener(&self, record: TunnelRecord) -> Result<(), ProxyError> {
        {
            let listeners = self.listeners.lock().unwrap();
            if listeners.contains_key(&record.id) {
                debug!(id = %record.id, "Listener already running for tunnel");
                return Ok(());
            }
        }

        let address = format!("{}:{}", self.config.bind_host, record.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| ProxyError::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        info!(id = %record.id, %address, "Proxy server listening");

        let shutdown = CancellationToken::new();
        let bridged = Arc::new(AtomicUsize::new(0));
        {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.insert(
                record.id.clone(),
                ListenerEntry {
                    shutdown: shutdown.clone(),
                    bridged: bridged.clone(),
                },
            );
        }

        let upstream_addr = format!("{}:{}", self.config.upstream_host, record.port);
        tokio::spawn(Self::accept_loop(
            listener,
            record.id.clone(),
            upstream_addr,
            shutdown,
            bridged,
        ));

        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        tunnel_id: String,
        upstream_addr: String,
        shutdown: CancellationToken,
        bridged: Arc<AtomicUsize>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer_addr)) => {
                    info!(id = %tunnel_id, %peer_addr, "New public connection");
                    // Bridges are not tracked by the shutdown token; stopping
                    // a listener lets in-flight pairs drain naturally
                    tokio::spawn(Self::bridge(
                        client,
                        upstream_addr.clone(),
                        tunnel_id.clone(),
                        bridged.clone(),
                    ));
                }
                Err(e) => {
                    error!(id = %tunnel_id, "Failed to accept connection: {}", e);
                }
            }
        }
        debug!(id = %tunnel_id, "Listener stopped");
    }

    /// Splice one public connection to the tunnel's local endpoint
    async fn bridge(
        mut client: TcpStream,
        upstream_addr: String,
        tunnel_id: String,
        bridged: Arc<AtomicUsize>,
    ) {
        let mut upstream = match TcpStream::connect(&upstream_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(id = %tunnel_id, %upstream_addr, "Local socket error: {}", e);
                return;
            }
        };
        debug!(id = %tunnel_id, %upstream_addr, "Connected to local endpoint");

        bridged.fetch_add(1, Ordering::SeqCst);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_upstream, to_client)) => {
                debug!(
                    id = %tunnel_id,
                    "Bridge complete: {} bytes in, {} bytes out",
                    to_upstream,
                    to_client
                );
            }
            Err(e) => {
                debug!(id = %tunnel_id, "Bridge closed: {}", e);
            }
        }
        bridged.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stop the listener for a tunnel; no-op when none is registered
    pub fn stop_listener(&self, tunnel_id: &str) {
        let entry = self.listeners.lock().unwrap().remove(tunnel_id);
        match entry {
            Some(entry) => {
                entry.shutdown.cancel();
                info!(id = %tunnel_id, "Stopped proxy server");
            }
            None => {
                debug!(id = %tunnel_id, "No listener registered for tunnel");
            }
        }
    }

    /// Whether a listener is currently registered for the tunnel
    pub fn is_serving(&self, tunnel_id: &str) -> bool {
        self.listeners.lock().unwrap().contains_key(tunnel_id)
    }

    /// Number of running listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Number of currently bridged connection pairs for a tunnel
    pub fn active_bridges(&self, tunnel_id: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(tunnel_id)
            .map(|entry| entry.bridged.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
