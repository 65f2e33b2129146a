//! Tunnel session state machine
//!
//! One `TunnelSession` owns one tunnel's lifecycle: it requests an allocation
//! from the control plane, drives the connection pool, runs the periodic
//! health check, and recovers from transport loss with exponential backoff.
//!
//! States: initiated -> connecting -> connected <-> reconnecting ->
//! {connected | failed}, with terminal `closed` reachable from any state and
//! `error` reachable from `connecting` on an unrecoverable request failure.

use crate::api::{ControlPlane, HttpControlPlane};
use crate::backoff::reconnect_delay;
use crate::events::{SessionStatus, StatusReport, StatusSnapshot, TunnelEvent};
use crate::options::SessionOptions;
use crate::pool::{ConnectionPool, PlacementDescriptor, PoolEvent, PoolFactory};
use crate::tcp_pool::TcpPoolFactory;
use crate::TunnelError;
use chrono::{DateTime, Utc};
use passage_proto::{CreateTunnelRequest, CreateTunnelResponse};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const POOL_EVENT_CAPACITY: usize = 64;

struct SessionState {
    status: SessionStatus,
    reconnect_attempts: u32,
    /// Monotonic activity clock, used for idle computation
    last_active: tokio::time::Instant,
    /// Wall-clock counterpart reported to observers
    last_active_at: DateTime<Utc>,
    client_id: Option<String>,
    url: Option<String>,
    cached_url: Option<String>,
}

/// The current pool and the token that stops its event loop
struct PoolGeneration {
    pool: Arc<dyn ConnectionPool>,
    token: CancellationToken,
}

struct Inner {
    options: SessionOptions,
    control: Arc<dyn ControlPlane>,
    pools: Arc<dyn PoolFactory>,
    events: broadcast::Sender<TunnelEvent>,
    state: Mutex<SessionState>,
    closed: CancellationToken,
    started: AtomicBool,
    reconnect_in_flight: AtomicBool,
    pool: Mutex<Option<PoolGeneration>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Client-side handle to one tunnel
pub struct TunnelSession {
    inner: Arc<Inner>,
}

impl TunnelSession {
    /// Create a session wired to the real control plane and TCP pool
    pub fn new(options: SessionOptions) -> Self {
        let control = Arc::new(HttpControlPlane::new(
            options.relay_url.clone(),
            options.credentials.clone(),
        ));
        Self::with_parts(options, control, Arc::new(TcpPoolFactory))
    }

    /// Create a session with explicit control-plane and pool implementations
    pub fn with_parts(
        options: SessionOptions,
        control: Arc<dyn ControlPlane>,
        pools: Arc<dyn PoolFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            options,
            control,
            pools,
            events,
            state: Mutex::new(SessionState {
                status: SessionStatus::Initiated,
                reconnect_attempts: 0,
                last_active: tokio::time::Instant::now(),
                last_active_at: Utc::now(),
                client_id: None,
                url: None,
                cached_url: None,
            }),
            closed: CancellationToken::new(),
            started: AtomicBool::new(false),
            reconnect_in_flight: AtomicBool::new(false),
            pool: Mutex::new(None),
            health_task: Mutex::new(None),
        });
        Self { inner }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Current session state; never blocks
    pub fn status(&self) -> StatusSnapshot {
        let state = self.inner.state.lock().unwrap();
        StatusSnapshot {
            status: state.status,
            url: state.url.clone(),
            client_id: state.client_id.clone(),
            last_active: state.last_active_at,
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    /// Cached URL advertised by the relay, when it supports caching
    pub fn cached_url(&self) -> Option<String> {
        self.inner.state.lock().unwrap().cached_url.clone()
    }

    /// Start the session
    ///
    /// Idempotent: a second call returns immediately. Resolves once the first
    /// tunnel-creation request succeeds; a validation rejection is
    /// unrecoverable and moves the session to `error`. Any other request
    /// failure is retried on a fixed delay until success or close.
    pub async fn open(&self) -> Result<(), TunnelError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = inner.state.lock().unwrap();
            state.status = SessionStatus::Connecting;
        }
        inner.emit(TunnelEvent::Connecting);

        let response = loop {
            if inner.closed.is_cancelled() {
                return Err(TunnelError::Closed);
            }

            match inner.control.create_tunnel(&inner.create_request()).await {
                Ok(response) => break response,
                Err(TunnelError::Validation(message)) => {
                    let mut state = inner.state.lock().unwrap();
                    state.status = SessionStatus::Error;
                    drop(state);
                    inner.emit(TunnelEvent::Error {
                        error: message.clone(),
                    });
                    return Err(TunnelError::Validation(message));
                }
                Err(e) => {
                    debug!("Tunnel server unavailable: {}, retrying", e);
                    tokio::select! {
                        _ = inner.closed.cancelled() => return Err(TunnelError::Closed),
                        _ = tokio::time::sleep(inner.options.request_retry_delay) => {}
                    }
                }
            }
        };

        Inner::establish(inner, &response).await;
        Ok(())
    }

    /// Close the session
    ///
    /// Cancels the health check, instructs the pool to terminate and emits the
    /// final `Closed` event. A reconnect already sleeping on its backoff is
    /// not retracted; it re-checks the closed flag when it wakes and aborts
    /// silently.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return;
        }
        inner.closed.cancel();

        {
            let mut state = inner.state.lock().unwrap();
            state.status = SessionStatus::Closed;
        }

        if let Some(handle) = inner.health_task.lock().unwrap().take() {
            handle.abort();
        }

        let generation = inner.pool.lock().unwrap().take();
        if let Some(generation) = generation {
            generation.token.cancel();
            generation.pool.close().await;
        }

        inner.emit(TunnelEvent::Closed);
    }
}

impl Inner {
    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn touch(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_active = tokio::time::Instant::now();
        state.last_active_at = Utc::now();
    }

    fn create_request(&self) -> CreateTunnelRequest {
        CreateTunnelRequest {
            port: Some(u32::from(self.options.local_port)),
            subdomain: self.options.subdomain.clone(),
        }
    }

    /// Compose the public URL from the relay host and allocated subdomain
    fn compose_url(&self, subdomain: &str) -> String {
        format!(
            "{}://{}.{}",
            self.options.relay_scheme(),
            subdomain,
            self.options.relay_host()
        )
    }

    fn record_identity(&self, response: &CreateTunnelResponse) {
        let mut state = self.state.lock().unwrap();
        state.client_id = Some(response.record.id.clone());
        state.url = Some(self.compose_url(&response.record.subdomain));
        if let Some(ref cached) = response.cached_url {
            state.cached_url = Some(cached.clone());
        }
    }

    /// Build the pool for a fresh connection generation and start its event
    /// loop and the health check
    ///
    /// Any previous generation is closed first; at most one pool is current
    /// at a time.
    async fn establish(inner: &Arc<Inner>, response: &CreateTunnelResponse) {
        inner.record_identity(response);

        let max_connections = response.max_connections.unwrap_or(1).max(1) as usize;
        let descriptor = PlacementDescriptor {
            remote_host: inner.options.relay_host().to_string(),
            remote_port: response.record.port,
            local_host: inner.options.local_host.clone(),
            local_port: inner.options.local_port,
            local_tls: inner.options.local_tls.clone(),
            max_connections,
        };

        let previous = inner.pool.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.token.cancel();
            previous.pool.close().await;
        }

        let token = inner.closed.child_token();
        let (tx, rx) = mpsc::channel(POOL_EVENT_CAPACITY);
        let pool = inner.pools.build(descriptor, tx);
        *inner.pool.lock().unwrap() = Some(PoolGeneration {
            pool: pool.clone(),
            token: token.clone(),
        });

        for _ in 0..max_connections {
            if let Err(e) = pool.open().await {
                warn!("Failed to open transport connection: {}", e);
                inner.emit(TunnelEvent::Error {
                    error: e.to_string(),
                });
            }
        }

        Inner::spawn_event_loop(Arc::clone(inner), rx, token, pool);
        Inner::start_health_check(inner);
    }

    fn spawn_event_loop(
        inner: Arc<Inner>,
        mut rx: mpsc::Receiver<PoolEvent>,
        token: CancellationToken,
        pool: Arc<dyn ConnectionPool>,
    ) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    PoolEvent::Opened => {
                        inner.touch();
                        let connected_url = {
                            let mut state = inner.state.lock().unwrap();
                            if state.status == SessionStatus::Connecting {
                                state.status = SessionStatus::Connected;
                                state.url.clone()
                            } else {
                                None
                            }
                        };
                        if let Some(url) = connected_url {
                            inner.emit(TunnelEvent::Connected { url });
                        }
                    }
                    PoolEvent::Dead => {
                        if inner.closed.is_cancelled() {
                            continue;
                        }
                        debug!("Transport connection lost, opening replacement");
                        if let Err(e) = pool.open().await {
                            warn!("Failed to replace dead connection: {}", e);
                        }
                    }
                    PoolEvent::Request(info) => {
                        inner.touch();
                        inner.emit(TunnelEvent::Request(info));
                    }
                    PoolEvent::TransportError { kind, message } => {
                        debug!("Transport error ({:?}): {}", kind, message);
                        inner.emit(TunnelEvent::Error {
                            error: message.clone(),
                        });
                        if kind.severs_connection() {
                            Inner::begin_reconnect(&inner);
                        }
                    }
                }
            }
            debug!("Pool event loop exiting");
        });
    }

    /// Restart the periodic health check for the current generation
    fn start_health_check(inner: &Arc<Inner>) {
        let mut slot = inner.health_task.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.options.health_check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = inner.closed.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let (status, last_active, idle, attempts, url) = {
                    let state = inner.state.lock().unwrap();
                    (
                        state.status,
                        state.last_active_at,
                        state.last_active.elapsed(),
                        state.reconnect_attempts,
                        state.url.clone(),
                    )
                };

                if idle > inner.options.idle_threshold {
                    Inner::check_health(&inner);
                }

                inner.emit(TunnelEvent::Status(StatusReport {
                    status,
                    last_active,
                    idle,
                    reconnect_attempts: attempts,
                    url,
                }));
            }
        });
        *slot = Some(handle);
    }

    /// Probe pool liveness; a pool with zero live connections means the
    /// tunnel is gone and reconnection starts
    fn check_health(inner: &Arc<Inner>) {
        debug!("Performing health check on tunnel");
        let pool = inner
            .pool
            .lock()
            .unwrap()
            .as_ref()
            .map(|generation| generation.pool.clone());
        if let Some(pool) = pool {
            if pool.connection_count() == 0 {
                debug!("Tunnel appears unhealthy, attempting to reconnect");
                Inner::begin_reconnect(inner);
            }
        }
    }

    /// Start the reconnect cycle unless one is already running
    ///
    /// Safe to call from the health check while a transport-error-triggered
    /// reconnect is in flight; the second caller is a no-op.
    fn begin_reconnect(inner: &Arc<Inner>) {
        if inner.closed.is_cancelled() {
            debug!("Tunnel is closed, not attempting to reconnect");
            return;
        }
        if inner.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Inner::reconnect_loop(inner).await;
        });
    }

    async fn reconnect_loop(inner: Arc<Inner>) {
        loop {
            if inner.closed.is_cancelled() {
                inner.reconnect_in_flight.store(false, Ordering::SeqCst);
                return;
            }

            let attempt = {
                let mut state = inner.state.lock().unwrap();
                if state.reconnect_attempts >= inner.options.max_reconnect_attempts {
                    state.status = SessionStatus::Failed;
                    drop(state);
                    inner.emit(TunnelEvent::Error {
                        error: TunnelError::ReconnectExhausted.to_string(),
                    });
                    inner.reconnect_in_flight.store(false, Ordering::SeqCst);
                    return;
                }
                state.status = SessionStatus::Reconnecting;
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };

            let delay = reconnect_delay(
                attempt,
                inner.options.reconnect_backoff,
                inner.options.max_backoff,
            );
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            inner.emit(TunnelEvent::Reconnecting { attempt, delay });

            // The sleep is not raced against the close token: close() does
            // not retract a scheduled retry. The woken body re-checks the
            // flag below before acting.
            tokio::time::sleep(delay).await;

            if inner.closed.is_cancelled() {
                debug!("Session closed while reconnect was scheduled");
                inner.reconnect_in_flight.store(false, Ordering::SeqCst);
                return;
            }

            match inner.control.create_tunnel(&inner.create_request()).await {
                Ok(response) => {
                    {
                        let mut state = inner.state.lock().unwrap();
                        state.status = SessionStatus::Connected;
                        state.reconnect_attempts = 0;
                    }
                    Inner::establish(&inner, &response).await;
                    let url = inner
                        .state
                        .lock()
                        .unwrap()
                        .url
                        .clone()
                        .unwrap_or_default();
                    inner.emit(TunnelEvent::Reconnected { url });
                    inner.reconnect_in_flight.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    debug!("Reconnect failed: {}", e);
                    inner.emit(TunnelEvent::ReconnectError {
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}
