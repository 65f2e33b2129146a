//! Session status and observable events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Constructed, `open()` not yet called
    Initiated,
    /// Tunnel-creation request in flight
    Connecting,
    /// Pool established and carrying traffic
    Connected,
    /// Connection lost, backoff/retry cycle running
    Reconnecting,
    /// Reconnection attempt cap reached; no further automatic recovery
    Failed,
    /// Explicitly closed by the owner
    Closed,
    /// Unrecoverable tunnel-creation failure
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Failed => "failed",
            SessionStatus::Closed => "closed",
            SessionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// One application exchange observed on the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub id: String,
    pub method: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Periodic health-check report
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub last_active: DateTime<Utc>,
    pub idle: Duration,
    pub reconnect_attempts: u32,
    pub url: Option<String>,
}

/// Point-in-time view returned by [`TunnelSession::status`]
///
/// [`TunnelSession::status`]: crate::session::TunnelSession::status
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub url: Option<String>,
    pub client_id: Option<String>,
    pub last_active: DateTime<Utc>,
    pub reconnect_attempts: u32,
}

/// Events a session broadcasts to its observers, one variant per kind
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// Tunnel-creation request issued
    Connecting,
    /// First transport connection is ready
    Connected { url: String },
    /// A reconnect attempt was scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// A reconnect attempt succeeded
    Reconnected { url: String },
    /// A reconnect sub-attempt failed; another follows
    ReconnectError { error: String },
    /// Transport or terminal session error
    Error { error: String },
    /// Periodic status report from the health check
    Status(StatusReport),
    /// Application traffic observed on the pool
    Request(RequestInfo),
    /// Session closed by its owner
    Closed,
}
