//! Connection pool contract
//!
//! The pool owns the live transport connections between client and relay for
//! one tunnel. Its internal wire format is not this crate's concern; the
//! session only depends on the lifecycle events and the live-connection count
//! defined here.

use crate::events::RequestInfo;
use crate::options::LocalTls;
use crate::TunnelError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Placement of one pool generation: where to dial and how many connections
/// to keep
#[derive(Debug, Clone)]
pub struct PlacementDescriptor {
    /// Relay hostname to dial
    pub remote_host: String,
    /// Port the control plane allocated for this tunnel
    pub remote_port: u16,
    /// Local service host
    pub local_host: String,
    /// Local service port
    pub local_port: u16,
    /// TLS material for the local leg, when the local service speaks HTTPS
    pub local_tls: Option<LocalTls>,
    /// Number of transport connections to hold open
    pub max_connections: usize,
}

/// Classification of a socket-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Peer reset the connection
    Reset,
    /// Read or write timed out
    Timeout,
    /// Anything else
    Other,
}

impl TransportErrorKind {
    /// Whether this error class indicates a severed connection and should
    /// trigger reconnection directly
    pub fn severs_connection(&self) -> bool {
        matches!(self, TransportErrorKind::Reset | TransportErrorKind::Timeout)
    }

    pub fn classify(error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                TransportErrorKind::Reset
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::Timeout
            }
            _ => TransportErrorKind::Other,
        }
    }
}

/// Events a pool reports to its owning session
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// First connection of this generation is ready; emitted once
    Opened,
    /// A connection was lost; the owner opens a replacement
    Dead,
    /// Socket-level error on a connection
    TransportError {
        kind: TransportErrorKind,
        message: String,
    },
    /// An application exchange passed through the pool
    Request(RequestInfo),
}

/// Live transport connections for one tunnel generation
///
/// After `close()` the pool must not emit further `Dead` events.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Open one additional transport connection
    async fn open(&self) -> Result<(), TunnelError>;

    /// Number of currently live connections
    fn connection_count(&self) -> usize;

    /// Shut down all owned connections
    async fn close(&self);
}

/// Builds a pool generation from a placement descriptor
///
/// Events flow back to the owner through the channel handed in here; each
/// generation gets a fresh channel so a discarded pool cannot leak events into
/// its successor.
pub trait PoolFactory: Send + Sync {
    fn build(
        &self,
        descriptor: PlacementDescriptor,
        events: mpsc::Sender<PoolEvent>,
    ) -> Arc<dyn ConnectionPool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_timeout_sever_the_connection() {
        assert!(TransportErrorKind::Reset.severs_connection());
        assert!(TransportErrorKind::Timeout.severs_connection());
        assert!(!TransportErrorKind::Other.severs_connection());
    }

    #[test]
    fn test_classification_from_io_errors() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(TransportErrorKind::classify(&reset), TransportErrorKind::Reset);

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        assert_eq!(
            TransportErrorKind::classify(&timeout),
            TransportErrorKind::Timeout
        );

        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        assert_eq!(TransportErrorKind::classify(&other), TransportErrorKind::Other);
    }
}
