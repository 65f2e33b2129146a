//! Client error types

use thiserror::Error;

/// Tunnel session errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The control plane rejected the request as malformed; never retried
    #[error("invalid tunnel request: {0}")]
    Validation(String),

    /// The control plane could not be reached or answered with a server
    /// error; the session retries these on a fixed delay
    #[error("tunnel request failed: {0}")]
    RequestFailed(String),

    /// The configured reconnection attempt cap was reached
    #[error("Maximum reconnection attempts reached")]
    ReconnectExhausted,

    /// The session was closed by its owner
    #[error("tunnel session is closed")]
    Closed,

    /// Socket-level failure inside the connection pool
    #[error("transport error: {0}")]
    Transport(String),

    /// Session options failed validation at construction
    #[error("invalid session options: {0}")]
    InvalidOptions(String),
}
