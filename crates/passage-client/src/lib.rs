//! Tunnel client library - Public API
//!
//! Owns one tunnel's lifecycle on the consumer side: requests tunnel creation
//! from the control plane, drives the connection pool, runs health checks, and
//! performs reconnection with exponential backoff.

pub mod api;
pub mod backoff;
pub mod error;
pub mod events;
pub mod options;
pub mod pool;
pub mod session;
pub mod tcp_pool;

pub use api::{ControlPlane, HttpControlPlane};
pub use backoff::reconnect_delay;
pub use error::TunnelError;
pub use events::{RequestInfo, SessionStatus, StatusReport, StatusSnapshot, TunnelEvent};
pub use options::{Credentials, LocalTls, SessionOptions, SessionOptionsBuilder};
pub use pool::{
    ConnectionPool, PlacementDescriptor, PoolEvent, PoolFactory, TransportErrorKind,
};
pub use session::TunnelSession;
pub use tcp_pool::{TcpConnectionPool, TcpPoolFactory};
