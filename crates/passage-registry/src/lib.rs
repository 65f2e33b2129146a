//! Shared tunnel registry
//!
//! The registry is the single source of truth for tunnel records and for
//! allocation uniqueness of subdomains and ports. The control plane writes to
//! it; the data-plane proxy reads it on startup recovery. Membership checks
//! and claims are deliberately separate operations, matching the store this
//! design was lifted from.

pub mod memory;
pub mod notify;

pub use memory::MemoryRegistry;
pub use notify::CreationBus;

use async_trait::async_trait;
use passage_proto::TunnelRecord;
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Durable store of tunnel records and allocation sets
///
/// Every operation can fail with [`RegistryError::Unavailable`] when the
/// backing store is unreachable; callers decide whether that is fatal (the
/// control plane surfaces a 5xx) or skippable (the proxy logs and moves on).
#[async_trait]
pub trait Registry: Send + Sync {
    async fn put_record(&self, record: TunnelRecord) -> Result<(), RegistryError>;
    async fn record(&self, id: &str) -> Result<Option<TunnelRecord>, RegistryError>;
    async fn remove_record(&self, id: &str) -> Result<Option<TunnelRecord>, RegistryError>;

    async fn add_active(&self, id: &str) -> Result<(), RegistryError>;
    async fn remove_active(&self, id: &str) -> Result<(), RegistryError>;
    async fn active_ids(&self) -> Result<Vec<String>, RegistryError>;

    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool, RegistryError>;
    async fn claim_subdomain(&self, subdomain: &str) -> Result<(), RegistryError>;
    async fn release_subdomain(&self, subdomain: &str) -> Result<(), RegistryError>;

    async fn port_taken(&self, port: u16) -> Result<bool, RegistryError>;
    async fn claim_port(&self, port: u16) -> Result<(), RegistryError>;
    async fn release_port(&self, port: u16) -> Result<(), RegistryError>;
}
