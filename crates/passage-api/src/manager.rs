//! Tunnel allocation logic
//!
//! Allocates identity, subdomain and port for new tunnels, persists the
//! record, and republishes creation events for data-plane proxies.

use chrono::Utc;
use passage_proto::{TunnelRecord, TunnelState};
use passage_registry::{CreationBus, Registry, RegistryError};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

const DEFAULT_BASE_PORT: u16 = 2000;
const SUBDOMAIN_LEN: usize = 6;
const SUBDOMAIN_DRAW_LIMIT: u32 = 32;
const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Allocation pools ran dry
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no free subdomain found after {attempts} draws")]
    SubdomainsExhausted { attempts: u32 },

    #[error("no free port available above {base}")]
    PortsExhausted { base: u16 },
}

/// Control-plane operation errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Allocates and manages tunnel records in the shared registry
pub struct TunnelManager {
    registry: Arc<dyn Registry>,
    events: CreationBus,
    base_port: u16,
}

impl TunnelManager {
    pub fn new(registry: Arc<dyn Registry>, events: CreationBus) -> Self {
        Self {
            registry,
            events,
            base_port: DEFAULT_BASE_PORT,
        }
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    /// Allocate a new tunnel: fresh id, unused subdomain and port
    ///
    /// The record is persisted, added to the active set and published on the
    /// creation bus before being returned.
    pub async fn create_tunnel(&self) -> Result<TunnelRecord, ControlError> {
        let id = uuid::Uuid::new_v4().to_string();
        let subdomain = self.generate_subdomain().await?;
        let port = self.allocate_port().await?;

        let record = TunnelRecord {
            id: id.clone(),
            subdomain: subdomain.clone(),
            status: TunnelState::Active,
            created_at: Utc::now(),
            port,
        };

        self.registry.put_record(record.clone()).await?;
        self.registry.add_active(&id).await?;

        info!(id = %id, subdomain = %subdomain, port, "Created new tunnel");
        self.events.publish(record.clone());

        Ok(record)
    }

    /// Draw random subdomains until an unused one is found
    ///
    /// Bounded: pathological pool pressure surfaces as an allocation error
    /// instead of looping forever. Membership check and claim are separate
    /// registry operations; two concurrent creations can race between them.
    async fn generate_subdomain(&self) -> Result<String, ControlError> {
        for _ in 0..SUBDOMAIN_DRAW_LIMIT {
            let candidate = random_subdomain();
            if self.registry.subdomain_taken(&candidate).await? {
                continue;
            }
            self.registry.claim_subdomain(&candidate).await?;
            return Ok(candidate);
        }
        Err(AllocationError::SubdomainsExhausted {
            attempts: SUBDOMAIN_DRAW_LIMIT,
        }
        .into())
    }

    /// Scan upward from the base port for the first unallocated value
    async fn allocate_port(&self) -> Result<u16, ControlError> {
        let mut port = self.base_port;
        loop {
            if !self.registry.port_taken(port).await? {
                self.registry.claim_port(port).await?;
                return Ok(port);
            }
            port = port
                .checked_add(1)
                .ok_or(AllocationError::PortsExhausted {
                    base: self.base_port,
                })?;
        }
    }

    /// Fetch a record by id; deleted records read as absent
    pub async fn get_tunnel(&self, id: &str) -> Result<Option<TunnelRecord>, ControlError> {
        let record = self.registry.record(id).await?;
        Ok(record.filter(|r| r.is_active()))
    }

    /// Delete a tunnel and release its port and subdomain
    ///
    /// Deleting an unknown id is a no-op, not an error.
    pub async fn delete_tunnel(&self, id: &str) -> Result<(), ControlError> {
        if let Some(record) = self.registry.remove_record(id).await? {
            self.registry.remove_active(id).await?;
            self.registry.release_port(record.port).await?;
            self.registry.release_subdomain(&record.subdomain).await?;
            info!(id = %id, "Deleted tunnel");
        }
        Ok(())
    }
}

fn random_subdomain() -> String {
    let mut rng = rand::thread_rng();
    (0..SUBDOMAIN_LEN)
        .map(|_| {
            let index = rng.gen_range(0..SUBDOMAIN_CHARSET.len());
            SUBDOMAIN_CHARSET[index] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_registry::MemoryRegistry;

    fn create_test_manager() -> TunnelManager {
        TunnelManager::new(Arc::new(MemoryRegistry::new()), CreationBus::new())
    }

    #[test]
    fn test_random_subdomain_shape() {
        for _ in 0..100 {
            let subdomain = random_subdomain();
            assert_eq!(subdomain.len(), SUBDOMAIN_LEN);
            assert!(subdomain
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_create_allocates_from_base_port() {
        let manager = create_test_manager();

        let first = manager.create_tunnel().await.unwrap();
        assert_eq!(first.port, 2000);
        assert_eq!(first.status, TunnelState::Active);

        let second = manager.create_tunnel().await.unwrap();
        assert_eq!(second.port, 2001);
        assert_ne!(first.subdomain, second.subdomain);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_delete_releases_port_for_reuse() {
        let manager = create_test_manager();

        let first = manager.create_tunnel().await.unwrap();
        let _second = manager.create_tunnel().await.unwrap();

        manager.delete_tunnel(&first.id).await.unwrap();

        let third = manager.create_tunnel().await.unwrap();
        assert_eq!(third.port, first.port);
    }

    #[tokio::test]
    async fn test_delete_releases_subdomain_for_reuse() {
        let registry = Arc::new(MemoryRegistry::new());
        let manager = TunnelManager::new(registry.clone(), CreationBus::new());

        let record = manager.create_tunnel().await.unwrap();
        assert!(registry.subdomain_taken(&record.subdomain).await.unwrap());

        manager.delete_tunnel(&record.id).await.unwrap();
        assert!(!registry.subdomain_taken(&record.subdomain).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_unknown_id_is_noop() {
        let manager = create_test_manager();
        assert!(manager.delete_tunnel("does-not-exist").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_returns_none_after_delete() {
        let manager = create_test_manager();
        let record = manager.create_tunnel().await.unwrap();

        assert!(manager.get_tunnel(&record.id).await.unwrap().is_some());

        manager.delete_tunnel(&record.id).await.unwrap();
        assert!(manager.get_tunnel(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_publishes_on_bus() {
        let bus = CreationBus::new();
        let manager = TunnelManager::new(Arc::new(MemoryRegistry::new()), bus.clone());
        let mut rx = bus.subscribe();

        let record = manager.create_tunnel().await.unwrap();
        let published = rx.recv().await.unwrap();
        assert_eq!(published, record);
    }

    #[tokio::test]
    async fn test_custom_base_port() {
        let manager = create_test_manager().with_base_port(9000);
        let record = manager.create_tunnel().await.unwrap();
        assert_eq!(record.port, 9000);
    }
}
