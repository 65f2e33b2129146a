//! In-memory registry implementation

use crate::{Registry, RegistryError};
use async_trait::async_trait;
use passage_proto::TunnelRecord;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, TunnelRecord>,
    active: HashSet<String>,
    subdomains: HashSet<String>,
    ports: HashSet<u16>,
}

/// Process-shared in-memory registry
///
/// Cloning is cheap and every clone sees the same state, so the control plane
/// and proxy can share one instance when colocated.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<RwLock<State>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put_record(&self, record: TunnelRecord) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        tracing::debug!(id = %record.id, subdomain = %record.subdomain, port = record.port, "Storing tunnel record");
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn record(&self, id: &str) -> Result<Option<TunnelRecord>, RegistryError> {
        let state = self.state.read().unwrap();
        Ok(state.records.get(id).cloned())
    }

    async fn remove_record(&self, id: &str) -> Result<Option<TunnelRecord>, RegistryError> {
        let mut state = self.state.write().unwrap();
        Ok(state.records.remove(id))
    }

    async fn add_active(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        state.active.insert(id.to_string());
        Ok(())
    }

    async fn remove_active(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        state.active.remove(id);
        Ok(())
    }

    async fn active_ids(&self) -> Result<Vec<String>, RegistryError> {
        let state = self.state.read().unwrap();
        Ok(state.active.iter().cloned().collect())
    }

    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool, RegistryError> {
        let state = self.state.read().unwrap();
        Ok(state.subdomains.contains(subdomain))
    }

    async fn claim_subdomain(&self, subdomain: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        tracing::debug!(subdomain = %subdomain, "Claiming subdomain");
        state.subdomains.insert(subdomain.to_string());
        Ok(())
    }

    async fn release_subdomain(&self, subdomain: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        tracing::debug!(subdomain = %subdomain, "Releasing subdomain");
        state.subdomains.remove(subdomain);
        Ok(())
    }

    async fn port_taken(&self, port: u16) -> Result<bool, RegistryError> {
        let state = self.state.read().unwrap();
        Ok(state.ports.contains(&port))
    }

    async fn claim_port(&self, port: u16) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        tracing::debug!(port, "Claiming port");
        state.ports.insert(port);
        Ok(())
    }

    async fn release_port(&self, port: u16) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        tracing::debug!(port, "Releasing port");
        state.ports.remove(&port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use passage_proto::TunnelState;

    fn create_test_record(id: &str, subdomain: &str, port: u16) -> TunnelRecord {
        TunnelRecord {
            id: id.to_string(),
            subdomain: subdomain.to_string(),
            status: TunnelState::Active,
            created_at: Utc::now(),
            port,
        }
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let registry = MemoryRegistry::new();
        let record = create_test_record("t1", "abc123", 2000);

        registry.put_record(record.clone()).await.unwrap();

        let retrieved = registry.record("t1").await.unwrap();
        assert_eq!(retrieved, Some(record));

        let removed = registry.remove_record("t1").await.unwrap();
        assert!(removed.is_some());
        assert!(registry.record("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_record_is_none() {
        let registry = MemoryRegistry::new();
        assert!(registry.remove_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_set() {
        let registry = MemoryRegistry::new();

        registry.add_active("t1").await.unwrap();
        registry.add_active("t2").await.unwrap();

        let mut ids = registry.active_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);

        registry.remove_active("t1").await.unwrap();
        assert_eq!(registry.active_ids().await.unwrap(), vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn test_subdomain_claim_and_release() {
        let registry = MemoryRegistry::new();

        assert!(!registry.subdomain_taken("abc123").await.unwrap());
        registry.claim_subdomain("abc123").await.unwrap();
        assert!(registry.subdomain_taken("abc123").await.unwrap());

        registry.release_subdomain("abc123").await.unwrap();
        assert!(!registry.subdomain_taken("abc123").await.unwrap());
    }

    #[tokio::test]
    async fn test_port_claim_and_release() {
        let registry = MemoryRegistry::new();

        assert!(!registry.port_taken(2000).await.unwrap());
        registry.claim_port(2000).await.unwrap();
        assert!(registry.port_taken(2000).await.unwrap());

        registry.release_port(2000).await.unwrap();
        assert!(!registry.port_taken(2000).await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = MemoryRegistry::new();
        let clone = registry.clone();

        registry.claim_port(2000).await.unwrap();
        assert!(clone.port_taken(2000).await.unwrap());
    }
}
