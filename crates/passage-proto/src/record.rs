//! Tunnel record and control-plane request/response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tunnel lifecycle state as stored in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Tunnel is allocated and may carry traffic
    Active,
    /// Tunnel has been deleted; its port and subdomain are released
    Deleted,
}

/// Identity and placement of one tunnel
///
/// `subdomain` and `port` are each unique across all non-deleted records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TunnelRecord {
    /// Unique tunnel identifier
    pub id: String,
    /// Public subdomain allocated to this tunnel
    pub subdomain: String,
    /// Lifecycle state
    pub status: TunnelState,
    /// Creation timestamp
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Publicly bound port for the data plane
    pub port: u16,
}

impl TunnelRecord {
    pub fn is_active(&self) -> bool {
        self.status == TunnelState::Active
    }
}

/// Request body for `POST /api/tunnels`
///
/// `port` is the local port the client wants exposed, not the public port the
/// control plane allocates. Both fields are validated and recorded but do not
/// steer allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateTunnelRequest {
    /// Local port the client wants exposed, 1..=65535
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    /// Desired subdomain, alphanumeric
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

/// Response body for a successful tunnel creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateTunnelResponse {
    #[serde(flatten)]
    pub record: TunnelRecord,
    /// Number of transport connections the client should open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    /// Cached URL, only returned by relays that support resource caching
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_url: Option<String>,
}

/// Error body returned by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    /// Always "ok" while the process is serving requests
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_created_at_in_camel_case() {
        let record = TunnelRecord {
            id: "t-1".to_string(),
            subdomain: "abc123".to_string(),
            status: TunnelState::Active,
            created_at: Utc::now(),
            port: 2000,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["status"], "active");
        assert_eq!(json["port"], 2000);
    }

    #[test]
    fn create_response_flattens_record() {
        let response = CreateTunnelResponse {
            record: TunnelRecord {
                id: "t-2".to_string(),
                subdomain: "xyz789".to_string(),
                status: TunnelState::Active,
                created_at: Utc::now(),
                port: 2001,
            },
            max_connections: Some(4),
            cached_url: None,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["id"], "t-2");
        assert_eq!(json["subdomain"], "xyz789");
        assert_eq!(json["max_connections"], 4);
    }

    #[test]
    fn create_response_omits_absent_max_connections() {
        let response = CreateTunnelResponse {
            record: TunnelRecord {
                id: "t-3".to_string(),
                subdomain: "q".to_string(),
                status: TunnelState::Active,
                created_at: Utc::now(),
                port: 2002,
            },
            max_connections: None,
            cached_url: None,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("max_connections").is_none());
    }
}
