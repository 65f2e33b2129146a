//! Control-plane HTTP service
//!
//! Stateless-per-request API backed by the shared registry: allocates tunnel
//! id/subdomain/port, persists records, and republishes creation events for
//! data-plane proxies.

pub mod handlers;
pub mod manager;
pub mod middleware;

pub use manager::{AllocationError, ControlError, TunnelManager};

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use passage_registry::{CreationBus, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use middleware::{CredentialGate, RateLimitConfig, RateLimiter};

/// Application state shared across handlers
pub struct AppState {
    pub manager: TunnelManager,
    /// Pool size advertised to clients in create responses
    pub max_connections: Option<u32>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Passage API",
        version = "0.1.0",
        description = "REST API for allocating and managing tunnels",
        contact(
            name = "Passage Team",
            email = "team@passage.dev"
        )
    ),
    paths(
        handlers::create_tunnel,
        handlers::get_tunnel,
        handlers::delete_tunnel,
        handlers::health_check,
    ),
    components(
        schemas(
            passage_proto::TunnelRecord,
            passage_proto::TunnelState,
            passage_proto::CreateTunnelRequest,
            passage_proto::CreateTunnelResponse,
            passage_proto::ErrorResponse,
            passage_proto::HealthResponse,
            passage_proto::ValidationIssue,
            passage_proto::ValidationErrorResponse,
        )
    ),
    tags(
        (name = "tunnels", description = "Tunnel allocation endpoints"),
        (name = "system", description = "System health endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Shared credential for the access gate; the gate is disabled when unset
    pub credentials: Option<(String, String)>,
    /// Per-address request budget
    pub rate_limit: RateLimitConfig,
    /// First public port handed out by the allocator
    pub base_port: u16,
    /// Pool size advertised to clients
    pub max_connections: Option<u32>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            credentials: None,
            rate_limit: RateLimitConfig::default(),
            base_port: 2000,
            max_connections: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
    limiter: Arc<RateLimiter>,
    gate: Option<Arc<CredentialGate>>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, registry: Arc<dyn Registry>, events: CreationBus) -> Self {
        let manager = TunnelManager::new(registry, events).with_base_port(config.base_port);
        let state = Arc::new(AppState {
            manager,
            max_connections: config.max_connections,
        });
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let gate = config
            .credentials
            .as_ref()
            .map(|(username, password)| Arc::new(CredentialGate::new(username, password)));

        Self {
            config,
            state,
            limiter,
            gate,
        }
    }

    /// Build the router with all routes and middleware
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let mut api_router = Router::new()
            .route("/api/tunnels", post(handlers::create_tunnel))
            .route(
                "/api/tunnels/{id}",
                get(handlers::get_tunnel).delete(handlers::delete_tunnel),
            )
            .route("/health", get(handlers::health_check))
            .with_state(self.state.clone());

        // Credential gate wraps every route; the rate limiter layers outside
        // it so the budget is spent before credentials are checked
        if let Some(ref gate) = self.gate {
            api_router = api_router.layer(axum_middleware::from_fn_with_state(
                gate.clone(),
                middleware::require_credential,
            ));
        }
        api_router = api_router.layer(axum_middleware::from_fn_with_state(
            self.limiter.clone(),
            middleware::rate_limit,
        ));

        Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(api_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let _api_doc = ApiDoc::openapi();
    }
}
