//! Control-plane client
//!
//! The session talks to the control plane through the [`ControlPlane`] trait
//! so tests can substitute the transport; [`HttpControlPlane`] is the
//! production implementation.

use crate::options::Credentials;
use crate::TunnelError;
use async_trait::async_trait;
use passage_proto::{CreateTunnelRequest, CreateTunnelResponse};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Boundary to the tunnel-allocation service
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Request a new tunnel allocation
    ///
    /// A 400-class rejection maps to [`TunnelError::Validation`] and must not
    /// be retried; every other failure maps to [`TunnelError::RequestFailed`]
    /// and is retryable.
    async fn create_tunnel(
        &self,
        request: &CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, TunnelError>;
}

/// HTTP implementation of the control-plane boundary
pub struct HttpControlPlane {
    base_url: String,
    credentials: Option<Credentials>,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into(),
            credentials,
            http,
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_tunnel(
        &self,
        request: &CreateTunnelRequest,
    ) -> Result<CreateTunnelResponse, TunnelError> {
        let url = format!("{}/api/tunnels", self.base_url.trim_end_matches('/'));
        debug!(url = %url, "Requesting tunnel creation");

        let mut builder = self.http.post(&url).json(request);
        if let Some(ref credentials) = self.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TunnelError::RequestFailed(format!("control plane unreachable: {e}")))?;

        match response.status() {
            StatusCode::CREATED => response
                .json::<CreateTunnelResponse>()
                .await
                .map_err(|e| TunnelError::RequestFailed(format!("malformed response body: {e}"))),
            StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                Err(TunnelError::Validation(body))
            }
            status => Err(TunnelError::RequestFailed(format!(
                "control plane returned {status}"
            ))),
        }
    }
}
