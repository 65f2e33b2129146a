//! Session configuration

use crate::TunnelError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RELAY_URL: &str = "http://localhost:3000";

/// Shared credential presented to the control plane's access gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// TLS material for reaching the local service over HTTPS
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalTls {
    /// Client certificate presented to the local service
    pub cert_path: Option<PathBuf>,
    /// Private key for the client certificate
    pub key_path: Option<PathBuf>,
    /// Extra CA bundle trusted for the local service
    pub ca_path: Option<PathBuf>,
    /// Skip certificate verification for self-signed local services
    pub allow_invalid_cert: bool,
}

/// Tunnel session configuration
///
/// Defaults are resolved once at construction; the session never consults the
/// environment afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Local port to expose through the tunnel
    pub local_port: u16,
    /// Host the local service listens on
    pub local_host: String,
    /// Desired subdomain, forwarded to the control plane for validation
    pub subdomain: Option<String>,
    /// Control-plane base URL
    pub relay_url: String,
    /// Credential for the control plane's access gate
    pub credentials: Option<Credentials>,
    /// Reach the local service over TLS
    pub local_tls: Option<LocalTls>,
    /// Reconnection attempts before the session is declared failed
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff
    #[serde(with = "duration_millis")]
    pub reconnect_backoff: Duration,
    /// Upper bound on any single reconnect delay
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Period of the connection health check
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
    /// Idle time after which the health check probes pool liveness
    #[serde(with = "duration_millis")]
    pub idle_threshold: Duration,
    /// Fixed delay between retries of a failed tunnel-creation request
    #[serde(with = "duration_millis")]
    pub request_retry_delay: Duration,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            local_port: 0,
            local_host: "localhost".to_string(),
            subdomain: None,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            credentials: None,
            local_tls: None,
            max_reconnect_attempts: 10,
            reconnect_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(300),
            request_retry_delay: Duration::from_secs(1),
        }
    }
}

impl SessionOptions {
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder::default()
    }

    /// Hostname component of the relay URL, used to compose public URLs and
    /// as the transport dial target
    pub fn relay_host(&self) -> &str {
        let without_scheme = self
            .relay_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        without_scheme
            .split(['/', ':'])
            .next()
            .unwrap_or(without_scheme)
    }

    /// Scheme of the relay URL ("http" unless the relay is https)
    pub fn relay_scheme(&self) -> &str {
        if self.relay_url.starts_with("https://") {
            "https"
        } else {
            "http"
        }
    }
}

/// Builder for SessionOptions
#[derive(Default)]
pub struct SessionOptionsBuilder {
    options: SessionOptions,
}

impl SessionOptionsBuilder {
    pub fn local_port(mut self, port: u16) -> Self {
        self.options.local_port = port;
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.options.local_host = host.into();
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.options.subdomain = Some(subdomain.into());
        self
    }

    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.options.relay_url = url.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn local_tls(mut self, tls: LocalTls) -> Self {
        self.options.local_tls = Some(tls);
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.options.reconnect_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.options.max_backoff = cap;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.options.health_check_interval = interval;
        self
    }

    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.options.idle_threshold = threshold;
        self
    }

    pub fn request_retry_delay(mut self, delay: Duration) -> Self {
        self.options.request_retry_delay = delay;
        self
    }

    pub fn build(self) -> Result<SessionOptions, TunnelError> {
        if self.options.local_port == 0 {
            return Err(TunnelError::InvalidOptions(
                "local_port is required".to_string(),
            ));
        }
        if self.options.relay_url.is_empty() {
            return Err(TunnelError::InvalidOptions(
                "relay_url must not be empty".to_string(),
            ));
        }
        if let Some(ref subdomain) = self.options.subdomain {
            if subdomain.is_empty() || !subdomain.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(TunnelError::InvalidOptions(
                    "subdomain must be alphanumeric".to_string(),
                ));
            }
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_local_port() {
        let result = SessionOptions::builder().build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let options = SessionOptions::builder().local_port(8080).build().unwrap();

        assert_eq!(options.local_host, "localhost");
        assert_eq!(options.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(options.max_reconnect_attempts, 10);
        assert_eq!(options.reconnect_backoff, Duration::from_secs(1));
        assert_eq!(options.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_rejects_bad_subdomain() {
        let result = SessionOptions::builder()
            .local_port(8080)
            .subdomain("my-app")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_relay_host_parsing() {
        let options = SessionOptions::builder()
            .local_port(8080)
            .relay_url("https://relay.example.com:3000/api")
            .build()
            .unwrap();

        assert_eq!(options.relay_host(), "relay.example.com");
        assert_eq!(options.relay_scheme(), "https");

        let options = SessionOptions::builder()
            .local_port(8080)
            .relay_url("http://localhost:3000")
            .build()
            .unwrap();

        assert_eq!(options.relay_host(), "localhost");
        assert_eq!(options.relay_scheme(), "http");
    }
}
