//! Default TCP connection pool
//!
//! Opens plain TCP connections to the relay and splices each one to the local
//! service, reporting lifecycle and traffic events per the pool contract. The
//! local leg can run over TLS when the local service speaks HTTPS.

use crate::events::RequestInfo;
use crate::options::LocalTls;
use crate::pool::{
    ConnectionPool, PlacementDescriptor, PoolEvent, PoolFactory, TransportErrorKind,
};
use crate::TunnelError;
use async_trait::async_trait;
use chrono::Utc;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// TCP implementation of the [`ConnectionPool`] contract
pub struct TcpConnectionPool {
    descriptor: PlacementDescriptor,
    events: mpsc::Sender<PoolEvent>,
    live: Arc<AtomicUsize>,
    opened: Arc<AtomicBool>,
    generation: CancellationToken,
}

impl TcpConnectionPool {
    pub fn new(descriptor: PlacementDescriptor, events: mpsc::Sender<PoolEvent>) -> Self {
        Self {
            descriptor,
            events,
            live: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicBool::new(false)),
            generation: CancellationToken::new(),
        }
    }

    async fn run_connection(
        descriptor: PlacementDescriptor,
        events: mpsc::Sender<PoolEvent>,
        live: Arc<AtomicUsize>,
        opened: Arc<AtomicBool>,
        generation: CancellationToken,
    ) {
        let remote_addr = format!("{}:{}", descriptor.remote_host, descriptor.remote_port);
        let remote = match TcpStream::connect(&remote_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to relay at {}: {}", remote_addr, e);
                let _ = events
                    .send(PoolEvent::TransportError {
                        kind: TransportErrorKind::classify(&e),
                        message: format!("relay connect failed: {e}"),
                    })
                    .await;
                return;
            }
        };

        live.fetch_add(1, Ordering::SeqCst);
        if !opened.swap(true, Ordering::SeqCst) {
            let _ = events.send(PoolEvent::Opened).await;
        }

        let local = match connect_local(&descriptor).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Failed to connect to local service at {}:{}: {}",
                    descriptor.local_host, descriptor.local_port, e
                );
                let _ = events
                    .send(PoolEvent::TransportError {
                        kind: TransportErrorKind::Other,
                        message: e.to_string(),
                    })
                    .await;
                live.fetch_sub(1, Ordering::SeqCst);
                if !generation.is_cancelled() {
                    let _ = events.send(PoolEvent::Dead).await;
                }
                return;
            }
        };

        let result = splice(remote, local, &events, &generation).await;

        live.fetch_sub(1, Ordering::SeqCst);
        if generation.is_cancelled() {
            return;
        }

        if let Err(e) = result {
            let _ = events
                .send(PoolEvent::TransportError {
                    kind: TransportErrorKind::classify(&e),
                    message: e.to_string(),
                })
                .await;
        }
        let _ = events.send(PoolEvent::Dead).await;
    }
}

#[async_trait]
impl ConnectionPool for TcpConnectionPool {
    async fn open(&self) -> Result<(), TunnelError> {
        if self.generation.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        debug!(
            remote = %self.descriptor.remote_host,
            port = self.descriptor.remote_port,
            "Opening transport connection"
        );
        tokio::spawn(Self::run_connection(
            self.descriptor.clone(),
            self.events.clone(),
            self.live.clone(),
            self.opened.clone(),
            self.generation.clone(),
        ));
        Ok(())
    }

    fn connection_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.generation.cancel();
    }
}

/// Builds [`TcpConnectionPool`] generations
pub struct TcpPoolFactory;

impl PoolFactory for TcpPoolFactory {
    fn build(
        &self,
        descriptor: PlacementDescriptor,
        events: mpsc::Sender<PoolEvent>,
    ) -> Arc<dyn ConnectionPool> {
        Arc::new(TcpConnectionPool::new(descriptor, events))
    }
}

async fn connect_local(
    descriptor: &PlacementDescriptor,
) -> Result<Box<dyn AsyncStream>, TunnelError> {
    let local_addr = format!("{}:{}", descriptor.local_host, descriptor.local_port);
    let stream = TcpStream::connect(&local_addr)
        .await
        .map_err(|e| TunnelError::Transport(format!("local connect failed: {e}")))?;

    match descriptor.local_tls {
        None => Ok(Box::new(stream)),
        Some(ref tls) => {
            let connector = build_tls_connector(tls)?;
            let server_name = rustls::pki_types::ServerName::try_from(
                descriptor.local_host.clone(),
            )
            .map_err(|e| TunnelError::Transport(format!("invalid local host name: {e}")))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| TunnelError::Transport(format!("local TLS handshake failed: {e}")))?;
            Ok(Box::new(tls_stream))
        }
    }
}

fn build_tls_connector(tls: &LocalTls) -> Result<tokio_rustls::TlsConnector, TunnelError> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    match tls.ca_path {
        Some(ref ca_path) => {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TunnelError::Transport(format!("invalid CA cert: {e}")))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = if tls.allow_invalid_cert {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
    } else {
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match (tls.cert_path.as_ref(), tls.key_path.as_ref()) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TunnelError::Transport(format!("invalid client cert: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Transport(format!("failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Transport(format!("failed to parse certs: {e}")))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Transport(format!("failed to open key file: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::Transport(format!("failed to parse key: {e}")))?
        .ok_or_else(|| TunnelError::Transport("no private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

/// Splice relay and local streams until either side closes
///
/// Relay-to-local chunks are scanned for HTTP request lines so the pool can
/// report traffic to its owner.
async fn splice(
    remote: TcpStream,
    local: Box<dyn AsyncStream>,
    events: &mpsc::Sender<PoolEvent>,
    generation: &CancellationToken,
) -> std::io::Result<()> {
    let (mut remote_read, mut remote_write) = remote.into_split();
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let relay_to_local = async {
        let mut buffer = vec![0u8; 8192];
        loop {
            let n = remote_read.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            if let Some(info) = parse_request_line(&buffer[..n]) {
                let _ = events.send(PoolEvent::Request(info)).await;
            }
            local_write.write_all(&buffer[..n]).await?;
        }
        local_write.shutdown().await?;
        Ok::<(), std::io::Error>(())
    };

    let local_to_relay = async {
        let mut buffer = vec![0u8; 8192];
        loop {
            let n = local_read.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            remote_write.write_all(&buffer[..n]).await?;
        }
        remote_write.shutdown().await?;
        Ok::<(), std::io::Error>(())
    };

    tokio::select! {
        _ = generation.cancelled() => Ok(()),
        result = async { tokio::try_join!(relay_to_local, local_to_relay) } => result.map(|_| ()),
    }
}

/// Parse an HTTP request line from the start of a chunk, if one is there
fn parse_request_line(data: &[u8]) -> Option<RequestInfo> {
    const METHODS: &[&str] = &[
        "GET ", "POST ", "PUT ", "DELETE ", "PATCH ", "HEAD ", "OPTIONS ",
    ];
    let starts_with_method = METHODS.iter().any(|m| data.starts_with(m.as_bytes()));
    if !starts_with_method {
        return None;
    }

    let line_end = data.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&data[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    Some(RequestInfo {
        id: uuid::Uuid::new_v4().to_string(),
        method,
        path,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let info = parse_request_line(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(info.method, "GET");
        assert_eq!(info.path, "/index.html");
    }

    #[test]
    fn test_parse_request_line_rejects_non_http() {
        assert!(parse_request_line(b"\x16\x03\x01\x02\x00").is_none());
        assert!(parse_request_line(b"GETX /\r\n").is_none());
        assert!(parse_request_line(b"GET /incomplete").is_none());
    }

    #[tokio::test]
    async fn test_pool_starts_with_zero_connections() {
        let (tx, _rx) = mpsc::channel(8);
        let descriptor = PlacementDescriptor {
            remote_host: "localhost".to_string(),
            remote_port: 1,
            local_host: "localhost".to_string(),
            local_port: 1,
            local_tls: None,
            max_connections: 1,
        };
        let pool = TcpConnectionPool::new(descriptor, tx);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_open_after_close_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let descriptor = PlacementDescriptor {
            remote_host: "localhost".to_string(),
            remote_port: 1,
            local_host: "localhost".to_string(),
            local_port: 1,
            local_tls: None,
            max_connections: 1,
        };
        let pool = TcpConnectionPool::new(descriptor, tx);
        pool.close().await;
        assert!(pool.open().await.is_err());
    }
}
