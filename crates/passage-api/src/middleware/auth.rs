//! Shared-credential access gate
//!
//! A single HTTP Basic credential in front of all routes. This is a
//! pass-through gate, not a user system: one configured username/password
//! pair, checked on every request.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use passage_proto::ErrorResponse;
use std::sync::Arc;

const CHALLENGE: (header::HeaderName, &str) = (header::WWW_AUTHENTICATE, "Basic realm=\"passage\"");

/// The configured credential, held as the exact header value it must match
pub struct CredentialGate {
    expected: String,
}

impl CredentialGate {
    pub fn new(username: &str, password: &str) -> Self {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        Self {
            expected: format!("Basic {encoded}"),
        }
    }

    fn matches(&self, header_value: &str) -> bool {
        header_value == self.expected
    }
}

type Unauthorized = (
    StatusCode,
    [(header::HeaderName, &'static str); 1],
    Json<ErrorResponse>,
);

fn unauthorized(message: &str) -> Unauthorized {
    (
        StatusCode::UNAUTHORIZED,
        [CHALLENGE],
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

/// Middleware checking the shared credential on every request
pub async fn require_credential(
    State(gate): State<Arc<CredentialGate>>,
    request: Request,
    next: Next,
) -> Result<Response, Unauthorized> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| unauthorized("Missing credentials"))?;

    if !gate.matches(header_value) {
        return Err(unauthorized("Invalid credentials"));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_matches_exact_credential() {
        let gate = CredentialGate::new("admin", "changeme");
        // base64("admin:changeme")
        assert!(gate.matches("Basic YWRtaW46Y2hhbmdlbWU="));
        assert!(!gate.matches("Basic YWRtaW46d3Jvbmc="));
        assert!(!gate.matches("Bearer token"));
    }
}
