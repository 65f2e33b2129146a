//! Validation of client-supplied tunnel parameters

use crate::record::CreateTunnelRequest;
use serde::{Deserialize, Serialize};

/// One field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ValidationIssue {
    /// Offending field name
    pub field: String,
    /// What was wrong with it
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

/// 400 body carrying every validation failure found in a request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ValidationErrorResponse {
    pub errors: Vec<ValidationIssue>,
}

/// Validate a tunnel-creation request body
///
/// Returns every issue found rather than stopping at the first, so the caller
/// can surface the full list in a 400 response.
pub fn validate_create_request(request: &CreateTunnelRequest) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if let Some(port) = request.port {
        if port < 1 || port > 65535 {
            issues.push(ValidationIssue::new("port", "must be between 1 and 65535"));
        }
    }

    if let Some(ref subdomain) = request.subdomain {
        if subdomain.is_empty() || !subdomain.chars().all(|c| c.is_ascii_alphanumeric()) {
            issues.push(ValidationIssue::new("subdomain", "must be alphanumeric"));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_is_valid() {
        let issues = validate_create_request(&CreateTunnelRequest::default());
        assert!(issues.is_empty());
    }

    #[test]
    fn port_range_is_enforced() {
        let request = CreateTunnelRequest {
            port: Some(0),
            subdomain: None,
        };
        let issues = validate_create_request(&request);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "port");

        let request = CreateTunnelRequest {
            port: Some(70000),
            subdomain: None,
        };
        assert_eq!(validate_create_request(&request).len(), 1);

        let request = CreateTunnelRequest {
            port: Some(8080),
            subdomain: None,
        };
        assert!(validate_create_request(&request).is_empty());
    }

    #[test]
    fn subdomain_must_be_alphanumeric() {
        for bad in ["", "my-app", "my app", "app!"] {
            let request = CreateTunnelRequest {
                port: None,
                subdomain: Some(bad.to_string()),
            };
            assert_eq!(validate_create_request(&request).len(), 1, "{bad:?}");
        }

        let request = CreateTunnelRequest {
            port: None,
            subdomain: Some("myapp123".to_string()),
        };
        assert!(validate_create_request(&request).is_empty());
    }

    #[test]
    fn issues_accumulate() {
        let request = CreateTunnelRequest {
            port: Some(0),
            subdomain: Some("bad domain".to_string()),
        };
        assert_eq!(validate_create_request(&request).len(), 2);
    }
}
