//! Shared wire types for the passage control and data planes

pub mod record;
pub mod validate;

pub use record::{
    CreateTunnelRequest, CreateTunnelResponse, ErrorResponse, HealthResponse, TunnelRecord,
    TunnelState,
};
pub use validate::{validate_create_request, ValidationErrorResponse, ValidationIssue};
