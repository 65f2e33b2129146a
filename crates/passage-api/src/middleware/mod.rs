pub mod auth;
pub mod rate_limit;

pub use auth::{require_credential, CredentialGate};
pub use rate_limit::{rate_limit, RateLimitConfig, RateLimiter};
