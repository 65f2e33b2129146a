//! Data-plane proxy
//!
//! Materializes one public TCP listener per active tunnel and bridges each
//! inbound connection to the tunnel's local endpoint. Listeners are created
//! from startup recovery (the registry's active set) and from runtime
//! creation notifications.

pub mod server;

pub use server::{ProxyConfig, ProxyError, ProxyServer};
