//! Per-source-address rate limiting
//!
//! A fixed request budget per source IP per fixed time window, enforced ahead
//! of every route. The window resets wholesale when it expires; there is no
//! sliding behavior.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use passage_proto::ErrorResponse;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Rate-limit budget configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window per source address
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(15 * 60),
        }
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// Tracks request counts per source address
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `ip`; false when the budget is exhausted
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let window = windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.config.window {
            window.started = now;
            window.count = 0;
        }

        window.count += 1;
        window.count <= self.config.max_requests
    }
}

/// Middleware enforcing the per-address budget ahead of all routes
///
/// When the server is not serving with connect info (unit tests drive the
/// router directly), all requests share one bucket.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if !limiter.allow(ip) {
        warn!(%ip, "Rate limit exceeded");
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: "Too many requests, please try again later".to_string(),
            }),
        ));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_enforced() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn test_addresses_have_separate_budgets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        });

        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let second: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.allow(first));
        assert!(!limiter.allow(first));
        assert!(limiter.allow(second));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_millis(0),
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.allow(ip));
        // Zero-length window expires immediately, so the budget is fresh
        assert!(limiter.allow(ip));
    }
}
