//! Request middleware: bearer auth, rate limiting, security headers

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde_json::json;
use tracing::warn;

use super::AppState;

pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const RATE_LIMIT_AUTH: usize = 5;
pub const RATE_LIMIT_API: usize = 60;

/// Routes reachable without a bearer token
const PUBLIC_PATHS: &[&str] = &["/api/v1/health", "/api/v1/auth/verify"];

/// Compare tokens without leaking a length-dependent early exit
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// In-memory sliding-window rate limiter keyed by client
///
/// Stale keys are dropped opportunistically on each check rather than by a
/// background sweep.
#[derive(Default)]
pub struct RateLimiter {
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the request is allowed
    pub fn check(&self, key: &str, max_requests: usize) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t).as_secs() < RATE_LIMIT_WINDOW_SECS);
        if entry.len() >= max_requests {
            return false;
        }
        entry.push(now);
        drop(entry);

        // Opportunistic cleanup of other stale keys
        self.hits.retain(|_, timestamps| {
            timestamps
                .last()
                .map(|t| now.duration_since(*t).as_secs() < RATE_LIMIT_WINDOW_SECS)
                .unwrap_or(false)
        });
        true
    }
}

fn is_internal_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Real client IP: the first X-Forwarded-For hop, trusted only when the
/// direct peer is an internal reverse proxy
pub fn client_ip(request: &Request<Body>) -> String {
    let direct = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    match (direct, forwarded) {
        (Some(peer), Some(forwarded)) if is_internal_peer(peer) => forwarded,
        (Some(peer), _) => peer.to_string(),
        (None, _) => "unknown".to_string(),
    }
}

fn too_many_requests(detail: &str) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(json!({"detail": detail})),
    )
        .into_response()
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({"detail": detail})),
    )
        .into_response()
}

/// Bearer auth + rate limiting for all /api routes
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // Brute-force protection fires before the public-path skip
    if path == "/api/v1/auth/verify" {
        let ip = client_ip(&request);
        if !state
            .rate_limiter
            .check(&format!("auth:{}", ip), RATE_LIMIT_AUTH)
        {
            warn!("Auth rate limit exceeded for {}", ip);
            return too_many_requests("Too many attempts. Try again later.");
        }
    }

    let auth_active = state.settings.auth_enabled && !state.settings.auth_token.is_empty();
    if !auth_active || PUBLIC_PATHS.contains(&path.as_str()) || !path.starts_with("/api/") {
        return next.run(request).await;
    }

    let ip = client_ip(&request);
    if !state
        .rate_limiter
        .check(&format!("api:{}", ip), RATE_LIMIT_API)
    {
        return too_many_requests("Rate limit exceeded. Try again later.");
    }

    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(token) = header.strip_prefix("Bearer ") else {
        return unauthorized("Authentication required");
    };
    if !constant_time_eq(token, &state.settings.auth_token) {
        return unauthorized("Invalid token");
    }

    next.run(request).await
}

const CSP: &str = "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
font-src 'self'; img-src 'self' data:; connect-src 'self'; frame-ancestors 'none'; \
base-uri 'self'; form-action 'self'";

/// Security headers on every response; HSTS only when the request arrived
/// over HTTPS (directly or behind a terminating proxy)
pub async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response {
    let https = request.uri().scheme_str() == Some("https")
        || request
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            == Some("https");

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    headers.insert("X-XSS-Protection", HeaderValue::from_static("1; mode=block"));
    headers.insert("Content-Security-Policy", HeaderValue::from_static(CSP));
    if https {
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "Secret"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_AUTH {
            assert!(limiter.check("auth:1.2.3.4", RATE_LIMIT_AUTH));
        }
        assert!(!limiter.check("auth:1.2.3.4", RATE_LIMIT_AUTH));
        // Other keys are unaffected
        assert!(limiter.check("auth:5.6.7.8", RATE_LIMIT_AUTH));
    }
}
