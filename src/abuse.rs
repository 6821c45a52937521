//! Rate limiting for participant writes
//!
//! Joins and votes are limited per identity rather than per IP: a whole
//! audience usually shares one venue network.

use axum::{
    body::{self, Body},
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

/// Largest request body the limiter will buffer
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Fixed-window request counter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Key -> (request count, window start)
    requests: Arc<RwLock<HashMap<String, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(10))
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true if the request is allowed
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.write().await;

        let Some((count, window_start)) = requests.get_mut(key) else {
            requests.insert(key.to_string(), (1, now));
            return true;
        };

        if now.duration_since(*window_start) >= self.window {
            *count = 1;
            *window_start = now;
            true
        } else if *count >= self.max_requests {
            false
        } else {
            *count += 1;
            true
        }
    }

    /// Drop entries whose window is long gone
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
    }

    pub async fn tracked_keys(&self) -> usize {
        self.requests.read().await.len()
    }
}

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// Rate limiter (None = disabled)
    pub rate_limiter: Option<RateLimiter>,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            rate_limiter: Some(RateLimiter::default()),
        }
    }
}

impl AbuseConfig {
    pub fn disabled() -> Self {
        Self { rate_limiter: None }
    }

    /// Load config from environment variables
    pub fn from_env() -> Self {
        let rate_limit_enabled = std::env::var("ABUSE_RATE_LIMIT")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let rate_limiter = rate_limit_enabled.then(|| {
            let max_requests = std::env::var("ABUSE_RATE_LIMIT_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20);
            let window_secs = std::env::var("ABUSE_RATE_LIMIT_WINDOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10);
            RateLimiter::new(max_requests, Duration::from_secs(window_secs))
        });

        tracing::info!(rate_limit_enabled, "Anti-abuse config loaded");
        Self { rate_limiter }
    }
}

/// Fields that identify who is writing
#[derive(Debug, Deserialize)]
struct WriterIdentity {
    identity_token: Option<String>,
    participant_id: Option<String>,
}

/// Derive the limiter key from a JSON request body.
/// Bodies without an identity are not limited here.
fn rate_limit_key(body: &[u8]) -> Option<String> {
    let writer: WriterIdentity = serde_json::from_slice(body).ok()?;
    writer
        .identity_token
        .map(|token| format!("identity:{}", token))
        .or_else(|| writer.participant_id.map(|id| format!("participant:{}", id)))
}

fn rate_limited(window: Duration) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, window.as_secs().max(1).to_string())],
        "Rate limit exceeded. Please slow down.",
    )
        .into_response()
}

/// Middleware limiting joins and votes per writer identity
pub async fn rate_limit_middleware(
    State(config): State<Arc<AbuseConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(rate_limiter) = &config.rate_limiter else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let bytes = match body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected oversized request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    if let Some(key) = rate_limit_key(&bytes) {
        if !rate_limiter.check(&key).await {
            tracing::warn!(key, "Rate limited");
            return rate_limited(rate_limiter.window());
        }
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_key() {
        assert_eq!(
            rate_limit_key(br#"{"identity_token":"abc","participant_name":"Ada"}"#),
            Some("identity:abc".to_string())
        );
        assert_eq!(
            rate_limit_key(br#"{"participant_id":"p1","text":"hi"}"#),
            Some("participant:p1".to_string())
        );
        assert_eq!(rate_limit_key(br#"{"text":"hi"}"#), None);
        assert_eq!(rate_limit_key(b"not json"), None);
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_normal_traffic() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        for _ in 0..5 {
            assert!(limiter.check("test-key").await);
        }
        assert!(!limiter.check("test-key").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_different_keys() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));

        assert!(limiter.check("key1").await);
        assert!(limiter.check("key1").await);
        assert!(!limiter.check("key1").await);

        assert!(limiter.check("key2").await);
        assert!(limiter.check("key2").await);
        assert!(!limiter.check("key2").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_window_reset_and_cleanup() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));

        assert!(limiter.check("key").await);
        assert!(limiter.check("key").await);
        assert!(!limiter.check("key").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check("key").await);

        tokio::time::sleep(Duration::from_millis(110)).await;
        limiter.cleanup().await;
        assert_eq!(limiter.tracked_keys().await, 0);
    }

    #[test]
    fn test_abuse_config_default() {
        assert!(AbuseConfig::default().rate_limiter.is_some());
        assert!(AbuseConfig::disabled().rate_limiter.is_none());
    }
}
