//! Fixed-window rate limiting keyed by client address.
//!
//! Each client gets a counter at `rate_limit:<client>`. The first increment in
//! a window sets the counter's expiry, so the window is anchored at the first
//! request and never extended. A denied client whose counter has lost its
//! expiry gets a fresh window set. When the counting backend fails, requests
//! are admitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use taskhub_api::ApiError;
use taskhub_core::Deadline;

use crate::cache::CacheBackend;
use crate::cache::backend::bounded;
use crate::config::RateLimitConfig;
use crate::metrics;

/// Counter key for a client identity.
pub fn rate_limit_key(client: &str) -> String {
    format!("rate_limit:{client}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { count: i64 },
    Denied { count: i64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

pub struct RateLimiter {
    cache: Arc<dyn CacheBackend>,
    max_requests: i64,
    window: Duration,
    /// Upper bound on the backend round-trips of one check
    check_timeout: Duration,
    trust_forwarded_for: bool,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheBackend>, config: &RateLimitConfig) -> Self {
        Self {
            cache,
            max_requests: i64::from(config.max_requests),
            window: Duration::from_secs(config.window_secs),
            check_timeout: Duration::from_secs(1),
            trust_forwarded_for: false,
        }
    }

    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub async fn admit(&self, client: &str) -> Admission {
        let cx = Deadline::after(self.check_timeout);
        let key = rate_limit_key(client);

        let count = match bounded(&cx, self.cache.increment(&key)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "rate limit counter unavailable, admitting request");
                metrics::record_cache_error("increment");
                return Admission::Allowed { count: 0 };
            }
        };

        let needs_window =
            count == 1 || (count > self.max_requests && self.window_missing(&cx, &key).await);
        if needs_window
            && let Err(e) = bounded(&cx, self.cache.expire(&key, self.window)).await
        {
            tracing::warn!(key = %key, error = %e, "failed to set rate limit window");
            metrics::record_cache_error("expire");
        }

        if count > self.max_requests {
            Admission::Denied { count }
        } else {
            Admission::Allowed { count }
        }
    }

    // A counter left without expiry would deny its client forever.
    async fn window_missing(&self, cx: &Deadline, key: &str) -> bool {
        match bounded(cx, self.cache.ttl(key)).await {
            Ok(ttl) => ttl.is_none(),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "could not read rate limit window");
                false
            }
        }
    }

    /// Peer IP, or the first `X-Forwarded-For` hop when trusted.
    pub fn client_identity(&self, request: &Request) -> String {
        if self.trust_forwarded_for
            && let Some(first) = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        {
            return first.to_string();
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Rate limiting middleware. Denied requests get 429.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = limiter.client_identity(&request);
    let admission = limiter.admit(&client).await;
    metrics::record_rate_limit_decision(admission.is_allowed());

    match admission {
        Admission::Allowed { .. } => next.run(request).await,
        Admission::Denied { count } => {
            tracing::info!(client = %client, count, "rate limit exceeded");
            ApiError::too_many_requests("rate limit exceeded").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use axum::body::Body;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(LocalCache::new()),
            &RateLimitConfig {
                enabled: true,
                max_requests,
                window_secs: 60,
            },
        )
    }

    #[test]
    fn key_format() {
        assert_eq!(rate_limit_key("10.0.0.1"), "rate_limit:10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn counts_per_client() {
        let limiter = limiter(2);
        assert_eq!(limiter.admit("a").await, Admission::Allowed { count: 1 });
        assert_eq!(limiter.admit("a").await, Admission::Allowed { count: 2 });
        assert_eq!(limiter.admit("a").await, Admission::Denied { count: 3 });
        assert_eq!(limiter.admit("b").await, Admission::Allowed { count: 1 });
    }

    #[test]
    fn identity_falls_back_to_unknown() {
        let limiter = limiter(1);
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(limiter.client_identity(&request), "unknown");
    }

    #[test]
    fn identity_uses_peer_address() {
        let limiter = limiter(1).trust_forwarded_for(false);
        let mut request = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(limiter.client_identity(&request), "192.0.2.1");
    }

    #[test]
    fn identity_prefers_first_forwarded_hop_when_trusted() {
        let limiter = limiter(1).trust_forwarded_for(true);
        let request = Request::builder()
            .uri("/")
            .header("x-forwarded-for", " 203.0.113.9, 10.0.0.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(limiter.client_identity(&request), "203.0.113.9");
    }
}
