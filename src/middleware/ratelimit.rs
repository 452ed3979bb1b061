//! Per-client token-bucket rate limiting
//!
//! One bucket per client IP: capacity and per-minute rate come from the
//! request's policy snapshot, so a hot reload retunes admission without
//! dropping accumulated bucket state. Refill is computed lazily on access.
//! A background sweeper drops buckets idle for an hour.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::{HeaderMap, Request, Response, StatusCode};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::middleware::{text_response, Middleware, Next, PipelineBody, RequestContext};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
pub const BUCKET_RETENTION: Duration = Duration::from_secs(3600);

struct ClientBucket {
    tokens: f64,
    last_update: Instant,
}

pub struct RateLimiter {
    buckets: Arc<DashMap<String, ClientBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Start the background sweeper that garbage-collects idle buckets
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let buckets = self.buckets.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                buckets.retain(|_, bucket| bucket.last_update.elapsed() < BUCKET_RETENTION);
            }
        })
    }

    /// Refill the client's bucket and try to take one token. The bucket
    /// entry lock makes per-IP accesses linearizable.
    fn try_admit(&self, ip: &str, settings: &RateLimitConfig) -> bool {
        let rpm = settings.requests_per_minute;
        let (rate, burst) = if rpm <= 0 {
            // Rejected by validation; tolerated here with a safe minimum
            warn!(requests_per_minute = rpm, "Non-positive rate limit, using 1 rps");
            (1.0, 1.0)
        } else {
            (rpm as f64 / 60.0, rpm as f64)
        };

        let mut bucket = self
            .buckets
            .entry(ip.to_string())
            .or_insert_with(|| ClientBucket {
                tokens: burst,
                last_update: Instant::now(),
            });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl Middleware for RateLimiter {
    async fn handle(
        &self,
        req: Request<PipelineBody>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Response<Bytes> {
        let security = &ctx.policy.config.security;
        if !security.rate_limit.enabled {
            return next.run(req, ctx).await;
        }

        let ip = client_ip(req.headers(), ctx.client_addr, security.trust_proxy_headers);
        if self.try_admit(&ip, &security.rate_limit) {
            next.run(req, ctx).await
        } else {
            warn!(client_ip = %ip, "Rate limit exceeded");
            let mut response = text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("60"));
            response
        }
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }
}

/// Extract the client identity: first non-empty `X-Forwarded-For` token,
/// then `X-Real-IP`, then the peer socket address. Forwarded headers are
/// only believed when `trust_proxy_headers` is set.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(xff) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = xff.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }

        if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if !xri.is_empty() {
                return xri.to_string();
            }
        }
    }

    peer.ip().to_string()
}
