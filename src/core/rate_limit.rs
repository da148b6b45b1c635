//! Token-bucket rate limiting at three scopes.
//!
//! Evaluation order is global, then per-route, then per-client-IP; all
//! three buckets must admit a request, and a rejection at an earlier scope
//! leaves the later buckets unconsulted and uncharged. The per-IP map is
//! LRU-bounded so an unbounded client fanout cannot grow process memory.

use std::{
    collections::HashMap,
    net::IpAddr,
    num::NonZeroUsize,
    sync::Mutex,
    time::Instant,
};

use axum::body::Body;
use hyper::{Response, StatusCode, header};
use lru::LruCache;

use crate::{config::models::GatewayConfig, metrics};

/// A continuously-refilling token bucket. One token is consumed per
/// request; refill happens lazily on each check from a monotonic clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `rate_qps` tokens per second, with burst headroom of
    /// `rate_qps * burst_multiplier`.
    pub fn new(rate_qps: f64, burst_multiplier: f64) -> Self {
        let capacity = rate_qps * burst_multiplier;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: rate_qps,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one full token is available again. Only meaningful
    /// right after a failed acquire.
    pub fn retry_after_secs(&self) -> u64 {
        ((1.0 - self.tokens) / self.refill_rate).ceil() as u64
    }

    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    #[cfg(test)]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// The scope whose bucket rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Global,
    Route,
    Ip,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Route => "route",
            Self::Ip => "ip",
        }
    }
}

/// A denied request, with the scope that tripped and its retry hint.
#[derive(Debug, Clone, Copy)]
pub struct RateDenied {
    pub scope: RateScope,
    pub retry_after_secs: u64,
}

/// The rate limit plugin state: one global bucket, a bucket per route id,
/// and an LRU-bounded bucket per client IP.
pub struct RateLimitPlugin {
    enabled: bool,
    route_qps: f64,
    ip_qps: f64,
    burst_multiplier: f64,
    global: Mutex<TokenBucket>,
    per_route: Mutex<HashMap<String, TokenBucket>>,
    per_ip: Mutex<LruCache<IpAddr, TokenBucket>>,
}

impl RateLimitPlugin {
    pub fn new(config: &GatewayConfig) -> Self {
        let capacity = NonZeroUsize::new(config.rate_limit_ip_map_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: config.rate_limit_enabled,
            route_qps: config.rate_limit_per_route_qps,
            ip_qps: config.rate_limit_per_ip_qps,
            burst_multiplier: config.rate_limit_burst_multiplier,
            global: Mutex::new(TokenBucket::new(
                config.rate_limit_global_qps,
                config.rate_limit_burst_multiplier,
            )),
            per_route: Mutex::new(HashMap::new()),
            per_ip: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Check all three scopes in order. A poisoned lock fails open: a
    /// limiter malfunction must not take the data plane down with it.
    pub fn allow(&self, route_id: &str, client_ip: Option<IpAddr>) -> Result<(), RateDenied> {
        let now = Instant::now();

        match self.global.lock() {
            Ok(mut bucket) => {
                if !bucket.try_acquire(now) {
                    return Err(RateDenied {
                        scope: RateScope::Global,
                        retry_after_secs: bucket.retry_after_secs(),
                    });
                }
            }
            Err(e) => tracing::error!(error = %e, "global rate limit lock poisoned"),
        }

        match self.per_route.lock() {
            Ok(mut buckets) => {
                let bucket = buckets
                    .entry(route_id.to_string())
                    .or_insert_with(|| TokenBucket::new(self.route_qps, self.burst_multiplier));
                if !bucket.try_acquire(now) {
                    return Err(RateDenied {
                        scope: RateScope::Route,
                        retry_after_secs: bucket.retry_after_secs(),
                    });
                }
            }
            Err(e) => tracing::error!(error = %e, "route rate limit lock poisoned"),
        }

        if let Some(ip) = client_ip {
            match self.per_ip.lock() {
                Ok(mut buckets) => {
                    // Insertion at capacity evicts the least recently used
                    // IP; a re-inserted key restarts at full capacity.
                    let bucket = buckets.get_or_insert_mut(ip, || {
                        TokenBucket::new(self.ip_qps, self.burst_multiplier)
                    });
                    if !bucket.try_acquire(now) {
                        return Err(RateDenied {
                            scope: RateScope::Ip,
                            retry_after_secs: bucket.retry_after_secs(),
                        });
                    }
                }
                Err(e) => tracing::error!(error = %e, "ip rate limit lock poisoned"),
            }
        }

        Ok(())
    }

    pub fn deny_response(denied: &RateDenied) -> Response<Body> {
        metrics::increment_rate_limited(denied.scope.as_str());
        let body = serde_json::json!({
            "error": "rate_limited",
            "scope": denied.scope.as_str(),
        });
        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::RETRY_AFTER, denied.retry_after_secs.to_string())
            .header("X-RateLimit-Scope", denied.scope.as_str())
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from(body.to_string())))
    }

    #[cfg(test)]
    pub fn tracked_ip_count(&self) -> usize {
        self.per_ip.lock().map(|m| m.len()).unwrap_or(0)
    }
}
