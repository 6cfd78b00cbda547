use crate::priority;
use async_trait::async_trait;
use axum::response::Response;
use dashmap::DashMap;
use gatehouse_core::config::{RateLimitConfig, RateLimitScope};
use gatehouse_core::error::GatewayError;
use gatehouse_observability::GatewayCounters;
use gatehouse_observability::metrics::MetricsCollector;
use gatehouse_plugin::plugin::{Next, Plugin, PluginContext};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of a bucket admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Token bucket with continuous refill.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_acquire(&mut self, now: Instant) -> Decision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Decision::Allowed;
        }
        let wait = (1.0 - self.tokens) / self.refill_per_sec;
        Decision::Denied {
            retry_after: Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX),
        }
    }
}

/// Keyed token-bucket limiter.
///
/// Each key owns its own bucket behind its own mutex, so traffic on one
/// key never waits on another. Buckets are created full on first use and
/// evicted by [`RateLimiter::sweep`] once idle for `idle_ttl`.
///
/// A request that raced with eviction may consume from the bucket being
/// dropped; the next request for that key then starts from a fresh, full
/// bucket.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    idle_ttl: Duration,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self::with_rate(cfg.burst, cfg.refill_per_sec(), cfg.idle_ttl())
    }

    pub fn with_rate(capacity: u32, refill_per_sec: f64, idle_ttl: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            idle_ttl,
            buckets: DashMap::new(),
        }
    }

    pub fn allow(&self, key: &str) -> Decision {
        self.allow_at(key, Instant::now())
    }

    /// Admission check at an explicit instant.
    pub fn allow_at(&self, key: &str, now: Instant) -> Decision {
        let existing = self.buckets.get(key).map(|b| Arc::clone(b.value()));
        let bucket = existing.unwrap_or_else(|| {
            let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::full(
                    self.capacity,
                    self.refill_per_sec,
                    now,
                )))
            });
            Arc::clone(entry.value())
        });

        let mut guard = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        guard.try_acquire(now)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drop buckets idle for at least `idle_ttl`. Buckets locked by an
    /// in-flight check are skipped. Returns the number evicted.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Ok(b) => now.saturating_duration_since(b.last_refill) < self.idle_ttl,
            Err(_) => true,
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "Rate limiter buckets swept");
        }
        evicted
    }

    /// Number of live buckets.
    pub fn active_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// Bucket key for a request under the given scope.
///
/// `per_user` runs before bearer auth, so until an identity is attached
/// it falls back to the client address.
pub fn scope_key(scope: RateLimitScope, ctx: &PluginContext) -> String {
    match scope {
        RateLimitScope::PerIp => format!("ip:{}", ctx.client_ip),
        RateLimitScope::PerUser => match ctx.user_id() {
            Some(user) => format!("user:{user}"),
            None => format!("ip:{}", ctx.client_ip),
        },
        RateLimitScope::Global => "global".to_string(),
    }
}

/// Admission stage in front of routing and auth.
pub struct RateLimitingPlugin {
    limiter: Arc<RateLimiter>,
    scope: RateLimitScope,
    counters: Arc<GatewayCounters>,
    metrics: Arc<MetricsCollector>,
}

impl RateLimitingPlugin {
    pub fn new(
        limiter: Arc<RateLimiter>,
        scope: RateLimitScope,
        counters: Arc<GatewayCounters>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            limiter,
            scope,
            counters,
            metrics,
        }
    }
}

#[async_trait]
impl Plugin for RateLimitingPlugin {
    fn name(&self) -> &str {
        "rate-limiting"
    }

    fn priority(&self) -> i32 {
        priority::RATE_LIMITING
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response {
        let key = scope_key(self.scope, ctx);
        match self.limiter.allow(&key) {
            Decision::Allowed => next.run(ctx).await,
            Decision::Denied { retry_after } => {
                self.counters.record_rate_limited();
                self.metrics.record_rate_limited(self.scope.as_str());
                debug!(key = %key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
                ctx.fail(GatewayError::RateLimitExceeded { retry_after })
            }
        }
    }
}
