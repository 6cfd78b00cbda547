use crate::priority;
use async_trait::async_trait;
use axum::response::Response;
use dashmap::DashMap;
use gatehouse_core::config::CircuitBreakerConfig;
use gatehouse_core::error::GatewayError;
use gatehouse_observability::GatewayCounters;
use gatehouse_observability::metrics::MetricsCollector;
use gatehouse_plugin::plugin::{Next, Plugin, PluginContext, UpstreamOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Value of the `circuit_breaker_state` gauge.
    pub fn gauge_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    /// Legal transitions: closed→open, open→half-open, half-open→closed,
    /// half-open→open.
    pub fn can_transition_to(self, next: CircuitState) -> bool {
        matches!(
            (self, next),
            (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::Open, CircuitState::HalfOpen)
                | (CircuitState::HalfOpen, CircuitState::Closed)
                | (CircuitState::HalfOpen, CircuitState::Open)
        )
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub secs_since_transition: u64,
}

/// Breaker state for one service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    cfg: Arc<CircuitBreakerConfig>,

    state: CircuitState,
    /// Bumped on every transition; results from an older generation are ignored.
    generation: u64,
    last_transition: Instant,

    // Closed
    window_start: Instant,
    successes: u32,
    failures: u32,

    // Open
    opened_at: Option<Instant>,

    // HalfOpen
    half_open_admitted: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, cfg: Arc<CircuitBreakerConfig>, now: Instant) -> Self {
        Self {
            service: service.into(),
            cfg,
            state: CircuitState::Closed,
            generation: 0,
            last_transition: now,
            window_start: now,
            successes: 0,
            failures: 0,
            opened_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            secs_since_transition: now.saturating_duration_since(self.last_transition).as_secs(),
        }
    }

    /// Decide whether a request may start. Returns the generation the
    /// request was admitted under.
    fn try_admit(&mut self, now: Instant) -> Option<u64> {
        match self.state {
            CircuitState::Closed => Some(self.generation),
            CircuitState::Open => {
                let opened_at = self.opened_at?;
                if now.saturating_duration_since(opened_at) < self.cfg.timeout() {
                    return None;
                }
                self.transition(CircuitState::HalfOpen, now, "timeout_elapsed");
                self.try_admit(now)
            }
            CircuitState::HalfOpen => {
                if self.half_open_admitted < self.cfg.max_requests {
                    self.half_open_admitted += 1;
                    Some(self.generation)
                } else {
                    None
                }
            }
        }
    }

    fn on_result(&mut self, generation: u64, success: bool, now: Instant) {
        if generation != self.generation {
            return;
        }
        match self.state {
            CircuitState::Closed => {
                if now.saturating_duration_since(self.window_start) >= self.cfg.interval() {
                    self.reset_window(now);
                }
                if success {
                    self.successes += 1;
                } else {
                    self.failures += 1;
                }
                let total = self.successes + self.failures;
                if total >= self.cfg.min_requests
                    && self.failures as f64 / total as f64 >= self.cfg.failure_threshold
                {
                    self.transition(CircuitState::Open, now, "failure_threshold_exceeded");
                }
            }
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                if !success {
                    self.transition(CircuitState::Open, now, "half_open_failure");
                    return;
                }
                self.half_open_successes += 1;
                if self.half_open_successes >= self.cfg.max_requests {
                    self.transition(CircuitState::Closed, now, "half_open_succeeded");
                }
            }
        }
    }

    /// A half-open trial ended without a result; free its slot.
    fn release(&mut self, generation: u64) {
        if generation == self.generation
            && self.state == CircuitState::HalfOpen
            && self.half_open_admitted > 0
        {
            self.half_open_admitted -= 1;
        }
    }

    fn reset_window(&mut self, now: Instant) {
        self.window_start = now;
        self.successes = 0;
        self.failures = 0;
    }

    fn transition(&mut self, to: CircuitState, now: Instant, reason: &'static str) {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(service = %self.service, from = ?from, to = ?to, "Illegal circuit transition ignored");
            return;
        }
        let failures = self.failures;

        self.state = to;
        self.generation += 1;
        self.last_transition = now;
        self.reset_window(now);
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
        self.opened_at = (to == CircuitState::Open).then_some(now);

        if to == CircuitState::Open {
            warn!(service = %self.service, from = ?from, to = ?to, reason, failures, "Circuit breaker opened");
        } else {
            info!(service = %self.service, from = ?from, to = ?to, reason, "Circuit breaker transition");
        }
    }
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One breaker per service, created on first use.
pub struct CircuitBreakers {
    cfg: Arc<CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn breaker(&self, service: &str, now: Instant) -> Arc<Mutex<CircuitBreaker>> {
        let existing = self.breakers.get(service).map(|b| Arc::clone(b.value()));
        existing.unwrap_or_else(|| {
            let entry = self.breakers.entry(service.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(service, Arc::clone(&self.cfg), now)))
            });
            Arc::clone(entry.value())
        })
    }

    pub fn acquire(&self, service: &str) -> Option<BreakerPermit> {
        self.acquire_at(service, Instant::now())
    }

    /// Admit a request to `service`, or `None` when the breaker rejects it.
    /// The permit must be completed with [`BreakerPermit::record`]; dropping
    /// it unrecorded frees a half-open trial slot.
    pub fn acquire_at(&self, service: &str, now: Instant) -> Option<BreakerPermit> {
        let breaker = self.breaker(service, now);
        let generation = lock(&breaker).try_admit(now)?;
        Some(BreakerPermit {
            breaker,
            generation,
            done: false,
        })
    }

    /// Admission check without a permit. Pair with [`Self::record_result`].
    pub fn allow(&self, service: &str) -> bool {
        self.acquire(service).map(BreakerPermit::detach).is_some()
    }

    /// Record the outcome of a call admitted by [`Self::allow`].
    pub fn record_result(&self, service: &str, success: bool) {
        self.record_result_at(service, success, Instant::now());
    }

    pub fn record_result_at(&self, service: &str, success: bool, now: Instant) {
        let breaker = self.breaker(service, now);
        let mut guard = lock(&breaker);
        let generation = guard.generation;
        guard.on_result(generation, success, now);
    }

    /// Current state; services never called report closed.
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers
            .get(service)
            .map(|b| lock(b.value()).state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), lock(e.value()).state()))
            .collect()
    }

    pub fn snapshots(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.snapshots_at(Instant::now())
    }

    pub fn snapshots_at(&self, now: Instant) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), lock(e.value()).snapshot_at(now)))
            .collect()
    }
}

/// Admission ticket for one proxied call.
pub struct BreakerPermit {
    breaker: Arc<Mutex<CircuitBreaker>>,
    generation: u64,
    done: bool,
}

impl BreakerPermit {
    pub fn record(self, success: bool) {
        self.record_at(success, Instant::now());
    }

    pub fn record_at(mut self, success: bool, now: Instant) {
        self.done = true;
        lock(&self.breaker).on_result(self.generation, success, now);
    }

    fn detach(mut self) {
        self.done = true;
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.done {
            lock(&self.breaker).release(self.generation);
        }
    }
}

/// Whether an upstream outcome counts as success for the breaker.
/// `None` means the outcome says nothing about the backend.
pub fn classify(outcome: Option<&UpstreamOutcome>, count_client_errors: bool) -> Option<bool> {
    match outcome? {
        UpstreamOutcome::Failed(err) if err.is_backend_failure() => Some(false),
        UpstreamOutcome::Failed(_) => None,
        UpstreamOutcome::Responded(status) => {
            if status.is_server_error() {
                Some(false)
            } else if status.is_client_error() {
                Some(!count_client_errors)
            } else {
                Some(true)
            }
        }
    }
}

/// Per-service admission in front of the proxy.
pub struct CircuitBreakerPlugin {
    breakers: Arc<CircuitBreakers>,
    counters: Arc<GatewayCounters>,
    metrics: Arc<MetricsCollector>,
}

impl CircuitBreakerPlugin {
    pub fn new(
        breakers: Arc<CircuitBreakers>,
        counters: Arc<GatewayCounters>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            breakers,
            counters,
            metrics,
        }
    }
}

#[async_trait]
impl Plugin for CircuitBreakerPlugin {
    fn name(&self) -> &str {
        "circuit-breaker"
    }

    fn priority(&self) -> i32 {
        priority::CIRCUIT_BREAKER
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response {
        let Some(service) = ctx.service_name().map(str::to_string) else {
            return next.run(ctx).await;
        };
        let Some(permit) = self.breakers.acquire(&service) else {
            self.counters.record_circuit_rejected();
            self.metrics.record_circuit_rejected(&service);
            return ctx.fail(GatewayError::CircuitOpen(service));
        };

        let resp = next.run(ctx).await;

        let count_client_errors = self.breakers.config().count_client_errors;
        if let Some(success) = classify(ctx.upstream_outcome.as_ref(), count_client_errors) {
            permit.record(success);
        }
        resp
    }
}
