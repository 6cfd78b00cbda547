use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "gatehouse";

/// Upper bounds in seconds, from a cache hit on the auth path up to the
/// default five second backend timeout and a little beyond.
const LATENCY_BUCKETS: &[f64] = &[0.002, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Prometheus view of the gateway.
///
/// Series (all prefixed `gatehouse_`):
///
/// | name | labels |
/// |---|---|
/// | `http_requests_total` | service, method, status |
/// | `http_request_duration_seconds` | service |
/// | `rate_limited_total` | scope |
/// | `circuit_rejected_total` | service |
/// | `circuit_breaker_state` | service (0 closed, 1 half-open, 2 open) |
///
/// A disabled collector owns no registry and every call is a no-op.
pub struct MetricsCollector {
    series: Option<Series>,
}

struct Series {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
    rate_limited: IntCounterVec,
    circuit_rejected: IntCounterVec,
    breaker_state: IntGaugeVec,
}

impl Series {
    fn register() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Requests answered by the gateway").namespace(NAMESPACE),
            &["service", "method", "status"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "Time from accept to response head")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["service"],
        )?;
        let rate_limited = IntCounterVec::new(
            Opts::new("rate_limited_total", "Requests rejected by the rate limiter").namespace(NAMESPACE),
            &["scope"],
        )?;
        let circuit_rejected = IntCounterVec::new(
            Opts::new("circuit_rejected_total", "Requests rejected by an open circuit")
                .namespace(NAMESPACE),
            &["service"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "0 closed, 1 half-open, 2 open").namespace(NAMESPACE),
            &["service"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(circuit_rejected.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;

        Ok(Self {
            registry,
            requests,
            latency,
            rate_limited,
            circuit_rejected,
            breaker_state,
        })
    }
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> anyhow::Result<Self> {
        let series = if enabled { Some(Series::register()?) } else { None };
        Ok(Self { series })
    }

    pub fn is_enabled(&self) -> bool {
        self.series.is_some()
    }

    /// One finished request. Unrouted requests use service `-`.
    #[inline]
    pub fn record_request(&self, service: &str, method: &str, status: u16, duration_secs: f64) {
        let Some(s) = &self.series else { return };
        let mut buf = itoa::Buffer::new();
        s.requests
            .with_label_values(&[service, method, buf.format(status)])
            .inc();
        s.latency.with_label_values(&[service]).observe(duration_secs);
    }

    pub fn record_rate_limited(&self, scope: &str) {
        if let Some(s) = &self.series {
            s.rate_limited.with_label_values(&[scope]).inc();
        }
    }

    pub fn record_circuit_rejected(&self, service: &str) {
        if let Some(s) = &self.series {
            s.circuit_rejected.with_label_values(&[service]).inc();
        }
    }

    /// Set the breaker gauge for `service` (see the table above for values).
    pub fn set_breaker_state(&self, service: &str, value: i64) {
        if let Some(s) = &self.series {
            s.breaker_state.with_label_values(&[service]).set(value);
        }
    }

    /// Text exposition; empty when disabled.
    pub fn render(&self) -> String {
        let Some(s) = &self.series else {
            return String::new();
        };
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&s.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode prometheus metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
