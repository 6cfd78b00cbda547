use crate::error::GatewayError;
use crate::route::{RoutePattern, RouteRule};
use crate::service::ServiceDefinition;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Listener and inbound connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for reading the client request body.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Upper bound for a whole request, backend call included.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Idle lifetime of pooled backend connections.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Take the client address from the first `X-Forwarded-For` entry.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Rate-limit key dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    PerIp,
    PerUser,
    Global,
}

impl RateLimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::PerIp => "per_ip",
            RateLimitScope::PerUser => "per_user",
            RateLimitScope::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tokens added per window.
    #[serde(default = "default_requests")]
    pub requests: u32,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Bucket capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_scope")]
    pub scope: RateLimitScope,
    /// Buckets untouched for this long are evicted.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Trial requests admitted while half-open.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Rolling window for counting outcomes while closed.
    #[serde(default = "default_cb_interval")]
    pub interval_secs: u64,
    /// How long the breaker stays open before probing.
    #[serde(default = "default_cb_timeout")]
    pub timeout_secs: u64,
    /// Failure ratio that trips the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Minimum requests in the window before the ratio is evaluated.
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    /// Count upstream 4xx responses as failures.
    #[serde(default)]
    pub count_client_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_url")]
    pub service_url: String,
    #[serde(default = "default_verify_path")]
    pub verify_path: String,
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_allow_origins")]
    pub allow_origins: Vec<String>,
    #[serde(default = "default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default = "default_expose_headers")]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

/// Observability settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// When false, no prometheus counters are updated on the hot path.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 8080 }
fn default_read_timeout() -> u64 { 15_000 }
fn default_write_timeout() -> u64 { 30_000 }
fn default_idle_timeout() -> u64 { 60_000 }
fn default_max_body_bytes() -> usize { 10 * 1024 * 1024 }
fn default_true() -> bool { true }
fn default_requests() -> u32 { 100 }
fn default_window() -> u64 { 60 }
fn default_burst() -> u32 { 20 }
fn default_scope() -> RateLimitScope { RateLimitScope::PerIp }
fn default_idle_ttl() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 60 }
fn default_max_requests() -> u32 { 3 }
fn default_cb_interval() -> u64 { 60 }
fn default_cb_timeout() -> u64 { 30 }
fn default_failure_threshold() -> f64 { 0.6 }
fn default_min_requests() -> u32 { 5 }
fn default_auth_url() -> String { "http://localhost:8081".into() }
fn default_verify_path() -> String { "/api/v1/auth/verify".into() }
fn default_auth_timeout() -> u64 { 3000 }
fn default_cache_ttl() -> u64 { 300 }
fn default_check_interval() -> u64 { 30 }
fn default_allow_origins() -> Vec<String> { vec!["*".into()] }
fn default_allow_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}
fn default_allow_headers() -> Vec<String> {
    ["Authorization", "Content-Type", "X-Correlation-Id"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}
fn default_expose_headers() -> Vec<String> { vec!["X-Correlation-Id".into()] }
fn default_max_age() -> u64 { 86_400 }
fn default_metrics_path() -> String { "/metrics".into() }
fn default_log_level() -> String { "info".into() }

// ── Impls ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            max_body_bytes: default_max_body_bytes(),
            trust_forwarded_for: false,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: default_requests(),
            window_secs: default_window(),
            burst: default_burst(),
            scope: default_scope(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    /// Continuous refill rate in tokens per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.requests as f64 / self.window_secs.max(1) as f64
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_secs: default_cb_interval(),
            timeout_secs: default_cb_timeout(),
            failure_threshold: default_failure_threshold(),
            min_requests: default_min_requests(),
            count_client_errors: false,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_url: default_auth_url(),
            verify_path: default_verify_path(),
            timeout_ms: default_auth_timeout(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl AuthConfig {
    pub fn verify_url(&self) -> String {
        format!("{}{}", self.service_url.trim_end_matches('/'), self.verify_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_check_interval(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: default_allow_origins(),
            allow_methods: default_allow_methods(),
            allow_headers: default_allow_headers(),
            expose_headers: default_expose_headers(),
            allow_credentials: false,
            max_age_secs: default_max_age(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_metrics_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, then the YAML file, then
    /// `GATEHOUSE_`-prefixed env vars (`__` separates nested keys).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: GatewayConfig = Self::figment(path).extract()?;
        Ok(config)
    }

    /// The layered provider stack behind [`GatewayConfig::load`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("GATEHOUSE_").split("__"))
    }

    /// Check cross-references and value ranges. Any error is fatal at startup.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |msg: String| Err(GatewayError::ConfigValidation(msg));

        let mut names = HashSet::new();
        for svc in &self.services {
            if svc.name.trim().is_empty() {
                return invalid("service name must not be empty".into());
            }
            if !names.insert(svc.name.as_str()) {
                return invalid(format!("duplicate service name {:?}", svc.name));
            }
            let uri: http::Uri = match svc.url.parse() {
                Ok(u) => u,
                Err(e) => return invalid(format!("service {:?} has invalid url: {e}", svc.name)),
            };
            if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
                return invalid(format!(
                    "service {:?} url must be an absolute http(s) address",
                    svc.name
                ));
            }
            if svc.timeout_ms == 0 {
                return invalid(format!("service {:?} timeout must be positive", svc.name));
            }
        }

        let mut patterns = HashSet::new();
        for route in &self.routes {
            RoutePattern::parse(&route.path)?;
            if !patterns.insert(route.path.as_str()) {
                return invalid(format!("duplicate route pattern {:?}", route.path));
            }
            if !names.contains(route.service.as_str()) {
                return invalid(format!(
                    "route {:?} references unknown service {:?}",
                    route.path, route.service
                ));
            }
        }

        let rl = &self.rate_limit;
        if rl.enabled && (rl.requests == 0 || rl.window_secs == 0 || rl.burst == 0) {
            return invalid("rate_limit requests, window_secs and burst must be positive".into());
        }

        let cb = &self.circuit_breaker;
        if !(cb.failure_threshold > 0.0 && cb.failure_threshold <= 1.0) {
            return invalid(format!(
                "circuit_breaker.failure_threshold must be in (0, 1], got {}",
                cb.failure_threshold
            ));
        }
        if cb.max_requests == 0 || cb.min_requests == 0 {
            return invalid("circuit_breaker max_requests and min_requests must be positive".into());
        }

        if self.auth.timeout_ms == 0 {
            return invalid("auth.timeout_ms must be positive".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> GatewayConfig {
        GatewayConfig {
            services: vec![
                ServiceDefinition::new("order", "http://order:8083"),
                ServiceDefinition::new("auth", "http://auth:8081"),
            ],
            routes: vec![
                RouteRule::new("/api/orders/*", "order", true),
                RouteRule::new("/api/auth/*", "auth", false),
            ],
            ..Default::default()
        }
    }

    // ── Default values ────────────────────────────────────────────

    #[test]
    fn default_server_config_has_expected_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.read_timeout_ms, 15_000);
        assert_eq!(cfg.write_timeout_ms, 30_000);
        assert!(!cfg.trust_forwarded_for);
    }

    #[test]
    fn default_circuit_breaker_config_values() {
        let cfg = CircuitBreakerConfig::default();
        assert_eq!(cfg.max_requests, 3);
        assert_eq!(cfg.interval(), Duration::from_secs(60));
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.failure_threshold, 0.6);
        assert!(!cfg.count_client_errors);
    }

    #[test]
    fn default_rate_limit_is_per_ip() {
        let cfg = RateLimitConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.scope, RateLimitScope::PerIp);
        assert!((cfg.refill_per_sec() - 100.0 / 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn default_health_interval_is_thirty_seconds() {
        assert_eq!(HealthCheckConfig::default().interval(), Duration::from_secs(30));
    }

    #[test]
    fn auth_verify_url_joins_cleanly() {
        let cfg = AuthConfig {
            service_url: "http://auth:8081/".into(),
            ..Default::default()
        };
        assert_eq!(cfg.verify_url(), "http://auth:8081/api/v1/auth/verify");
    }

    #[test]
    fn scope_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RateLimitScope::PerUser).unwrap(), "\"per_user\"");
        let s: RateLimitScope = serde_json::from_str("\"global\"").unwrap();
        assert_eq!(s, RateLimitScope::Global);
    }

    // ── Validation ────────────────────────────────────────────────

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn route_to_unknown_service_is_rejected() {
        let mut cfg = valid_config();
        cfg.routes.push(RouteRule::new("/api/cart/*", "cart", false));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown service"), "{err}");
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let mut cfg = valid_config();
        cfg.services.push(ServiceDefinition::new("order", "http://other:1"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relative_service_url_is_rejected() {
        let mut cfg = valid_config();
        cfg.services[0].url = "order:8083".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_route_pattern_is_rejected() {
        let mut cfg = valid_config();
        cfg.routes.push(RouteRule::new("/api/*/x", "order", false));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn failure_threshold_out_of_range_is_rejected() {
        let mut cfg = valid_config();
        cfg.circuit_breaker.failure_threshold = 1.5;
        assert!(cfg.validate().is_err());
        cfg.circuit_breaker.failure_threshold = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_burst_only_matters_when_enabled() {
        let mut cfg = valid_config();
        cfg.rate_limit.burst = 0;
        assert!(cfg.validate().is_err());
        cfg.rate_limit.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    // ── GatewayConfig::load() ─────────────────────────────────────

    #[test]
    fn load_from_valid_yaml_overrides_defaults() {
        let yaml = r#"
server:
  port: 9090
services:
  - name: order
    url: "http://order:8083"
    timeout_ms: 2500
  - name: cart
    url: "http://cart:8084"
    enabled: false
routes:
  - path: "/api/orders/*"
    service: order
    auth_required: true
rate_limit:
  requests: 10
  window_secs: 1
  burst: 5
  scope: per_user
circuit_breaker:
  count_client_errors: true
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "{yaml}").unwrap();
        let cfg = GatewayConfig::load(tmpfile.path()).unwrap();

        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.services.len(), 2);
        assert_eq!(cfg.services[0].timeout_ms, 2500);
        assert_eq!(cfg.services[1].health_path, "/health");
        assert!(!cfg.services[1].enabled);
        assert!(cfg.routes[0].auth_required);
        assert_eq!(cfg.rate_limit.scope, RateLimitScope::PerUser);
        assert_eq!(cfg.rate_limit.burst, 5);
        assert!(cfg.circuit_breaker.count_client_errors);
        assert_eq!(cfg.circuit_breaker.max_requests, 3);
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides_file_which_overrides_defaults() {
        // keys here are not asserted by the other load tests, which may run
        // while the jail's variables are set
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "gatehouse.yaml",
                "server:\n  read_timeout_ms: 1000\n  write_timeout_ms: 2000\n",
            )?;
            jail.set_env("GATEHOUSE_SERVER__READ_TIMEOUT_MS", "1500");

            let cfg = GatewayConfig::load(Path::new("gatehouse.yaml")).unwrap();
            assert_eq!(cfg.server.read_timeout_ms, 1500);
            assert_eq!(cfg.server.write_timeout_ms, 2000);
            assert_eq!(cfg.server.idle_timeout_ms, ServerConfig::default().idle_timeout_ms);
            Ok(())
        });
    }

    #[test]
    fn load_from_missing_file_yields_defaults() {
        let cfg = GatewayConfig::load(Path::new("/nonexistent/gatehouse.yaml")).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.services.is_empty());
    }
}
