use crate::dispatch::DispatchPlugin;
use crate::health_check::HealthChecker;
use crate::proxy::ReverseProxy;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::Response;
use gatehouse_core::config::GatewayConfig;
use gatehouse_core::error::GatewayError;
use gatehouse_core::registry::ServiceRegistry;
use gatehouse_core::route::RouteRule;
use gatehouse_core::router::Router;
use gatehouse_core::service::{HealthState, ServiceView};
use gatehouse_observability::counters::CountersSnapshot;
use gatehouse_observability::metrics::MetricsCollector;
use gatehouse_observability::GatewayCounters;
use gatehouse_plugin::pipeline::Pipeline;
use gatehouse_plugin::plugin::{Plugin, PluginContext};
use gatehouse_plugins::auth::{AuthValidator, BearerAuthPlugin};
use gatehouse_plugins::logging::RequestLoggerPlugin;
use gatehouse_plugins::traffic::{
    BreakerSnapshot, CircuitBreakerPlugin, CircuitBreakers, CorsPlugin, RateLimiter, RateLimitingPlugin,
};
use http::Request;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Point-in-time view served by `/gateway/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMetrics {
    pub requests: CountersSnapshot,
    pub rate_limiter: LimiterSummary,
    pub circuit_breakers: BTreeMap<String, BreakerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterSummary {
    pub enabled: bool,
    pub active_keys: usize,
}

/// Readiness derived from the registry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub services: BTreeMap<String, HealthState>,
}

/// Owns every process-wide manager and the middleware chain.
///
/// Built once at startup; [`Gateway::start`] launches the background
/// tasks and [`Gateway::shutdown`] stops them.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ServiceRegistry>,
    router: Arc<Router>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakers>,
    auth: Arc<AuthValidator>,
    counters: Arc<GatewayCounters>,
    metrics: Arc<MetricsCollector>,
    pipeline: Pipeline,
    proxy: ReverseProxy,
    client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .no_gzip()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(config.server.idle_timeout())
            .build()?;

        let registry = Arc::new(ServiceRegistry::from_definitions(config.services.clone()));
        let router = Arc::new(Router::build(config.routes.clone())?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let breakers = Arc::new(CircuitBreakers::new(config.circuit_breaker.clone()));
        let auth = Arc::new(AuthValidator::new(client.clone(), &config.auth));
        let counters = Arc::new(GatewayCounters::new());
        let metrics = Arc::new(MetricsCollector::new(config.observability.prometheus.enabled)?);

        let mut plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(RequestLoggerPlugin::new(Arc::clone(&counters), Arc::clone(&metrics))),
            Arc::new(CorsPlugin::new(config.cors.clone())),
            Arc::new(DispatchPlugin::new(Arc::clone(&router), Arc::clone(&registry))),
            Arc::new(BearerAuthPlugin::new(Arc::clone(&auth))),
            Arc::new(CircuitBreakerPlugin::new(
                Arc::clone(&breakers),
                Arc::clone(&counters),
                Arc::clone(&metrics),
            )),
        ];
        if config.rate_limit.enabled {
            plugins.push(Arc::new(RateLimitingPlugin::new(
                Arc::clone(&limiter),
                config.rate_limit.scope,
                Arc::clone(&counters),
                Arc::clone(&metrics),
            )));
        }
        let pipeline = Pipeline::build(plugins);
        debug!(stages = ?pipeline.names(), "Pipeline built");

        let proxy = ReverseProxy::new(
            client.clone(),
            config.server.max_body_bytes,
            config.server.read_timeout(),
            config.server.write_timeout(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            router,
            limiter,
            breakers,
            auth,
            counters,
            metrics,
            pipeline,
            proxy,
            client,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the health checker and the cache maintenance task.
    pub fn start(&self) {
        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&self.registry),
            self.client.clone(),
            self.config.health_check.interval(),
        ));
        let health = checker.spawn(self.shutdown_tx.subscribe());
        let sweeper = self.spawn_sweeper();

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(health);
        tasks.push(sweeper);
        info!(
            services = self.registry.len(),
            routes = self.router.route_count(),
            "Gateway started"
        );
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        let auth = Arc::clone(&self.auth);
        let period = self.config.rate_limit.sweep_interval();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                let buckets = limiter.sweep();
                let tokens = auth.sweep();
                if buckets + tokens > 0 {
                    debug!(buckets, tokens, "Evicted idle cache entries");
                }
            }
        })
    }

    /// Signal background tasks to stop and wait for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Gateway stopped");
    }

    /// Replace the route table. Every rule must name a registered service;
    /// on any error the current table keeps serving.
    pub fn reload_routes(&self, rules: Vec<RouteRule>) -> Result<(), GatewayError> {
        if let Some(rule) = rules.iter().find(|r| !self.registry.contains(&r.service)) {
            warn!(path = %rule.path, service = %rule.service, "Route reload rejected");
            return Err(GatewayError::ConfigValidation(format!(
                "route {:?} references unknown service {:?}",
                rule.path, rule.service
            )));
        }
        self.router.reload(rules)
    }

    /// Run one proxied request through the chain.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let client_ip = self.client_ip(&req);
        let mut ctx = PluginContext::new(req, client_ip);
        self.pipeline.execute(&mut ctx, &self.proxy).await
    }

    fn client_ip(&self, req: &Request<Body>) -> String {
        if self.config.server.trust_forwarded_for {
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn metrics_snapshot(&self) -> GatewayMetrics {
        GatewayMetrics {
            requests: self.counters.snapshot(),
            rate_limiter: LimiterSummary {
                enabled: self.config.rate_limit.enabled,
                active_keys: self.limiter.active_keys(),
            },
            circuit_breakers: self.breakers.snapshots(),
        }
    }

    /// Ready unless an enabled service is known to be unhealthy.
    pub fn readiness(&self) -> Readiness {
        let mut services = BTreeMap::new();
        let mut ready = true;
        for view in self.registry.snapshot() {
            if view.definition.enabled && view.status.state == HealthState::Unhealthy {
                ready = false;
            }
            services.insert(view.definition.name, view.status.state);
        }
        Readiness { ready, services }
    }

    pub fn services(&self) -> Vec<ServiceView> {
        self.registry.snapshot()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Prometheus text with breaker gauges brought up to date first.
    pub fn render_prometheus(&self) -> String {
        if self.metrics.is_enabled() {
            for (service, state) in self.breakers.states() {
                self.metrics.set_breaker_state(&service, state.gauge_value());
            }
        }
        self.metrics.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::service::{ServiceDefinition, ServiceStatus};

    fn config() -> GatewayConfig {
        GatewayConfig {
            services: vec![
                ServiceDefinition::new("order", "http://127.0.0.1:1"),
                ServiceDefinition::new("cart", "http://127.0.0.1:2"),
            ],
            routes: vec![
                RouteRule::new("/api/orders/*", "order", true),
                RouteRule::new("/api/cart/*", "cart", false),
            ],
            ..Default::default()
        }
    }

    // ── Construction ─────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.routes.push(RouteRule::new("/api/ghost/*", "ghost", false));
        assert!(Gateway::new(cfg).is_err());
    }

    // ── Route reload ─────────────────────────────────────────────

    #[tokio::test]
    async fn reload_with_unknown_service_keeps_old_table() {
        let gw = Gateway::new(config()).unwrap();
        let err = gw
            .reload_routes(vec![
                RouteRule::new("/api/orders/*", "order", true),
                RouteRule::new("/api/ghost/*", "ghost", false),
            ])
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigValidation(_)));
        assert!(err.to_string().contains("ghost"), "{err}");
        assert_eq!(gw.router().route_count(), 2);
        assert_eq!(gw.router().match_path("/api/cart/1").unwrap().service, "cart");
        assert!(gw.router().match_path("/api/ghost/1").is_none());
    }

    #[tokio::test]
    async fn reload_with_known_services_swaps_table() {
        let gw = Gateway::new(config()).unwrap();
        gw.reload_routes(vec![RouteRule::new("/api/basket/*", "cart", false)])
            .unwrap();
        assert_eq!(gw.router().route_count(), 1);
        assert_eq!(gw.router().match_path("/api/basket/1").unwrap().service, "cart");
        assert!(gw.router().match_path("/api/orders/1").is_none());
    }

    #[tokio::test]
    async fn pipeline_orders_stages() {
        let gw = Gateway::new(config()).unwrap();
        assert_eq!(
            gw.pipeline.names(),
            vec!["request-logger", "cors", "rate-limiting", "dispatch", "bearer-auth", "circuit-breaker"]
        );

        let mut cfg = config();
        cfg.rate_limit.enabled = false;
        let gw = Gateway::new(cfg).unwrap();
        assert!(!gw.pipeline.names().contains(&"rate-limiting"));
    }

    // ── Client address ───────────────────────────────────────────

    #[tokio::test]
    async fn client_ip_from_connect_info_or_forwarded_for() {
        let gw = Gateway::new(config()).unwrap();
        let mut req = Request::builder()
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(gw.client_ip(&req), "unknown");
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(gw.client_ip(&req), "192.0.2.1");

        let mut cfg = config();
        cfg.server.trust_forwarded_for = true;
        let gw = Gateway::new(cfg).unwrap();
        assert_eq!(gw.client_ip(&req), "198.51.100.4");
    }

    // ── Readiness ────────────────────────────────────────────────

    #[tokio::test]
    async fn readiness_follows_enabled_service_health() {
        let gw = Gateway::new(config()).unwrap();
        assert!(gw.readiness().ready);

        gw.registry().update_status("cart", ServiceStatus::unhealthy(None, "timeout"));
        let r = gw.readiness();
        assert!(!r.ready);
        assert_eq!(r.services["cart"], HealthState::Unhealthy);

        gw.registry().set_enabled("cart", false);
        assert!(gw.readiness().ready);
    }

    // ── Lifecycle ────────────────────────────────────────────────

    #[tokio::test]
    async fn start_then_shutdown_joins_tasks() {
        let gw = Gateway::new(config()).unwrap();
        gw.start();
        tokio::time::timeout(std::time::Duration::from_secs(5), gw.shutdown())
            .await
            .expect("shutdown hung");
        assert!(gw.tasks.lock().unwrap().is_empty());
    }
}
