use crate::handlers;
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router as AxumRouter;
use gatehouse_proxy::Gateway;
use http::Request;
use std::sync::Arc;
use tracing::{info, warn};

const RESERVED_PATHS: &[&str] = &[
    "/health",
    "/health/ready",
    "/gateway/services",
    "/gateway/routes",
    "/gateway/metrics",
];

/// Build the full HTTP surface: operational endpoints plus the proxy
/// fallback for everything else.
pub fn build_router(gateway: Arc<Gateway>) -> AxumRouter {
    let config = gateway.config();

    let mut app = AxumRouter::new()
        .route("/health", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
        .route("/gateway/services", get(handlers::services::list_services))
        .route("/gateway/routes", get(handlers::routes::list_routes))
        .route("/gateway/metrics", get(handlers::metrics::gateway_metrics));

    let prom = &config.observability.prometheus;
    if prom.enabled {
        if RESERVED_PATHS.contains(&prom.path.as_str()) || !prom.path.starts_with('/') {
            warn!(path = %prom.path, "Prometheus path unusable, exposition disabled");
        } else {
            info!(path = %prom.path, "Prometheus exposition enabled");
            app = app.route(&prom.path, get(handlers::metrics::prometheus));
        }
    }

    app.fallback(proxy).with_state(gateway)
}

async fn proxy(State(gateway): State<Arc<Gateway>>, req: Request<Body>) -> Response {
    gateway.handle(req).await
}
