use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json};
use gatehouse_proxy::gateway::GatewayMetrics;
use gatehouse_proxy::Gateway;
use std::sync::Arc;

/// Counter snapshot plus limiter and breaker summaries.
pub async fn gateway_metrics(State(gateway): State<Arc<Gateway>>) -> Json<GatewayMetrics> {
    Json(gateway.metrics_snapshot())
}

/// Prometheus text exposition.
pub async fn prometheus(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.render_prometheus(),
    )
}
