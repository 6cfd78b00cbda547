use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use gatehouse_proxy::Gateway;
use serde_json::{Value, json};
use std::sync::Arc;

/// Process liveness. Never consults dependencies.
pub async fn liveness() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 503 while any enabled service is known to be unhealthy.
pub async fn readiness(State(gateway): State<Arc<Gateway>>) -> (StatusCode, Json<Value>) {
    let r = gateway.readiness();
    let code = if r.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if r.ready { "ready" } else { "degraded" },
            "services": r.services,
        })),
    )
}
