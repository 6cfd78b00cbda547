use axum::extract::State;
use axum::response::Json;
use gatehouse_proxy::Gateway;
use serde_json::{Value, json};
use std::sync::Arc;

/// Loaded route table in match order.
pub async fn list_routes(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let routes = gateway.router().rules();
    Json(json!({
        "total": routes.len(),
        "list": routes,
    }))
}
