use axum::extract::State;
use axum::response::Json;
use gatehouse_proxy::Gateway;
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn list_services(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let mut services = gateway.services();
    services.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
    Json(json!({
        "total": services.len(),
        "list": services,
    }))
}
