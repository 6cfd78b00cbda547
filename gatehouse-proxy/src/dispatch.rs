use async_trait::async_trait;
use axum::response::Response;
use gatehouse_core::error::GatewayError;
use gatehouse_core::registry::ServiceRegistry;
use gatehouse_core::router::Router;
use gatehouse_plugin::plugin::{Next, Plugin, PluginContext};
use gatehouse_plugins::priority;
use std::sync::Arc;
use tracing::debug;

/// Resolves the route and target service for a request.
///
/// Unmatched paths and unknown or disabled services are answered here,
/// before auth or any backend is contacted. Registry health is advisory
/// and not consulted.
pub struct DispatchPlugin {
    router: Arc<Router>,
    registry: Arc<ServiceRegistry>,
}

impl DispatchPlugin {
    pub fn new(router: Arc<Router>, registry: Arc<ServiceRegistry>) -> Self {
        Self { router, registry }
    }
}

#[async_trait]
impl Plugin for DispatchPlugin {
    fn name(&self) -> &str {
        "dispatch"
    }

    fn priority(&self) -> i32 {
        priority::DISPATCH
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response {
        let Some(route) = self.router.match_path(&ctx.path) else {
            return ctx.fail(GatewayError::RouteNotFound(ctx.path.clone()));
        };
        let service_name = route.service.clone();
        ctx.route = Some(route);

        let Some(service) = self.registry.definition(&service_name) else {
            return ctx.fail(GatewayError::ServiceNotFound(service_name));
        };
        let enabled = service.enabled;
        ctx.service = Some(service);
        if !enabled {
            debug!(service = %service_name, "Request to disabled service rejected");
            return ctx.fail(GatewayError::ServiceDisabled(service_name));
        }

        next.run(ctx).await
    }
}
