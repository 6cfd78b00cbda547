use crate::plugin::{Endpoint, Next, Plugin, PluginContext};
use axum::response::Response;
use std::sync::Arc;

/// Pre-built middleware chain.
///
/// Stages are sorted by priority (descending) once at build time; running
/// a request is a walk down the slice with no per-request allocation
/// beyond what each stage does itself.
pub struct Pipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    /// Build a pipeline. Equal priorities keep their insertion order.
    pub fn build(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { plugins }
    }

    /// Run `ctx` through every stage and finally `endpoint`.
    pub async fn execute(&self, ctx: &mut PluginContext, endpoint: &dyn Endpoint) -> Response {
        Next::new(&self.plugins, endpoint).run(ctx).await
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
