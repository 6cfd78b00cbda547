use crate::priority;
use async_trait::async_trait;
use axum::body::HttpBody;
use axum::response::Response;
use chrono::Utc;
use gatehouse_observability::access_log::{RequestLogEntry, capture_headers};
use gatehouse_observability::metrics::MetricsCollector;
use gatehouse_observability::GatewayCounters;
use gatehouse_plugin::plugin::{CORRELATION_HEADER, Next, Plugin, PluginContext};
use http::HeaderValue;
use std::sync::Arc;

/// Outermost stage: echoes the correlation id and emits one access record
/// per request, updating the counters as it goes.
pub struct RequestLoggerPlugin {
    counters: Arc<GatewayCounters>,
    metrics: Arc<MetricsCollector>,
}

impl RequestLoggerPlugin {
    pub fn new(counters: Arc<GatewayCounters>, metrics: Arc<MetricsCollector>) -> Self {
        Self { counters, metrics }
    }
}

#[async_trait]
impl Plugin for RequestLoggerPlugin {
    fn name(&self) -> &str {
        "request-logger"
    }

    fn priority(&self) -> i32 {
        priority::REQUEST_LOGGER
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response {
        // captured up front: later stages may rewrite request headers
        let headers = capture_headers(&ctx.headers);

        let mut resp = next.run(ctx).await;

        if let Ok(v) = HeaderValue::from_str(&ctx.correlation_id) {
            resp.headers_mut().insert(CORRELATION_HEADER, v);
        }

        let status = resp.status().as_u16();
        let duration = ctx.elapsed();
        let response_bytes = ctx
            .response_bytes
            .or_else(|| resp.body().size_hint().exact());

        let entry = RequestLogEntry {
            timestamp: Utc::now(),
            correlation_id: ctx.correlation_id.clone(),
            method: ctx.method.to_string(),
            path: ctx.path.clone(),
            service: ctx.service_name().map(str::to_string),
            client_ip: ctx.client_ip.clone(),
            user_id: ctx.user_id().map(str::to_string),
            status,
            duration_ms: duration.as_secs_f64() * 1000.0,
            request_bytes: ctx.request_bytes,
            response_bytes,
            error: ctx.error.as_ref().map(|e| e.to_string()),
            headers,
        };
        entry.emit();

        self.counters.record(ctx.service_name(), status);
        self.metrics.record_request(
            ctx.service_name().unwrap_or("-"),
            ctx.method.as_str(),
            status,
            duration.as_secs_f64(),
        );
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use gatehouse_core::error::GatewayError;
    use gatehouse_plugin::pipeline::Pipeline;
    use gatehouse_plugin::plugin::Endpoint;
    use gatehouse_plugin::response::empty_response;
    use http::{Request, StatusCode};

    struct Fixed(StatusCode);

    #[async_trait]
    impl Endpoint for Fixed {
        async fn call(&self, ctx: &mut PluginContext) -> Response {
            if self.0.is_server_error() {
                return ctx.fail(GatewayError::UnexpectedProxy);
            }
            empty_response(self.0)
        }
    }

    fn setup() -> (Pipeline, Arc<GatewayCounters>) {
        let counters = Arc::new(GatewayCounters::new());
        let metrics = Arc::new(MetricsCollector::new(false).unwrap());
        let plugin = RequestLoggerPlugin::new(Arc::clone(&counters), metrics);
        (Pipeline::build(vec![Arc::new(plugin)]), counters)
    }

    fn make_ctx(correlation: Option<&str>) -> PluginContext {
        let mut builder = Request::builder().uri("/api/orders");
        if let Some(c) = correlation {
            builder = builder.header(CORRELATION_HEADER, c);
        }
        PluginContext::new(builder.body(Body::empty()).unwrap(), "127.0.0.1".into())
    }

    #[tokio::test]
    async fn echoes_inbound_correlation_id() {
        let (pipeline, _) = setup();
        let resp = pipeline
            .execute(&mut make_ctx(Some("trace-77")), &Fixed(StatusCode::OK))
            .await;
        assert_eq!(resp.headers()[CORRELATION_HEADER], "trace-77");
    }

    #[tokio::test]
    async fn generated_correlation_id_matches_context() {
        let (pipeline, _) = setup();
        let mut ctx = make_ctx(None);
        let resp = pipeline.execute(&mut ctx, &Fixed(StatusCode::OK)).await;
        assert_eq!(
            resp.headers()[CORRELATION_HEADER].to_str().unwrap(),
            ctx.correlation_id
        );
    }

    #[tokio::test]
    async fn counters_follow_final_status() {
        let (pipeline, counters) = setup();
        pipeline.execute(&mut make_ctx(None), &Fixed(StatusCode::OK)).await;
        pipeline.execute(&mut make_ctx(None), &Fixed(StatusCode::NOT_FOUND)).await;
        pipeline
            .execute(&mut make_ctx(None), &Fixed(StatusCode::INTERNAL_SERVER_ERROR))
            .await;

        let snap = counters.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.client_errors, 1);
        assert_eq!(snap.server_errors, 1);
    }
}
