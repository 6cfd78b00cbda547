use crate::priority;
use async_trait::async_trait;
use axum::response::Response;
use gatehouse_core::config::CorsConfig;
use gatehouse_core::error::GatewayError;
use gatehouse_plugin::plugin::{Next, Plugin, PluginContext};
use gatehouse_plugin::response::empty_response;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};

/// CORS policy stage.
///
/// Preflights are answered here without reaching later stages; requests
/// from disallowed origins get 403; everything else passes through with
/// the allow headers appended to whatever the chain returns.
pub struct CorsPlugin {
    cfg: CorsConfig,
    allow_methods: Option<HeaderValue>,
    allow_headers: Option<HeaderValue>,
    expose_headers: Option<HeaderValue>,
}

impl CorsPlugin {
    pub fn new(cfg: CorsConfig) -> Self {
        let joined = |items: &[String]| {
            if items.is_empty() {
                None
            } else {
                HeaderValue::from_str(&items.join(", ")).ok()
            }
        };
        Self {
            allow_methods: joined(&cfg.allow_methods),
            allow_headers: joined(&cfg.allow_headers),
            expose_headers: joined(&cfg.expose_headers),
            cfg,
        }
    }

    /// Value for `Access-Control-Allow-Origin`, or None if disallowed.
    fn resolve_origin(&self, origin: &str) -> Option<HeaderValue> {
        let wildcard = self.cfg.allow_origins.iter().any(|o| o == "*");
        if wildcard && !self.cfg.allow_credentials {
            return Some(HeaderValue::from_static("*"));
        }
        // credentials forbid `*`, so echo the origin instead
        if wildcard || self.cfg.allow_origins.iter().any(|o| o == origin) {
            return HeaderValue::from_str(origin).ok();
        }
        None
    }

    fn apply_common(&self, headers: &mut HeaderMap, origin: HeaderValue) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
        if self.cfg.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }

    fn preflight(&self, origin: HeaderValue) -> Response {
        let mut resp = empty_response(StatusCode::NO_CONTENT);
        let headers = resp.headers_mut();
        self.apply_common(headers, origin);
        if let Some(v) = &self.allow_methods {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, v.clone());
        }
        if let Some(v) = &self.allow_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, v.clone());
        }
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.cfg.max_age_secs));
        resp
    }
}

#[async_trait]
impl Plugin for CorsPlugin {
    fn name(&self) -> &str {
        "cors"
    }

    fn priority(&self) -> i32 {
        priority::CORS
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response {
        // not a CORS request
        let Some(origin) = ctx.get_header("origin").map(str::to_string) else {
            return next.run(ctx).await;
        };

        let Some(allowed) = self.resolve_origin(&origin) else {
            return ctx.fail(GatewayError::OriginNotAllowed(origin));
        };

        let is_preflight = ctx.method == Method::OPTIONS
            && ctx.headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        if is_preflight {
            return self.preflight(allowed);
        }

        let mut resp = next.run(ctx).await;
        let headers = resp.headers_mut();
        self.apply_common(headers, allowed);
        if let Some(v) = &self.expose_headers {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, v.clone());
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use gatehouse_plugin::pipeline::Pipeline;
    use gatehouse_plugin::plugin::Endpoint;
    use http::Request;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(AtomicU32);

    #[async_trait]
    impl Endpoint for Counting {
        async fn call(&self, _ctx: &mut PluginContext) -> Response {
            self.0.fetch_add(1, Ordering::SeqCst);
            empty_response(StatusCode::OK)
        }
    }

    fn make_ctx(method: &str, origin: Option<&str>, preflight: bool) -> PluginContext {
        let mut builder = Request::builder().method(method).uri("/api/orders");
        if let Some(o) = origin {
            builder = builder.header("origin", o);
        }
        if preflight {
            builder = builder.header("access-control-request-method", "POST");
        }
        PluginContext::new(builder.body(Body::empty()).unwrap(), "127.0.0.1".into())
    }

    fn restricted() -> CorsConfig {
        CorsConfig {
            allow_origins: vec!["https://shop.example".into()],
            ..Default::default()
        }
    }

    async fn run(cfg: CorsConfig, mut ctx: PluginContext) -> (Response, u32) {
        let endpoint = Counting(AtomicU32::new(0));
        let pipeline = Pipeline::build(vec![Arc::new(CorsPlugin::new(cfg))]);
        let resp = pipeline.execute(&mut ctx, &endpoint).await;
        (resp, endpoint.0.load(Ordering::SeqCst))
    }

    // ── Preflight ────────────────────────────────────────────────

    #[tokio::test]
    async fn preflight_is_answered_without_reaching_endpoint() {
        let (resp, calls) = run(
            restricted(),
            make_ctx("OPTIONS", Some("https://shop.example"), true),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(calls, 0);
        let h = resp.headers();
        assert_eq!(h[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://shop.example");
        assert!(h[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap().contains("POST"));
        assert_eq!(h[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[tokio::test]
    async fn options_without_request_method_is_not_a_preflight() {
        let (resp, calls) = run(
            restricted(),
            make_ctx("OPTIONS", Some("https://shop.example"), false),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls, 1);
    }

    // ── Simple requests ──────────────────────────────────────────

    #[tokio::test]
    async fn disallowed_origin_is_forbidden() {
        let (resp, calls) = run(restricted(), make_ctx("GET", Some("https://evil.example"), false)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn allowed_origin_gets_headers_on_response() {
        let (resp, calls) = run(
            CorsConfig::default(),
            make_ctx("GET", Some("https://any.example"), false),
        )
        .await;
        assert_eq!(calls, 1);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS], "X-Correlation-Id");
    }

    #[tokio::test]
    async fn credentials_echo_origin_instead_of_wildcard() {
        let cfg = CorsConfig {
            allow_credentials: true,
            ..Default::default()
        };
        let (resp, _) = run(cfg, make_ctx("GET", Some("https://app.example"), false)).await;
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn no_origin_passes_through_untouched() {
        let (resp, calls) = run(restricted(), make_ctx("GET", None, false)).await;
        assert_eq!(calls, 1);
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
