use crate::response::error_response;
use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use gatehouse_core::error::GatewayError;
use gatehouse_core::route::RouteRule;
use gatehouse_core::service::ServiceDefinition;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Header carrying the per-request correlation id, inbound and outbound.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Caller identity established by bearer auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// What happened when the proxy talked to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    /// The backend answered with this status.
    Responded(StatusCode),
    /// Transport-level failure (timeout, refused connection, ...).
    Failed(GatewayError),
}

/// Mutable per-request state threaded through the chain.
pub struct PluginContext {
    // --- Request data ---
    pub method: Method,
    pub uri: Uri,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Taken by the proxy endpoint.
    pub body: Body,

    /// Client address as seen by the gateway.
    pub client_ip: String,
    pub correlation_id: String,

    // --- Set by stages ---
    pub route: Option<Arc<RouteRule>>,
    pub service: Option<Arc<ServiceDefinition>>,
    pub identity: Option<Identity>,
    pub upstream_outcome: Option<UpstreamOutcome>,
    /// Error that produced the response, if any (log only).
    pub error: Option<GatewayError>,

    // --- Sizes & timing ---
    pub request_bytes: u64,
    pub response_bytes: Option<u64>,
    pub request_start: Instant,
}

impl PluginContext {
    pub fn new(req: Request<Body>, client_ip: String) -> Self {
        let (parts, body) = req.into_parts();
        let correlation_id = parts
            .headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            uri: parts.uri,
            headers: parts.headers,
            body,
            client_ip,
            correlation_id,
            route: None,
            service: None,
            identity: None,
            upstream_outcome: None,
            error: None,
            request_bytes: 0,
            response_bytes: None,
            request_start: Instant::now(),
        }
    }

    /// Get a request header as a string.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Move the request body out, leaving an empty one behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref().map(|s| s.name.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    /// Time spent on this request so far.
    pub fn elapsed(&self) -> Duration {
        self.request_start.elapsed()
    }

    /// Remember `err` for the access log and build its JSON response.
    pub fn fail(&mut self, err: GatewayError) -> Response {
        let resp = error_response(&err, &self.correlation_id);
        self.error = Some(err);
        resp
    }
}

/// A middleware stage. Stages run in descending priority; each decides
/// whether to call `next` and may post-process the response it returns.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stage name (must be unique)
    fn name(&self) -> &str;

    /// Higher runs earlier (further out).
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(&self, ctx: &mut PluginContext, next: Next<'_>) -> Response;
}

/// Terminal handler at the end of the chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &mut PluginContext) -> Response;
}

/// The remainder of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Plugin>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Plugin>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    /// Run the next stage, or the endpoint once the chain is exhausted.
    pub async fn run(self, ctx: &mut PluginContext) -> Response {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(ctx, Next::new(rest, self.endpoint)).await
            }
            None => self.endpoint.call(ctx).await,
        }
    }
}
