use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use gatehouse_core::error::GatewayError;
use gatehouse_plugin::plugin::{CORRELATION_HEADER, Endpoint, PluginContext, UpstreamOutcome};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Hop-by-hop headers, never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_USER_ID: &str = "x-user-id";
const X_USER_EMAIL: &str = "x-user-email";

/// Terminal stage: forwards the request to the resolved service and
/// streams the answer back.
///
/// The backend call lives inside the request future, so a client that
/// disconnects drops it and the in-flight call with it.
///
/// Each call is bounded by the service timeout and by whatever is left of
/// the request's write deadline, whichever ends first. Running out of
/// either is a backend timeout.
pub struct ReverseProxy {
    client: reqwest::Client,
    max_body_bytes: usize,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ReverseProxy {
    pub fn new(
        client: reqwest::Client,
        max_body_bytes: usize,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            client,
            max_body_bytes,
            read_timeout,
            write_timeout,
        }
    }

    /// Budget for the backend call of a request that has been running
    /// for `elapsed`.
    fn call_timeout(&self, service_timeout: Duration, elapsed: Duration) -> Duration {
        service_timeout.min(self.write_timeout.saturating_sub(elapsed))
    }

    async fn read_body(&self, body: Body, declared: Option<u64>) -> Result<Bytes, GatewayError> {
        if declared.is_some_and(|len| len > self.max_body_bytes as u64) {
            return Err(GatewayError::RequestBodyTooLarge(self.max_body_bytes));
        }
        match tokio::time::timeout(self.read_timeout, collect_limited(body, self.max_body_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::RequestTimeout),
        }
    }
}

/// Buffer a body, failing once it grows past `limit` bytes.
async fn collect_limited(mut body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let frame = frame.map_err(|e| {
            debug!(error = %e, "Failed reading request body");
            GatewayError::InvalidRequestBody
        })?;
        if let Ok(data) = frame.into_data() {
            if buf.len() + data.len() > limit {
                return Err(GatewayError::RequestBodyTooLarge(limit));
            }
            buf.extend_from_slice(&data);
        }
    }
    Ok(buf.freeze())
}

/// Copy `headers` without hop-by-hop headers, headers named by
/// `Connection`, or `host`.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let n = name.as_str();
        if n == "host" || HOP_BY_HOP.contains(&n) || named.iter().any(|c| c == n) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers sent to the backend: the client's end-to-end headers plus
/// forwarding, correlation and identity headers.
pub fn upstream_headers(ctx: &PluginContext) -> HeaderMap {
    let mut headers = strip_hop_by_hop(&ctx.headers);
    // the buffered body gets its own length
    headers.remove(header::CONTENT_LENGTH);
    // only the gateway may assert identity
    headers.remove(X_USER_ID);
    headers.remove(X_USER_EMAIL);

    let forwarded_for = match ctx.get_header(X_FORWARDED_FOR) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {}", ctx.client_ip),
        _ => ctx.client_ip.clone(),
    };
    set(&mut headers, X_FORWARDED_FOR, &forwarded_for);

    if let Some(host) = ctx.get_header(header::HOST.as_str()) {
        set(&mut headers, X_FORWARDED_HOST, host);
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        let proto = ctx.uri.scheme_str().unwrap_or("http");
        set(&mut headers, X_FORWARDED_PROTO, proto);
    }
    set(&mut headers, CORRELATION_HEADER, &ctx.correlation_id);

    if let Some(identity) = &ctx.identity {
        set(&mut headers, X_USER_ID, &identity.user_id);
        if let Some(email) = &identity.email {
            set(&mut headers, X_USER_EMAIL, email);
        }
    }
    headers
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(_) => debug!(header = name, "Skipping header with invalid value"),
    }
}

#[async_trait]
impl Endpoint for ReverseProxy {
    async fn call(&self, ctx: &mut PluginContext) -> Response {
        let Some(service) = ctx.service.clone() else {
            warn!(path = %ctx.path, "Proxy reached without a resolved service");
            return ctx.fail(GatewayError::UnexpectedProxy);
        };

        let declared = ctx
            .get_header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok());
        let body = match self.read_body(ctx.take_body(), declared).await {
            Ok(b) => b,
            Err(e) => return ctx.fail(e),
        };
        ctx.request_bytes = body.len() as u64;

        let url = service.upstream_url(&ctx.path, ctx.query.as_deref());
        let headers = upstream_headers(ctx);
        let timeout = self.call_timeout(service.timeout(), ctx.elapsed());
        debug!(
            service = %service.name,
            method = %ctx.method,
            url = %url,
            timeout_ms = timeout.as_millis() as u64,
            "Forwarding request"
        );

        let send = self
            .client
            .request(ctx.method.clone(), &url)
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send();
        let result = match tokio::time::timeout(timeout, send).await {
            Ok(result) => result.map_err(|e| (e.is_timeout(), e.to_string())),
            Err(_) => Err((true, "deadline elapsed".to_string())),
        };

        match result {
            Ok(upstream) => {
                let status = upstream.status();
                ctx.upstream_outcome = Some(UpstreamOutcome::Responded(status));
                ctx.response_bytes = upstream.content_length();

                let headers = strip_hop_by_hop(upstream.headers());
                let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
                *resp.status_mut() = status;
                *resp.headers_mut() = headers;
                resp
            }
            Err((timed_out, e)) => {
                let err = if timed_out {
                    GatewayError::BackendTimeout(service.name.clone())
                } else {
                    GatewayError::BackendConnection(service.name.clone())
                };
                warn!(
                    service = %service.name,
                    correlation_id = %ctx.correlation_id,
                    error = %e,
                    timed_out,
                    "Backend call failed"
                );
                ctx.upstream_outcome = Some(UpstreamOutcome::Failed(err.clone()));
                ctx.fail(err)
            }
        }
    }
}
