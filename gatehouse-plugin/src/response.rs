use axum::body::Body;
use axum::response::Response;
use gatehouse_core::error::GatewayError;
use http::{HeaderValue, StatusCode, header};

/// Build the JSON error response for `err`, with `Retry-After` on 429 and
/// `WWW-Authenticate` on 401.
pub fn error_response(err: &GatewayError, correlation_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = Response::new(Body::from(err.to_json_body(correlation_id)));
    *resp.status_mut() = status;

    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(secs) = err.retry_after_secs() {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    if status == StatusCode::UNAUTHORIZED {
        headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    resp
}

/// Bodyless response with the given status.
pub fn empty_response(status: StatusCode) -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}
