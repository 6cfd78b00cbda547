use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Tracing target every access record is emitted on.
pub const ACCESS_TARGET: &str = "gatehouse::access";

/// Request headers copied into the access log. Everything else is dropped.
pub const LOGGED_HEADERS: &[&str] = &[
    "user-agent",
    "content-type",
    "accept",
    "origin",
    "referer",
    "x-forwarded-for",
    "x-real-ip",
    "x-request-id",
];

/// Never logged, even if someone adds them to the allowlist.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

/// Structured access log entry, one per request.
///
/// Built once the response is known, emitted once and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub method: String,
    pub path: String,
    pub service: Option<String>,
    pub client_ip: String,
    pub user_id: Option<String>,
    pub status: u16,
    pub duration_ms: f64,
    pub request_bytes: u64,
    /// Upstream `Content-Length`; unknown for chunked responses.
    pub response_bytes: Option<u64>,
    pub error: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl RequestLogEntry {
    /// Emit the record on [`ACCESS_TARGET`]. 5xx logs at error, 4xx at warn.
    pub fn emit(&self) {
        let headers = serde_json::to_string(&self.headers).unwrap_or_default();
        let service = self.service.as_deref().unwrap_or("-");
        let user_id = self.user_id.as_deref().unwrap_or("-");
        let error = self.error.as_deref().unwrap_or("");
        let response_bytes = self.response_bytes.unwrap_or(0);

        macro_rules! access_event {
            ($level:ident) => {
                $level!(
                    target: ACCESS_TARGET,
                    timestamp = %self.timestamp.to_rfc3339(),
                    correlation_id = %self.correlation_id,
                    method = %self.method,
                    path = %self.path,
                    service = %service,
                    client_ip = %self.client_ip,
                    user_id = %user_id,
                    status = self.status,
                    duration_ms = self.duration_ms,
                    request_bytes = self.request_bytes,
                    response_bytes,
                    error = %error,
                    headers = %headers,
                    "request completed"
                )
            };
        }

        match self.status {
            500.. => access_event!(error),
            400..=499 => access_event!(warn),
            _ => access_event!(info),
        }
    }
}

/// Copy the allowlisted headers, lowercased. Multi-valued headers are
/// joined with `, `; non-UTF-8 values are skipped.
pub fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in LOGGED_HEADERS {
        if SENSITIVE_HEADERS.contains(name) {
            continue;
        }
        let values: Vec<&str> = headers
            .get_all(*name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if !values.is_empty() {
            out.insert((*name).to_string(), values.join(", "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer secret"));
        h.insert("cookie", HeaderValue::from_static("session=abc"));
        h.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        h.insert("content-type", HeaderValue::from_static("application/json"));
        h.append("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        h.append("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));
        h.insert("x-internal-token", HeaderValue::from_static("nope"));
        h
    }

    #[test]
    fn capture_excludes_credentials() {
        let captured = capture_headers(&headers());
        assert!(!captured.contains_key("authorization"));
        assert!(!captured.contains_key("cookie"));
        assert!(!captured.contains_key("x-internal-token"));
        assert_eq!(captured["user-agent"], "curl/8.0");
    }

    #[test]
    fn capture_joins_repeated_headers() {
        let captured = capture_headers(&headers());
        assert_eq!(captured["x-forwarded-for"], "10.0.0.1, 10.0.0.2");
    }

    #[test]
    fn entry_serializes_all_fields() {
        let entry = RequestLogEntry {
            timestamp: Utc::now(),
            correlation_id: "c-1".into(),
            method: "POST".into(),
            path: "/api/orders".into(),
            service: Some("order".into()),
            client_ip: "127.0.0.1".into(),
            user_id: Some("u-42".into()),
            status: 201,
            duration_ms: 12.5,
            request_bytes: 48,
            response_bytes: None,
            error: None,
            headers: capture_headers(&headers()),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["correlation_id"], "c-1");
        assert_eq!(v["service"], "order");
        assert_eq!(v["status"], 201);
        assert!(v["headers"].get("authorization").is_none());
        entry.emit();
    }
}
