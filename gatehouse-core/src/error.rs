use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for Gatehouse.
///
/// Every variant that can reach a client maps to one HTTP status and one
/// stable error code. Messages are safe to show to callers; backend
/// addresses and upstream error text stay in the logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("no route matches {0}")]
    RouteNotFound(String),

    #[error("service {0} is not registered")]
    ServiceNotFound(String),

    #[error("service {0} is disabled")]
    ServiceDisabled(String),

    #[error("origin {0} is not allowed")]
    OriginNotAllowed(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    #[error("missing bearer token")]
    MissingCredentials,

    #[error("invalid or expired token")]
    AuthInvalid,

    #[error("authentication service unavailable")]
    AuthServiceUnavailable,

    #[error("service {0} is temporarily unavailable")]
    CircuitOpen(String),

    #[error("service {0} timed out")]
    BackendTimeout(String),

    #[error("service {0} is unreachable")]
    BackendConnection(String),

    #[error("request body exceeds {0} bytes")]
    RequestBodyTooLarge(usize),

    #[error("request body could not be read")]
    InvalidRequestBody,

    #[error("timed out reading the request body")]
    RequestTimeout,

    #[error("unexpected proxy error")]
    UnexpectedProxy,
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::OriginNotAllowed(_) => 403,
            GatewayError::RateLimitExceeded { .. } => 429,
            GatewayError::MissingCredentials | GatewayError::AuthInvalid => 401,
            GatewayError::AuthServiceUnavailable => 503,
            GatewayError::ServiceNotFound(_) | GatewayError::ServiceDisabled(_) => 503,
            GatewayError::CircuitOpen(_) => 503,
            GatewayError::BackendTimeout(_) => 503,
            GatewayError::BackendConnection(_) => 502,
            GatewayError::RequestBodyTooLarge(_) => 413,
            GatewayError::InvalidRequestBody => 400,
            GatewayError::RequestTimeout => 408,
            GatewayError::ConfigValidation(_) | GatewayError::UnexpectedProxy => 500,
        }
    }

    /// Stable machine-readable code carried in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ConfigValidation(_) => "CONFIG_VALIDATION_ERROR",
            GatewayError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            GatewayError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            GatewayError::ServiceDisabled(_) => "SERVICE_DISABLED",
            GatewayError::OriginNotAllowed(_) => "ORIGIN_NOT_ALLOWED",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::MissingCredentials => "MISSING_CREDENTIALS",
            GatewayError::AuthInvalid => "AUTH_INVALID",
            GatewayError::AuthServiceUnavailable => "AUTH_SERVICE_UNAVAILABLE",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::BackendTimeout(_) => "BACKEND_TIMEOUT",
            GatewayError::BackendConnection(_) => "BACKEND_CONNECTION_ERROR",
            GatewayError::RequestBodyTooLarge(_) => "REQUEST_BODY_TOO_LARGE",
            GatewayError::InvalidRequestBody => "INVALID_REQUEST_BODY",
            GatewayError::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayError::UnexpectedProxy => "UNEXPECTED_PROXY_ERROR",
        }
    }

    /// Whether the failure happened while talking to a backend and must be
    /// recorded against that service's circuit breaker.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendTimeout(_) | GatewayError::BackendConnection(_)
        )
    }

    /// `Retry-After` value in whole seconds (rounded up, at least 1).
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded { retry_after } => {
                Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
            }
            _ => None,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self, correlation_id: &str) -> Vec<u8> {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "correlation_id": correlation_id,
            }
        })
        .to_string()
        .into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(GatewayError::RouteNotFound("/x".into()).status_code(), 404);
        assert_eq!(
            GatewayError::RateLimitExceeded { retry_after: Duration::from_secs(1) }.status_code(),
            429
        );
        assert_eq!(GatewayError::OriginNotAllowed("https://evil.test".into()).status_code(), 403);
        assert_eq!(GatewayError::AuthInvalid.status_code(), 401);
        assert_eq!(GatewayError::MissingCredentials.status_code(), 401);
        assert_eq!(GatewayError::AuthServiceUnavailable.status_code(), 503);
        assert_eq!(GatewayError::CircuitOpen("order".into()).status_code(), 503);
        assert_eq!(GatewayError::BackendConnection("order".into()).status_code(), 502);
        assert_eq!(GatewayError::BackendTimeout("order".into()).status_code(), 503);
        assert_eq!(GatewayError::UnexpectedProxy.status_code(), 500);
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        let err = GatewayError::RateLimitExceeded { retry_after: Duration::from_millis(1200) };
        assert_eq!(err.retry_after_secs(), Some(2));

        let err = GatewayError::RateLimitExceeded { retry_after: Duration::from_millis(10) };
        assert_eq!(err.retry_after_secs(), Some(1));

        assert_eq!(GatewayError::AuthInvalid.retry_after_secs(), None);
    }

    #[test]
    fn only_transport_failures_count_against_backend() {
        assert!(GatewayError::BackendTimeout("a".into()).is_backend_failure());
        assert!(GatewayError::BackendConnection("a".into()).is_backend_failure());
        assert!(!GatewayError::CircuitOpen("a".into()).is_backend_failure());
        assert!(!GatewayError::AuthInvalid.is_backend_failure());
    }

    #[test]
    fn json_body_carries_code_message_and_correlation_id() {
        let body = GatewayError::CircuitOpen("order".into()).to_json_body("abc-123");
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["error"]["code"], "CIRCUIT_OPEN");
        assert_eq!(v["error"]["correlation_id"], "abc-123");
        assert_eq!(v["error"]["message"], "service order is temporarily unavailable");
    }
}
