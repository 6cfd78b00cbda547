use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A backend service the gateway can route to.
///
/// Loaded from the `services[]` config section. The name is the unique key
/// used by routes and by the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    /// Unique service name (e.g. `order`).
    pub name: String,

    /// Base address, scheme included (e.g. `http://order-service:8083`).
    pub url: String,

    /// Per-request timeout for proxied calls and health probes.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Path probed by the health checker.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Disabled services stay registered but reject traffic with 503.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout_ms: default_timeout_ms(),
            health_path: default_health_path(),
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Base address without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Full URL of the health endpoint.
    pub fn health_url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("{}{}", self.base_url(), path)
    }

    /// Upstream URL for a request path and optional query string.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url(), path, q),
            _ => format!("{}{}", self.base_url(), path),
        }
    }
}

/// Result of the most recent health probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not probed yet.
    Unknown,
    Healthy,
    Unhealthy,
}

/// Live status of a service, written only by the health checker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatus {
    pub state: HealthState,
    pub last_checked: Option<DateTime<Utc>>,
    /// Latency of the last probe in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Why the last probe failed.
    pub reason: Option<String>,
}

impl ServiceStatus {
    pub fn unknown() -> Self {
        Self {
            state: HealthState::Unknown,
            last_checked: None,
            response_time_ms: None,
            reason: None,
        }
    }

    pub fn healthy(response_time: Duration) -> Self {
        Self {
            state: HealthState::Healthy,
            last_checked: Some(Utc::now()),
            response_time_ms: Some(response_time.as_millis() as u64),
            reason: None,
        }
    }

    pub fn unhealthy(response_time: Option<Duration>, reason: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            last_checked: Some(Utc::now()),
            response_time_ms: response_time.map(|d| d.as_millis() as u64),
            reason: Some(reason.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

/// A service definition paired with its current status, as handed out by
/// registry lookups and snapshots.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceView {
    #[serde(flatten)]
    pub definition: ServiceDefinition,
    pub status: ServiceStatus,
}

fn default_timeout_ms() -> u64 { 5000 }
fn default_health_path() -> String { "/health".into() }
fn default_enabled() -> bool { true }
