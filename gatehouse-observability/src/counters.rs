use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory request counters behind `/gateway/metrics`.
///
/// Every counter is an independent atomic; per-service entries are created
/// on first use and never removed.
#[derive(Default)]
pub struct GatewayCounters {
    total: AtomicU64,
    success: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
    per_service: DashMap<String, Arc<ServiceCounters>>,
}

#[derive(Default)]
struct ServiceCounters {
    requests: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceCountersSnapshot {
    pub requests: u64,
    pub errors: u64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub total: u64,
    pub success: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
    pub services: BTreeMap<String, ServiceCountersSnapshot>,
}

impl GatewayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished request by final status.
    pub fn record(&self, service: Option<&str>, status: u16) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match status {
            500.. => self.server_errors.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.client_errors.fetch_add(1, Ordering::Relaxed),
            _ => self.success.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(name) = service {
            let existing = self.per_service.get(name).map(|e| Arc::clone(e.value()));
            let entry = existing.unwrap_or_else(|| {
                Arc::clone(self.per_service.entry(name.to_string()).or_default().value())
            });
            entry.requests.fetch_add(1, Ordering::Relaxed);
            if status >= 500 {
                entry.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejected(&self) {
        self.circuit_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let services = self
            .per_service
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    ServiceCountersSnapshot {
                        requests: e.value().requests.load(Ordering::Relaxed),
                        errors: e.value().errors.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        CountersSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            services,
        }
    }
}
