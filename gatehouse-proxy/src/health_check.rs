use gatehouse_core::registry::ServiceRegistry;
use gatehouse_core::service::{HealthState, ServiceDefinition, ServiceStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Periodically probes every enabled service and writes the result into
/// the registry. Probe failures are logged and never stop the loop.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServiceRegistry>, client: reqwest::Client, interval: Duration) -> Self {
        Self {
            registry,
            client,
            interval,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "Health checker started");

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = self.check_all() => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("Health checker stopped");
        })
    }

    /// Probe all enabled services concurrently and record the results.
    pub async fn check_all(&self) {
        let mut probes = JoinSet::new();
        for service in self.registry.enabled_definitions() {
            let client = self.client.clone();
            probes.spawn(async move {
                let status = probe(&client, &service).await;
                (service, status)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((service, status)) => self.record(&service, status),
                Err(e) => warn!(error = %e, "Health probe task failed"),
            }
        }
    }

    fn record(&self, service: &ServiceDefinition, status: ServiceStatus) {
        let current = self.registry.definition(&service.name);
        if current.is_none_or(|def| def.url != service.url) {
            debug!(service = %service.name, "Address changed during health check, result dropped");
            return;
        }
        let previous = self.registry.status(&service.name).map(|s| s.state);
        match (previous, status.state) {
            (Some(HealthState::Healthy | HealthState::Unknown), HealthState::Unhealthy) => warn!(
                service = %service.name,
                reason = status.reason.as_deref().unwrap_or(""),
                "Service marked unhealthy"
            ),
            (Some(HealthState::Unhealthy), HealthState::Healthy) => {
                info!(service = %service.name, "Service recovered")
            }
            _ => debug!(service = %service.name, state = ?status.state, "Health probe done"),
        }
        self.registry.update_status_for(service, status);
    }
}

/// One GET against the service's health endpoint. 2xx is healthy.
pub async fn probe(client: &reqwest::Client, service: &ServiceDefinition) -> ServiceStatus {
    let started = Instant::now();
    let result = client
        .get(service.health_url())
        .timeout(service.timeout())
        .send()
        .await;
    let elapsed = started.elapsed();

    match result {
        Ok(resp) if resp.status().is_success() => ServiceStatus::healthy(elapsed),
        Ok(resp) => ServiceStatus::unhealthy(Some(elapsed), format!("status {}", resp.status().as_u16())),
        Err(e) if e.is_timeout() => ServiceStatus::unhealthy(None, "timeout"),
        Err(e) if e.is_connect() => ServiceStatus::unhealthy(None, "connection refused"),
        Err(_) => ServiceStatus::unhealthy(None, "request failed"),
    }
}
