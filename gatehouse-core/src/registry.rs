use crate::service::{ServiceDefinition, ServiceStatus, ServiceView};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory directory of backend services and their live status.
///
/// The map is sharded (`DashMap`); each entry keeps its definition and its
/// status behind separate `ArcSwap` cells. The health checker publishes a
/// new status with one atomic store, so request paths reading a service
/// never wait on a probe and never see a half-written status.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
}

struct ServiceEntry {
    definition: ArcSwap<ServiceDefinition>,
    status: ArcSwap<ServiceStatus>,
}

impl ServiceEntry {
    fn new(definition: ServiceDefinition) -> Self {
        Self {
            definition: ArcSwap::from_pointee(definition),
            status: ArcSwap::from_pointee(ServiceStatus::unknown()),
        }
    }

    fn view(&self) -> ServiceView {
        ServiceView {
            definition: (**self.definition.load()).clone(),
            status: (**self.status.load()).clone(),
        }
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated with the given definitions.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        let registry = Self::new();
        for def in definitions {
            registry.register(def);
        }
        registry
    }

    /// Add or replace a service by name. Re-registering an identical
    /// definition is a no-op; changing the address resets its status.
    pub fn register(&self, definition: ServiceDefinition) {
        let name = definition.name.clone();
        match self.services.get(&name).map(|e| Arc::clone(e.value())) {
            Some(entry) => {
                let current = entry.definition.load();
                if **current == definition {
                    return;
                }
                let address_changed = current.url != definition.url;
                entry.definition.store(Arc::new(definition));
                if address_changed {
                    entry.status.store(Arc::new(ServiceStatus::unknown()));
                }
                info!(service = %name, "Service replaced");
            }
            None => {
                info!(service = %name, url = %definition.url, "Service registered");
                self.services
                    .insert(name, Arc::new(ServiceEntry::new(definition)));
            }
        }
    }

    /// Look up a service together with its current status.
    pub fn resolve(&self, name: &str) -> Option<ServiceView> {
        self.services.get(name).map(|e| e.view())
    }

    /// Look up only the definition (hot path: no status copy).
    pub fn definition(&self, name: &str) -> Option<Arc<ServiceDefinition>> {
        self.services.get(name).map(|e| e.definition.load_full())
    }

    /// Current status of a service.
    pub fn status(&self, name: &str) -> Option<Arc<ServiceStatus>> {
        self.services.get(name).map(|e| e.status.load_full())
    }

    /// Publish a new status. Returns false for unknown services.
    pub fn update_status(&self, name: &str, status: ServiceStatus) -> bool {
        let Some(entry) = self.services.get(name).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        debug!(service = %name, state = ?status.state, "Service status updated");
        entry.status.store(Arc::new(status));
        true
    }

    /// Publish a status measured against `checked`. Dropped (returns false)
    /// when the service is gone or its address changed since the check
    /// began, so a slow result for the old address never lands on the new
    /// one.
    pub fn update_status_for(&self, checked: &ServiceDefinition, status: ServiceStatus) -> bool {
        let Some(entry) = self.services.get(&checked.name).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        if entry.definition.load().url != checked.url {
            debug!(service = %checked.name, "Discarding status for a replaced address");
            return false;
        }
        let written = Arc::new(status);
        entry.status.store(Arc::clone(&written));
        // a register() racing the store above has already reset the status
        // or is about to; undo our write if it still stands
        if entry.definition.load().url != checked.url {
            entry
                .status
                .compare_and_swap(&written, Arc::new(ServiceStatus::unknown()));
            return false;
        }
        debug!(service = %checked.name, state = ?written.state, "Service status updated");
        true
    }

    /// Enable or disable a service without removing it.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let Some(entry) = self.services.get(name).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let mut def = (**entry.definition.load()).clone();
        def.enabled = enabled;
        entry.definition.store(Arc::new(def));
        info!(service = %name, enabled, "Service admission changed");
        true
    }

    /// Definitions of every enabled service (health checker input).
    pub fn enabled_definitions(&self) -> Vec<Arc<ServiceDefinition>> {
        self.services
            .iter()
            .map(|e| e.value().definition.load_full())
            .filter(|d| d.enabled)
            .collect()
    }

    /// Copy of every service and its status, sorted by name.
    pub fn snapshot(&self) -> Vec<ServiceView> {
        let mut views: Vec<ServiceView> = self.services.iter().map(|e| e.value().view()).collect();
        views.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        views
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
