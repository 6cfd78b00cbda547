pub mod config;
pub mod error;
pub mod registry;
pub mod route;
pub mod router;
pub mod service;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use registry::ServiceRegistry;
pub use route::RouteRule;
pub use router::Router;
pub use service::{HealthState, ServiceDefinition, ServiceStatus, ServiceView};
