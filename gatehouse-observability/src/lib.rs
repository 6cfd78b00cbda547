pub mod access_log;
pub mod counters;

#[cfg(feature = "prometheus")]
pub mod metrics;

pub use access_log::RequestLogEntry;
pub use counters::{CountersSnapshot, GatewayCounters};
