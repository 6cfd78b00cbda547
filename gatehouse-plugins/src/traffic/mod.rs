pub mod circuit_breaker;
pub mod cors;
pub mod rate_limiting;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreakerPlugin, CircuitBreakers, CircuitState};
pub use cors::CorsPlugin;
pub use rate_limiting::{RateLimiter, RateLimitingPlugin};
