pub mod auth;
pub mod logging;
pub mod traffic;

/// Stage priorities, outermost first.
pub mod priority {
    pub const REQUEST_LOGGER: i32 = 4000;
    pub const CORS: i32 = 3000;
    pub const RATE_LIMITING: i32 = 2000;
    /// Route dispatch sits here (see `gatehouse-proxy`).
    pub const DISPATCH: i32 = 1500;
    pub const BEARER_AUTH: i32 = 1000;
    pub const CIRCUIT_BREAKER: i32 = 500;
}
