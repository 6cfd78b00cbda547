pub mod dispatch;
pub mod gateway;
pub mod health_check;
pub mod proxy;

pub use gateway::Gateway;
