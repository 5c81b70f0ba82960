//! Runtime module — agent lifecycle, router health, boot and shutdown.

pub mod boot;
pub mod health;
pub mod lifecycle;
pub mod monitor;
pub mod stop;

pub use health::{HealthCell, HealthStatus};
pub use lifecycle::{Agent, AgentStatus};
pub use monitor::HealthMonitor;
