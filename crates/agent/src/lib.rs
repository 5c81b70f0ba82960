// Domain-driven module structure for the svrn node agent.

// Core infrastructure
pub mod cli;
pub mod conf;
pub mod error;
pub mod state;

// Domain modules
pub mod runtime;
pub mod service;

pub use error::{AgentError, ConfigError, ServiceError};
pub use runtime::{Agent, AgentStatus};
