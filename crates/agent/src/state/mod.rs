//! State module — lifecycle state and node roles.

pub mod agent;
pub mod role;

pub use agent::{AgentState, StateCell};
pub use role::{Role, RoleSet};
