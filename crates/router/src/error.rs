use std::time::Duration;

use thiserror::Error;

use crate::proto::ResultCode;

/// Standard Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Embedded router did not become ready within {0:?}")]
    StartTimeout(Duration),

    #[error("Router at {endpoint} unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Router disconnected: {0}")]
    Disconnected(String),

    #[error("Router operation '{op}' timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("Router rejected {op}: {code}")]
    Rejected { op: &'static str, code: ResultCode },

    #[error("Router protocol error: {0}")]
    Protocol(String),

    #[error("Router handle is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// True when the failure means the router itself went away, as opposed to
    /// a refusal it answered with. Only these are worth a reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            RouterError::Disconnected(_)
                | RouterError::Io(_)
                | RouterError::Timeout { .. }
                | RouterError::Unreachable { .. }
        )
    }
}
