use std::path::PathBuf;
use std::time::Duration;

use svrn_router::{ParseModeError, RouterError};
use thiserror::Error;

use crate::service::ServiceKind;
use crate::state::AgentState;

/// Errors produced while loading and validating configuration.
///
/// Raised before any subsystem is touched, so there is never anything to
/// clean up when one of these comes back.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid role '{0}' (expected one of consumer, provider, relay, seed)")]
    InvalidRole(String),

    #[error("Invalid service '{0}' (expected one of blob, crdt)")]
    InvalidService(String),

    #[error("Failed to read config file {}: {source}", path.display())]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {message}", path.display())]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid router mode: {0}")]
    InvalidRouter(#[from] ParseModeError),

    #[error("Invalid community '{0}' (expected <scheme>://<reference>)")]
    InvalidCommunity(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service {0} is already started")]
    AlreadyStarted(ServiceKind),

    #[error("Service {kind} failed to start: {source}")]
    ServiceStartError {
        kind: ServiceKind,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("Service {kind} failed to stop: {reason}")]
    ServiceStopError { kind: ServiceKind, reason: String },

    #[error("No factory registered for service {0}")]
    NotRegistered(ServiceKind),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Lamport clock exhausted")]
    ClockExhausted,

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Wrap a failure of `kind`'s start, keeping already-wrapped errors as-is.
    pub fn start_failed(kind: ServiceKind, source: ServiceError) -> Self {
        match source {
            wrapped @ ServiceError::ServiceStartError { .. } => wrapped,
            other => ServiceError::ServiceStartError {
                kind,
                source: Box::new(other),
            },
        }
    }
}

/// One subsystem that could not be released cleanly during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownFailure {
    pub component: String,
    pub error: String,
}

impl std::fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.component, self.error)
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Cannot {op} agent in state {state}")]
    InvalidState { op: &'static str, state: AgentState },

    #[error("Start cancelled by a stop request")]
    Cancelled,

    #[error("Shutdown finished with {} failure(s): {}", .0.len(), join_failures(.0))]
    Shutdown(Vec<ShutdownFailure>),

    #[error("Shutdown did not finish within {0:?}; remaining resources were dropped")]
    ShutdownTimeout(Duration),
}

fn join_failures(failures: &[ShutdownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failed_does_not_double_wrap() {
        let inner = ServiceError::start_failed(ServiceKind::Blob, ServiceError::Timeout(Duration::from_secs(1)));
        let outer = ServiceError::start_failed(ServiceKind::Crdt, inner);
        match outer {
            ServiceError::ServiceStartError { kind, source } => {
                assert_eq!(kind, ServiceKind::Blob);
                assert!(matches!(*source, ServiceError::Timeout(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_shutdown_error_lists_failures() {
        let err = AgentError::Shutdown(vec![
            ShutdownFailure {
                component: "service blob".to_string(),
                error: "boom".to_string(),
            },
            ShutdownFailure {
                component: "router".to_string(),
                error: "gone".to_string(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Shutdown finished with 2 failure(s): service blob: boom; router: gone"
        );
    }

    #[test]
    fn test_config_error_messages_name_the_value() {
        assert!(ConfigError::InvalidRole("admin".into()).to_string().contains("'admin'"));
        let err = ConfigError::FileReadError {
            path: PathBuf::from("/nope.yaml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/nope.yaml"));
    }
}
