//! Service module — pluggable, role-gated network features.
//!
//! Every service reaches the network only through the `Router` it is
//! started with, so each one can be exercised against
//! `svrn_router::fake::FakeRouter` in isolation.

pub mod blob;
pub mod crdt;
pub mod host;
pub mod registry;
pub mod wire;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use svrn_router::Router;

use crate::error::{ConfigError, ServiceError};

pub use blob::{BlobService, BlobStore};
pub use crdt::{CrdtService, LwwMap};
pub use host::{Handler, ServiceHost};
pub use registry::{ServiceFactory, ServiceRegistry};

/// Known service kinds. New kinds only need a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ServiceKind {
    Blob,
    Crdt,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 2] = [ServiceKind::Blob, ServiceKind::Crdt];

    /// Also the service suffix of the router destination.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Blob => "blob",
            ServiceKind::Crdt => "crdt",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::InvalidService(wanted.to_string()))
    }
}

/// What a service gets at construction: its identity, bootstrap info and a
/// logging span to run under.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub node: String,
    pub community: Option<String>,
    /// Bound for each network exchange the service makes.
    pub op_timeout: Duration,
    pub span: tracing::Span,
}

impl ServiceContext {
    pub fn new(node: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            node: node.into(),
            community: None,
            op_timeout,
            span: tracing::Span::none(),
        }
    }
}

/// Lifecycle capability shared by all services.
#[async_trait]
pub trait Service: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Bind to `router` and begin serving. Fails with
    /// [`ServiceError::AlreadyStarted`] when already running.
    async fn start(&self, router: Arc<dyn Router>) -> Result<(), ServiceError>;

    /// Stop serving. A no-op success when not started.
    async fn stop(&self) -> Result<(), ServiceError>;

    fn is_running(&self) -> bool;
}
