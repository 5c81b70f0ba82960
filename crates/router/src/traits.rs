use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::mode::RouterMode;
use crate::stream::{Inbound, RouterStream};

/// Network surface handed to services.
///
/// Services only ever see this trait, never the mode the router was opened
/// in. Implemented by [`crate::RouterHandle`] and by the in-memory
/// [`crate::fake::FakeRouter`] used in tests.
#[async_trait]
pub trait Router: Send + Sync {
    /// Session nickname of this node.
    fn node(&self) -> &str;

    fn mode(&self) -> &RouterMode;

    /// Destination a service of this node listens on.
    fn destination_for(&self, service: &str) -> String {
        format!("{}.{}", self.node(), service)
    }

    /// Open a stream to `destination`.
    async fn dial(&self, destination: &str) -> Result<RouterStream>;

    /// Start accepting streams addressed to `<node>.<service>`.
    async fn listen(&self, service: &str) -> Result<Inbound>;

    /// Round-trip a ping over the control session.
    async fn check_health(&self) -> Result<()>;

    /// Re-establish the control session after a connection loss.
    async fn reconnect(&self) -> Result<()>;

    /// Release every router resource. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Resolves a [`RouterMode`] into a ready router.
#[async_trait]
pub trait RouterOpener: Send + Sync {
    async fn open(&self, mode: &RouterMode) -> Result<Arc<dyn Router>>;
}
