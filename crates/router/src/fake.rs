//! Fake — in-memory routers for tests.
//!
//! A [`FakeNetwork`] plays the overlay: every [`FakeRouter`] attached to it
//! can dial the listeners of every other one over `tokio::io::duplex` pipes.
//! Failures are injected through switches instead of mock expectations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, RouterError};
use crate::mode::RouterMode;
use crate::proto::ResultCode;
use crate::stream::{Inbound, RouterStream};
use crate::traits::{Router, RouterOpener};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared destination table.
#[derive(Default)]
pub struct FakeNetwork {
    listeners: DashMap<String, mpsc::Sender<RouterStream>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Destinations with a live listener.
    pub fn destinations(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        out.sort();
        out
    }
}

/// A router that lives entirely in memory.
pub struct FakeRouter {
    node: String,
    mode: RouterMode,
    network: Arc<FakeNetwork>,
    closed: AtomicBool,
    healthy: AtomicBool,
    refuse_pings: AtomicBool,
    reconnect_ok: AtomicBool,
    fail_close: AtomicBool,
    dials: AtomicUsize,
    reconnects: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeRouter {
    pub fn new(node: impl Into<String>, network: Arc<FakeNetwork>) -> Self {
        Self {
            node: node.into(),
            mode: RouterMode::Auto,
            network,
            closed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            refuse_pings: AtomicBool::new(false),
            reconnect_ok: AtomicBool::new(true),
            fail_close: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Make health checks fail until a successful reconnect.
    pub fn break_connection(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Answer health checks with a router-level refusal instead of a lost
    /// connection.
    pub fn set_refuse_pings(&self, refuse: bool) {
        self.refuse_pings.store(refuse, Ordering::Release);
    }

    /// Whether `reconnect` succeeds.
    pub fn set_reconnect_ok(&self, ok: bool) {
        self.reconnect_ok.store(ok, Ordering::Release);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::Release);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Acquire)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Router for FakeRouter {
    fn node(&self) -> &str {
        &self.node
    }

    fn mode(&self) -> &RouterMode {
        &self.mode
    }

    async fn dial(&self, destination: &str) -> Result<RouterStream> {
        self.ensure_open()?;
        self.dials.fetch_add(1, Ordering::AcqRel);

        let unreachable = RouterError::Rejected {
            op: "dial",
            code: ResultCode::CantReachPeer,
        };
        let tx = match self.network.listeners.get(destination) {
            Some(entry) => entry.value().clone(),
            None => return Err(unreachable),
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        if tx.send(RouterStream::new(self.node.clone(), remote)).await.is_err() {
            self.network
                .listeners
                .remove_if(destination, |_, sender| sender.is_closed());
            return Err(unreachable);
        }
        Ok(RouterStream::new(destination, local))
    }

    async fn listen(&self, service: &str) -> Result<Inbound> {
        self.ensure_open()?;
        let destination = self.destination_for(service);
        let (tx, rx) = mpsc::channel(16);

        let taken = {
            let mut entry = self.network.listeners.entry(destination.clone()).or_insert_with(|| tx.clone());
            if entry.value().is_closed() {
                *entry.value_mut() = tx.clone();
            }
            !entry.value().same_channel(&tx)
        };
        if taken {
            return Err(RouterError::Rejected {
                op: "session",
                code: ResultCode::DuplicatedId,
            });
        }
        Ok(Inbound::new(destination, rx, None))
    }

    async fn check_health(&self) -> Result<()> {
        self.ensure_open()?;
        if self.refuse_pings.load(Ordering::Acquire) {
            return Err(RouterError::Rejected {
                op: "ping",
                code: ResultCode::I2pError,
            });
        }
        if self.healthy.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RouterError::Disconnected("fake connection broken".to_string()))
        }
    }

    async fn reconnect(&self) -> Result<()> {
        self.ensure_open()?;
        self.reconnects.fetch_add(1, Ordering::AcqRel);
        if self.reconnect_ok.load(Ordering::Acquire) {
            self.healthy.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(RouterError::Unreachable {
                endpoint: "fake".to_string(),
                attempts: 1,
                last_error: "reconnect disabled".to_string(),
            })
        }
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::AcqRel);
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let prefix = format!("{}.", self.node);
        self.network.listeners.retain(|dest, _| !dest.starts_with(&prefix));
        if self.fail_close.load(Ordering::Acquire) {
            return Err(RouterError::Disconnected("fake close failure".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Opener handing out [`FakeRouter`]s on a shared network.
pub struct FakeOpener {
    node: String,
    network: Arc<FakeNetwork>,
    delay: Duration,
    fail: AtomicBool,
    opened: Mutex<Vec<Arc<FakeRouter>>>,
}

impl FakeOpener {
    pub fn new(node: impl Into<String>, network: Arc<FakeNetwork>) -> Self {
        Self {
            node: node.into(),
            network,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every `open`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every `open` fails as if the router never answered.
    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::Release);
        self
    }

    /// Most recently opened router.
    pub fn last(&self) -> Option<Arc<FakeRouter>> {
        self.opened.lock().last().cloned()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }
}

#[async_trait]
impl RouterOpener for FakeOpener {
    async fn open(&self, mode: &RouterMode) -> Result<Arc<dyn Router>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::Acquire) {
            return Err(match mode {
                RouterMode::Auto => RouterError::StartTimeout(self.delay),
                RouterMode::External { .. } => RouterError::Unreachable {
                    endpoint: mode.to_string(),
                    attempts: 1,
                    last_error: "connection refused".to_string(),
                },
            });
        }

        let mut router = FakeRouter::new(self.node.clone(), Arc::clone(&self.network));
        router.mode = mode.clone();
        let router = Arc::new(router);
        self.opened.lock().push(Arc::clone(&router));
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_two_nodes_talk_over_fake_network() {
        let network = FakeNetwork::new();
        let a = FakeRouter::new("node-a", Arc::clone(&network));
        let b = FakeRouter::new("node-b", Arc::clone(&network));

        let mut inbound = b.listen("blob").await.unwrap();
        let mut out = a.dial("node-b.blob").await.unwrap();
        let mut incoming = inbound.accept(Duration::from_secs(1)).await.unwrap();
        assert_eq!(incoming.peer(), "node-a");

        out.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(a.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_listener_frees_destination() {
        let network = FakeNetwork::new();
        let a = FakeRouter::new("node-a", Arc::clone(&network));

        let inbound = a.listen("crdt").await.unwrap();
        assert!(matches!(
            a.listen("crdt").await,
            Err(RouterError::Rejected { code: ResultCode::DuplicatedId, .. })
        ));
        drop(inbound);
        assert!(network.destinations().is_empty());
        assert!(a.dial("node-a.crdt").await.is_err());
        a.listen("crdt").await.unwrap();
    }

    #[tokio::test]
    async fn test_close_removes_listeners_and_is_idempotent() {
        let network = FakeNetwork::new();
        let a = FakeRouter::new("node-a", Arc::clone(&network));
        let _inbound = a.listen("blob").await.unwrap();

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert_eq!(a.close_count(), 2);
        assert!(network.destinations().is_empty());
        assert!(matches!(a.dial("x").await, Err(RouterError::Closed)));
    }

    #[tokio::test]
    async fn test_broken_connection_recovers_on_reconnect() {
        let a = FakeRouter::new("node-a", FakeNetwork::new());
        a.break_connection();
        assert!(a.check_health().await.unwrap_err().is_connection_loss());
        a.reconnect().await.unwrap();
        a.check_health().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_opener() {
        let opener = FakeOpener::new("node-a", FakeNetwork::new()).failing();
        assert!(matches!(opener.open(&RouterMode::Auto).await, Err(RouterError::StartTimeout(_))));
        assert_eq!(opener.open_count(), 0);
    }
}
