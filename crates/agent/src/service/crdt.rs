//! CRDT service — a last-writer-wins map replicated over `<node>.crdt`.
//!
//! One exchange per stream: the dialer sends `SYNC <json>`, the listener
//! merges it and answers `STATE <json>` with the merged state, which the
//! dialer merges in turn. Both replicas end up equal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use svrn_router::{Router, RouterStream};
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::host::{Handler, ServiceHost};
use super::wire::{read_line_within, write_line};
use super::{Service, ServiceContext, ServiceKind};
use crate::error::ServiceError;

/// Largest accepted `SYNC`/`STATE` line.
pub const MAX_STATE_LINE: usize = 1024 * 1024;

/// Highest Lamport counter accepted from a peer. Leaves room for local
/// writes without overflowing.
pub const MAX_CLOCK: u64 = 1 << 53;

/// Community URI scheme that lists bootstrap peers inline.
pub const COMMUNITY_SCHEME: &str = "svrn://";

/// Lamport timestamp. Ties on the counter are broken by node name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Entry {
    stamp: Stamp,
    /// `None` marks a removal.
    value: Option<String>,
}

/// Last-writer-wins map. `merge` is commutative, associative and idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwMap {
    clock: u64,
    entries: BTreeMap<String, Entry>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, node: &str, key: impl Into<String>, value: impl Into<String>) -> Result<(), ServiceError> {
        self.write(node, key.into(), Some(value.into()))
    }

    pub fn remove(&mut self, node: &str, key: impl Into<String>) -> Result<(), ServiceError> {
        self.write(node, key.into(), None)
    }

    fn write(&mut self, node: &str, key: String, value: Option<String>) -> Result<(), ServiceError> {
        let counter = self.clock.checked_add(1).ok_or(ServiceError::ClockExhausted)?;
        self.clock = counter;
        let stamp = Stamp {
            counter,
            node: node.to_string(),
        };
        self.entries.insert(key, Entry { stamp, value });
        Ok(())
    }

    /// Reject a peer state whose clock is out of range or behind its own entries.
    fn check(&self) -> Result<(), String> {
        if self.clock > MAX_CLOCK {
            return Err(format!("clock {} exceeds {}", self.clock, MAX_CLOCK));
        }
        match self.entries.iter().find(|(_, entry)| entry.stamp.counter > self.clock) {
            Some((key, entry)) => Err(format!(
                "entry '{}' counter {} is ahead of clock {}",
                truncate(key),
                entry.stamp.counter,
                self.clock
            )),
            None => Ok(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|entry| entry.value.as_deref())
    }

    /// Live (non-removed) key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.value.as_deref().map(|value| (key.as_str(), value)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Fold `other` into `self`. Returns how many keys changed.
    pub fn merge(&mut self, other: &LwwMap) -> usize {
        let mut changed = 0;
        for (key, theirs) in &other.entries {
            match self.entries.get(key) {
                Some(ours) if ours >= theirs => {}
                _ => {
                    self.entries.insert(key.clone(), theirs.clone());
                    changed += 1;
                }
            }
        }
        self.clock = self.clock.max(other.clock);
        changed
    }
}

/// Bootstrap peers named by a `svrn://node-a,node-b` community, minus
/// `node` itself. Other schemes carry no inline peers.
pub fn bootstrap_peers(community: &str, node: &str) -> Vec<String> {
    let Some(list) = community.strip_prefix(COMMUNITY_SCHEME) else {
        return Vec::new();
    };
    let mut peers: Vec<String> = Vec::new();
    for peer in list.split(',').map(str::trim) {
        if !peer.is_empty() && peer != node && !peers.iter().any(|p| p == peer) {
            peers.push(peer.to_string());
        }
    }
    peers
}

/// Run one SYNC exchange with `peer`, merging its state into `replica`.
/// Returns how many local keys changed.
pub async fn sync_with(
    router: &dyn Router,
    peer: &str,
    replica: &Mutex<LwwMap>,
    wait: Duration,
) -> Result<usize, ServiceError> {
    tokio::time::timeout(wait, sync_exchange(router, peer, replica, wait))
        .await
        .map_err(|_| ServiceError::Timeout(wait))?
}

async fn sync_exchange(
    router: &dyn Router,
    peer: &str,
    replica: &Mutex<LwwMap>,
    wait: Duration,
) -> Result<usize, ServiceError> {
    let destination = format!("{}.{}", peer, ServiceKind::Crdt);
    let mut stream = BufReader::new(router.dial(&destination).await?);

    let ours = encode(&replica.lock())?;
    write_line(&mut stream, &format!("SYNC {}", ours)).await?;

    let reply = read_line_within(&mut stream, MAX_STATE_LINE, wait)
        .await?
        .ok_or_else(|| ServiceError::Protocol("connection closed before STATE".to_string()))?;
    let theirs = match reply.strip_prefix("STATE ") {
        Some(json) => decode(json)?,
        None => return Err(ServiceError::Protocol(format!("unexpected reply '{}'", truncate(&reply)))),
    };
    let changed = replica.lock().merge(&theirs);
    debug!("Synced with {}: {} keys changed", peer, changed);
    Ok(changed)
}

fn encode(map: &LwwMap) -> Result<String, ServiceError> {
    serde_json::to_string(map).map_err(|e| ServiceError::Protocol(format!("cannot encode state: {}", e)))
}

fn decode(json: &str) -> Result<LwwMap, ServiceError> {
    parse_state(json).map_err(ServiceError::Protocol)
}

fn parse_state(json: &str) -> Result<LwwMap, String> {
    let state: LwwMap = serde_json::from_str(json).map_err(|e| format!("bad state: {}", e))?;
    state.check().map_err(|reason| format!("bad state: {}", reason))?;
    Ok(state)
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(64) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

struct Running {
    host: ServiceHost,
    bootstrap: Option<JoinHandle<()>>,
}

pub struct CrdtService {
    ctx: ServiceContext,
    replica: Arc<Mutex<LwwMap>>,
    running: Mutex<Option<Running>>,
}

impl CrdtService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            replica: Arc::new(Mutex::new(LwwMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Local write, stamped with this node's name.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), ServiceError> {
        self.replica.lock().set(&self.ctx.node, key, value)
    }

    pub fn remove(&self, key: impl Into<String>) -> Result<(), ServiceError> {
        self.replica.lock().remove(&self.ctx.node, key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.replica.lock().get(key).map(str::to_string)
    }

    pub fn snapshot(&self) -> LwwMap {
        self.replica.lock().clone()
    }

    /// Pull and push state with `peer` right now.
    pub async fn sync_with(&self, router: &dyn Router, peer: &str) -> Result<usize, ServiceError> {
        sync_with(router, peer, &self.replica, self.ctx.op_timeout).await
    }

    fn spawn_bootstrap(&self, router: Arc<dyn Router>, peers: Vec<String>) -> JoinHandle<()> {
        let replica = Arc::clone(&self.replica);
        let wait = self.ctx.op_timeout;
        tokio::spawn(
            async move {
                for peer in peers {
                    match sync_with(router.as_ref(), &peer, &replica, wait).await {
                        Ok(changed) => info!("Bootstrap sync with {} merged {} keys", peer, changed),
                        Err(e) => warn!("Bootstrap sync with {} failed: {}", peer, e),
                    }
                }
            }
            .instrument(self.ctx.span.clone()),
        )
    }
}

#[async_trait]
impl Service for CrdtService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Crdt
    }

    async fn start(&self, router: Arc<dyn Router>) -> Result<(), ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyStarted(ServiceKind::Crdt));
        }

        let inbound = router.listen(ServiceKind::Crdt.as_str()).await?;
        let handler = Arc::new(CrdtHandler {
            replica: Arc::clone(&self.replica),
            op_timeout: self.ctx.op_timeout,
        });

        let peers = self
            .ctx
            .community
            .as_deref()
            .map(|community| bootstrap_peers(community, &self.ctx.node))
            .unwrap_or_default();

        let mut slot = self.running.lock();
        if slot.is_some() {
            return Err(ServiceError::AlreadyStarted(ServiceKind::Crdt));
        }
        let host = ServiceHost::spawn(ServiceKind::Crdt, inbound, handler, self.ctx.span.clone());
        info!(parent: &self.ctx.span, "CRDT service listening on {}", host.destination());
        let bootstrap = (!peers.is_empty()).then(|| self.spawn_bootstrap(router, peers));
        *slot = Some(Running { host, bootstrap });
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let running = self.running.lock().take();
        let Some(Running { host, bootstrap }) = running else {
            return Ok(());
        };
        if let Some(task) = bootstrap {
            task.abort();
        }
        host.shutdown(self.ctx.op_timeout).await?;
        debug!(parent: &self.ctx.span, "CRDT service stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

struct CrdtHandler {
    replica: Arc<Mutex<LwwMap>>,
    op_timeout: Duration,
}

#[async_trait]
impl Handler for CrdtHandler {
    async fn handle(&self, stream: RouterStream) -> Result<(), ServiceError> {
        let mut stream = BufReader::new(stream);
        let Some(line) = read_line_within(&mut stream, MAX_STATE_LINE, self.op_timeout).await? else {
            return Ok(());
        };

        let Some(json) = line.strip_prefix("SYNC ") else {
            write_line(&mut stream, "ERR expected SYNC").await?;
            return Ok(());
        };
        let theirs = match parse_state(json) {
            Ok(theirs) => theirs,
            Err(reason) => {
                write_line(&mut stream, &format!("ERR {}", reason)).await?;
                return Ok(());
            }
        };

        let merged = {
            let mut replica = self.replica.lock();
            replica.merge(&theirs);
            encode(&replica)?
        };
        write_line(&mut stream, &format!("STATE {}", merged)).await
    }
}
