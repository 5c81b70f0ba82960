//! Blob service — content-addressed storage reachable at `<node>.blob`.
//!
//! Requests on one stream, each answered before the next is read:
//!
//! ```text
//! PUT <len>\n<len bytes>   ->  OK <sha256-hex>
//! GET <sha256-hex>         ->  OK <len>\n<len bytes>  |  MISSING
//! anything else            ->  ERR <reason>
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use svrn_router::{Router, RouterStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use super::host::{Handler, ServiceHost};
use super::wire::{read_line_within, write_line};
use super::{Service, ServiceContext, ServiceKind};
use crate::error::ServiceError;

/// Largest accepted blob.
pub const MAX_BLOB_SIZE: usize = 16 * 1024 * 1024;

const MAX_LINE: usize = 128;

/// In-memory store keyed by the SHA-256 of the content. Clones share data.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    blobs: Arc<DashMap<String, Bytes>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowercase hex SHA-256 of `data`.
    pub fn address(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Store `data`, returning its address. Storing the same content twice is
    /// a no-op.
    pub fn put(&self, data: Bytes) -> String {
        let hash = Self::address(&data);
        self.blobs.entry(hash.clone()).or_insert(data);
        hash
    }

    pub fn get(&self, hash: &str) -> Option<Bytes> {
        self.blobs.get(hash).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blobs.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

pub struct BlobService {
    ctx: ServiceContext,
    store: BlobStore,
    host: Mutex<Option<ServiceHost>>,
}

impl BlobService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self::with_store(ctx, BlobStore::new())
    }

    pub fn with_store(ctx: ServiceContext, store: BlobStore) -> Self {
        Self {
            ctx,
            store,
            host: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }
}

#[async_trait]
impl Service for BlobService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Blob
    }

    async fn start(&self, router: Arc<dyn Router>) -> Result<(), ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyStarted(ServiceKind::Blob));
        }

        let inbound = router.listen(ServiceKind::Blob.as_str()).await?;
        let handler = Arc::new(BlobHandler {
            store: self.store.clone(),
            op_timeout: self.ctx.op_timeout,
        });

        let mut slot = self.host.lock();
        if slot.is_some() {
            return Err(ServiceError::AlreadyStarted(ServiceKind::Blob));
        }
        let host = ServiceHost::spawn(ServiceKind::Blob, inbound, handler, self.ctx.span.clone());
        info!(parent: &self.ctx.span, "Blob service listening on {}", host.destination());
        *slot = Some(host);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let host = self.host.lock().take();
        match host {
            Some(host) => {
                host.shutdown(self.ctx.op_timeout).await?;
                debug!(parent: &self.ctx.span, "Blob service stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.host.lock().is_some()
    }
}

struct BlobHandler {
    store: BlobStore,
    op_timeout: Duration,
}

#[async_trait]
impl Handler for BlobHandler {
    async fn handle(&self, stream: RouterStream) -> Result<(), ServiceError> {
        let mut stream = BufReader::new(stream);

        loop {
            let line = match read_line_within(&mut stream, MAX_LINE, self.op_timeout).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(ServiceError::Timeout(idle)) => {
                    debug!("Closing blob connection idle for {:?}", idle);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("PUT"), Some(len), None) => {
                    let len = match len.parse::<usize>() {
                        Ok(len) if len <= MAX_BLOB_SIZE => len,
                        Ok(_) => {
                            // The payload can't be skipped safely, so the stream ends here.
                            write_line(&mut stream, &format!("ERR blob exceeds {} bytes", MAX_BLOB_SIZE)).await?;
                            return Ok(());
                        }
                        Err(_) => {
                            write_line(&mut stream, "ERR bad length").await?;
                            return Ok(());
                        }
                    };
                    let mut data = vec![0u8; len];
                    tokio::time::timeout(self.op_timeout, stream.read_exact(&mut data))
                        .await
                        .map_err(|_| ServiceError::Timeout(self.op_timeout))??;
                    let hash = self.store.put(Bytes::from(data));
                    debug!("Stored blob {} ({} bytes)", hash, len);
                    write_line(&mut stream, &format!("OK {}", hash)).await?;
                }
                (Some("GET"), Some(hash), None) => match self.store.get(hash) {
                    Some(data) => {
                        write_line(&mut stream, &format!("OK {}", data.len())).await?;
                        stream.write_all(&data).await?;
                        stream.flush().await?;
                    }
                    None => write_line(&mut stream, "MISSING").await?,
                },
                _ => write_line(&mut stream, "ERR unknown command").await?,
            }
        }
    }
}

fn blob_destination(node: &str) -> String {
    format!("{}.{}", node, ServiceKind::Blob)
}

fn remote_error(reply: &str) -> ServiceError {
    ServiceError::Protocol(format!("unexpected reply '{}'", reply))
}

/// Upload `data` to `node`'s blob service. Returns the address the remote
/// confirmed, which always equals [`BlobStore::address`] of `data`.
pub async fn push(router: &dyn Router, node: &str, data: &[u8], wait: Duration) -> Result<String, ServiceError> {
    if data.len() > MAX_BLOB_SIZE {
        return Err(ServiceError::Protocol(format!("blob exceeds {} bytes", MAX_BLOB_SIZE)));
    }

    tokio::time::timeout(wait, put_exchange(router, node, data, wait))
        .await
        .map_err(|_| ServiceError::Timeout(wait))?
}

async fn put_exchange(router: &dyn Router, node: &str, data: &[u8], wait: Duration) -> Result<String, ServiceError> {
    let mut stream = BufReader::new(router.dial(&blob_destination(node)).await?);
    write_line(&mut stream, &format!("PUT {}", data.len())).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    let reply = read_line_within(&mut stream, MAX_LINE, wait)
        .await?
        .ok_or_else(|| ServiceError::Protocol("connection closed before reply".to_string()))?;
    let expected = BlobStore::address(data);
    match reply.strip_prefix("OK ") {
        Some(hash) if hash == expected => Ok(expected),
        Some(hash) => Err(ServiceError::Protocol(format!("remote stored {} as {}", expected, hash))),
        None => Err(remote_error(&reply)),
    }
}

/// Download `hash` from `node`. `Ok(None)` when the remote does not have it.
/// Content that does not hash to `hash` is rejected.
pub async fn fetch(router: &dyn Router, node: &str, hash: &str, wait: Duration) -> Result<Option<Bytes>, ServiceError> {
    tokio::time::timeout(wait, get_exchange(router, node, hash, wait))
        .await
        .map_err(|_| ServiceError::Timeout(wait))?
}

async fn get_exchange(router: &dyn Router, node: &str, hash: &str, wait: Duration) -> Result<Option<Bytes>, ServiceError> {
    let mut stream = BufReader::new(router.dial(&blob_destination(node)).await?);
    write_line(&mut stream, &format!("GET {}", hash)).await?;

    let reply = read_line_within(&mut stream, MAX_LINE, wait)
        .await?
        .ok_or_else(|| ServiceError::Protocol("connection closed before reply".to_string()))?;
    if reply == "MISSING" {
        return Ok(None);
    }
    let len = reply
        .strip_prefix("OK ")
        .and_then(|len| len.parse::<usize>().ok())
        .ok_or_else(|| remote_error(&reply))?;
    if len > MAX_BLOB_SIZE {
        return Err(ServiceError::Protocol(format!("remote blob of {} bytes is too large", len)));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    if BlobStore::address(&data) != hash {
        return Err(ServiceError::Protocol(format!("content does not match {}", hash)));
    }
    Ok(Some(Bytes::from(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::wire::read_line;
    use svrn_router::fake::{FakeNetwork, FakeRouter};

    const WAIT: Duration = Duration::from_secs(2);

    fn service(node: &str) -> BlobService {
        BlobService::new(ServiceContext::new(node, WAIT))
    }

    #[test]
    fn test_store_is_content_addressed() {
        let store = BlobStore::new();
        let a = store.put(Bytes::from_static(b"hello"));
        let b = store.put(Bytes::from_static(b"hello"));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(
            a,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(store.get(&a).as_deref(), Some(&b"hello"[..]));
        assert!(!store.contains("00"));
    }

    #[tokio::test]
    async fn test_push_then_fetch_over_router() {
        let network = FakeNetwork::new();
        let server: Arc<dyn Router> = Arc::new(FakeRouter::new("node-b", network.clone()));
        let client = FakeRouter::new("node-a", network);

        let blobs = service("node-b");
        blobs.start(server).await.unwrap();

        let hash = push(&client, "node-b", b"some payload", WAIT).await.unwrap();
        assert!(blobs.store().contains(&hash));

        let data = fetch(&client, "node-b", &hash, WAIT).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"some payload"[..]));

        let missing = fetch(&client, "node-b", &BlobStore::address(b"other"), WAIT)
            .await
            .unwrap();
        assert!(missing.is_none());

        blobs.stop().await.unwrap();
        assert!(!blobs.is_running());
    }

    #[tokio::test]
    async fn test_oversize_put_rejected() {
        let network = FakeNetwork::new();
        let server: Arc<dyn Router> = Arc::new(FakeRouter::new("node-b", network.clone()));
        let client = FakeRouter::new("node-a", network);
        let blobs = service("node-b");
        blobs.start(server).await.unwrap();

        let mut stream = BufReader::new(client.dial("node-b.blob").await.unwrap());
        write_line(&mut stream, &format!("PUT {}", MAX_BLOB_SIZE + 1)).await.unwrap();
        let reply = read_line(&mut stream, MAX_LINE).await.unwrap().unwrap();
        assert!(reply.starts_with("ERR"));
        assert!(blobs.store().is_empty());
        blobs.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_gets_err() {
        let network = FakeNetwork::new();
        let server: Arc<dyn Router> = Arc::new(FakeRouter::new("node-b", network.clone()));
        let client = FakeRouter::new("node-a", network);
        let blobs = service("node-b");
        blobs.start(server).await.unwrap();

        let mut stream = BufReader::new(client.dial("node-b.blob").await.unwrap());
        write_line(&mut stream, "DELETE abc").await.unwrap();
        let reply = read_line(&mut stream, MAX_LINE).await.unwrap().unwrap();
        assert_eq!(reply, "ERR unknown command");
        blobs.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let network = FakeNetwork::new();
        let server: Arc<dyn Router> = Arc::new(FakeRouter::new("node-b", network.clone()));
        let client = FakeRouter::new("node-a", network);
        let blobs = BlobService::new(ServiceContext::new("node-b", Duration::from_millis(100)));
        blobs.start(server).await.unwrap();

        let mut stream = BufReader::new(client.dial("node-b.blob").await.unwrap());
        write_line(&mut stream, "GET 00").await.unwrap();
        assert_eq!(read_line(&mut stream, MAX_LINE).await.unwrap().as_deref(), Some("MISSING"));

        // Nothing more is sent; the server hangs up after its idle timeout.
        let closed = tokio::time::timeout(WAIT, read_line(&mut stream, MAX_LINE)).await.unwrap();
        assert_eq!(closed.unwrap(), None);
        blobs.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_when_idle() {
        let network = FakeNetwork::new();
        let router: Arc<dyn Router> = Arc::new(FakeRouter::new("node-b", network));
        let blobs = service("node-b");

        blobs.stop().await.unwrap();
        blobs.start(router.clone()).await.unwrap();
        assert!(blobs.is_running());
        assert!(matches!(
            blobs.start(router).await,
            Err(ServiceError::AlreadyStarted(ServiceKind::Blob))
        ));
        blobs.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_to_absent_node_fails() {
        let network = FakeNetwork::new();
        let client = FakeRouter::new("node-a", network);
        let err = push(&client, "nobody", b"x", WAIT).await.unwrap_err();
        assert!(matches!(err, ServiceError::Router(_)));
    }
}
