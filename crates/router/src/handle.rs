//! Handle — the node's single connection to its overlay router.
//!
//! `RouterHandle::open` resolves the mode once: `Auto` spawns an
//! [`EmbeddedRouter`] on loopback, `External` dials a managed router with
//! backoff. Either way the handle then owns one control session named after
//! the node, and every later operation speaks the same protocol.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embedded::EmbeddedRouter;
use crate::error::{Result, RouterError};
use crate::mode::{join_host_port, RouterMode};
use crate::proto::{self, Reply, Request, ResultCode};
use crate::retry::RetryPolicy;
use crate::stream::{Inbound, RouterStream};
use crate::traits::{Router, RouterOpener};

/// Inbound streams buffered per listener before the accept loop waits.
const INBOUND_BACKLOG: usize = 16;

/// Delay between readiness checks of a freshly spawned embedded router.
const READY_PROBE: Duration = Duration::from_millis(50);

type Conn = BufReader<TcpStream>;

/// Knobs for opening and talking to a router.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Session nickname; services listen on `<node>.<service>`.
    pub node: String,
    /// How long an embedded router gets to answer its first handshake.
    pub start_timeout: Duration,
    /// Upper bound for any single network operation.
    pub op_timeout: Duration,
    /// Backoff for external connects, reconnects and listener recovery.
    pub retry: RetryPolicy,
}

impl RouterOptions {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            start_timeout: Duration::from_secs(10),
            op_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// State shared with background listener tasks.
struct Shared {
    node: String,
    op_timeout: Duration,
    retry: RetryPolicy,
    endpoint: RwLock<String>,
}

impl Shared {
    fn endpoint(&self) -> String {
        self.endpoint.read().clone()
    }
}

/// Real [`Router`] implementation for both modes.
pub struct RouterHandle {
    mode: RouterMode,
    shared: Arc<Shared>,
    start_timeout: Duration,
    control: Mutex<Option<Conn>>,
    embedded: Mutex<Option<EmbeddedRouter>>,
    listeners: CancellationToken,
    closed: AtomicBool,
    pings: AtomicU64,
}

impl RouterHandle {
    /// Bring the router up and create the node's control session.
    ///
    /// Fails with [`RouterError::StartTimeout`] when an embedded router does
    /// not become ready in time, or [`RouterError::Unreachable`] when an
    /// external one cannot be reached within the retry policy.
    pub async fn open(mode: RouterMode, options: RouterOptions) -> Result<Self> {
        info!("Opening router (mode={}, node={})", mode, options.node);

        let (embedded, endpoint, control) = match &mode {
            RouterMode::Auto => {
                let (router, control) = start_embedded(&options).await?;
                let endpoint = router.local_addr().to_string();
                (Some(router), endpoint, control)
            }
            RouterMode::External { host, port } => {
                let endpoint = join_host_port(host, *port);
                let control =
                    open_session_with_retry(&endpoint, &options.node, options.op_timeout, &options.retry).await?;
                (None, endpoint, control)
            }
        };

        info!("Router ready at {} (session {})", endpoint, options.node);
        Ok(Self {
            mode,
            shared: Arc::new(Shared {
                node: options.node,
                op_timeout: options.op_timeout,
                retry: options.retry,
                endpoint: RwLock::new(endpoint),
            }),
            start_timeout: options.start_timeout,
            control: Mutex::new(Some(control)),
            embedded: Mutex::new(embedded),
            listeners: CancellationToken::new(),
            closed: AtomicBool::new(false),
            pings: AtomicU64::new(0),
        })
    }

    /// Address of the router this handle talks to.
    pub fn endpoint(&self) -> String {
        self.shared.endpoint()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }
        Ok(())
    }

    fn options(&self) -> RouterOptions {
        RouterOptions {
            node: self.shared.node.clone(),
            start_timeout: self.start_timeout,
            op_timeout: self.shared.op_timeout,
            retry: self.shared.retry,
        }
    }
}

#[async_trait]
impl Router for RouterHandle {
    fn node(&self) -> &str {
        &self.shared.node
    }

    fn mode(&self) -> &RouterMode {
        &self.mode
    }

    async fn dial(&self, destination: &str) -> Result<RouterStream> {
        self.ensure_open()?;
        let op_timeout = self.shared.op_timeout;
        let mut conn = connect(&self.endpoint(), op_timeout).await?;
        let request = Request::StreamConnect {
            id: self.shared.node.clone(),
            destination: destination.to_string(),
        };
        expect_ok("dial", roundtrip(&mut conn, &request, "dial", op_timeout).await?)?;
        debug!("Dialed {}", destination);
        Ok(RouterStream::new(destination, conn))
    }

    async fn listen(&self, service: &str) -> Result<Inbound> {
        self.ensure_open()?;
        let destination = self.destination_for(service);
        let session = open_session(&self.endpoint(), &destination, self.shared.op_timeout).await?;

        let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
        let cancel = self.listeners.child_token();
        tokio::spawn(listen_loop(
            Arc::clone(&self.shared),
            destination.clone(),
            session,
            tx,
            cancel.clone(),
        ));

        info!("Listening on {}", destination);
        Ok(Inbound::new(destination, rx, Some(cancel.drop_guard())))
    }

    async fn check_health(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode.is_auto() {
            let embedded = self.embedded.lock().await;
            if !embedded.as_ref().is_some_and(EmbeddedRouter::is_running) {
                return Err(RouterError::Disconnected("embedded router stopped".to_string()));
            }
        }

        let mut control = self.control.lock().await;
        let conn = control
            .as_mut()
            .ok_or_else(|| RouterError::Disconnected("no control session".to_string()))?;

        let token = self.pings.fetch_add(1, Ordering::Relaxed).to_string();
        let result = match roundtrip(conn, &Request::Ping(token.clone()), "ping", self.shared.op_timeout).await {
            Ok(Reply::Pong(echo)) if echo == token => Ok(()),
            Ok(other) => Err(RouterError::Protocol(format!("unexpected reply to ping: {:?}", other))),
            Err(e) => Err(e),
        };
        if result.is_err() {
            // the control socket is no longer trustworthy
            *control = None;
        }
        result
    }

    async fn reconnect(&self) -> Result<()> {
        self.ensure_open()?;
        let mut control = self.control.lock().await;
        *control = None;

        if self.mode.is_auto() {
            let mut embedded = self.embedded.lock().await;
            if !embedded.as_ref().is_some_and(EmbeddedRouter::is_running) {
                warn!("Embedded router is gone, restarting it");
                if let Some(old) = embedded.take() {
                    old.shutdown();
                }
                let (router, conn) = start_embedded(&self.options()).await?;
                *self.shared.endpoint.write() = router.local_addr().to_string();
                *embedded = Some(router);
                *control = Some(conn);
                info!("Embedded router restarted at {}", self.endpoint());
                return Ok(());
            }
        }

        let conn = open_session_with_retry(
            &self.endpoint(),
            &self.shared.node,
            self.shared.op_timeout,
            &self.shared.retry,
        )
        .await?;
        *control = Some(conn);
        info!("Router control session re-established");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.listeners.cancel();
        self.control.lock().await.take();
        if let Some(router) = self.embedded.lock().await.take() {
            router.shutdown();
        }
        info!("Router closed (node={})", self.shared.node);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.listeners.cancel();
    }
}

/// [`RouterOpener`] producing real [`RouterHandle`]s.
#[derive(Debug, Clone)]
pub struct HandleOpener {
    options: RouterOptions,
}

impl HandleOpener {
    pub fn new(options: RouterOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RouterOpener for HandleOpener {
    async fn open(&self, mode: &RouterMode) -> Result<Arc<dyn Router>> {
        let handle = RouterHandle::open(mode.clone(), self.options.clone()).await?;
        Ok(Arc::new(handle))
    }
}

/// Spawn an embedded router and wait until it accepts the node's session.
async fn start_embedded(options: &RouterOptions) -> Result<(EmbeddedRouter, Conn)> {
    tokio::time::timeout(options.start_timeout, boot_embedded(options))
        .await
        .map_err(|_| RouterError::StartTimeout(options.start_timeout))?
}

async fn boot_embedded(options: &RouterOptions) -> Result<(EmbeddedRouter, Conn)> {
    // Leave the dialer time to hear TIMEOUT before its own deadline fires.
    let accept_wait = options.op_timeout.mul_f32(0.8);
    let router = EmbeddedRouter::spawn(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), accept_wait).await?;
    let endpoint = router.local_addr().to_string();

    loop {
        match open_session(&endpoint, &options.node, options.op_timeout).await {
            Ok(conn) => return Ok((router, conn)),
            Err(e @ RouterError::Rejected { .. }) => return Err(e),
            Err(e) => {
                debug!("Embedded router not ready yet: {}", e);
                tokio::time::sleep(READY_PROBE).await;
            }
        }
    }
}

/// TCP connect plus `HELLO`, bounded by `op_timeout` each.
async fn connect(endpoint: &str, op_timeout: Duration) -> Result<Conn> {
    let stream = tokio::time::timeout(op_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| RouterError::Timeout {
            op: "connect",
            after: op_timeout,
        })??;
    stream.set_nodelay(true)?;

    let mut conn = BufReader::new(stream);
    expect_ok("hello", roundtrip(&mut conn, &Request::hello(), "hello", op_timeout).await?)?;
    Ok(conn)
}

/// Send one command and read its reply line.
async fn roundtrip(conn: &mut Conn, request: &Request, op: &'static str, op_timeout: Duration) -> Result<Reply> {
    tokio::time::timeout(op_timeout, exchange(conn, request, op))
        .await
        .map_err(|_| RouterError::Timeout { op, after: op_timeout })?
}

async fn exchange(conn: &mut Conn, request: &Request, op: &'static str) -> Result<Reply> {
    conn.write_all(request.encode().as_bytes()).await?;
    match proto::read_line(conn).await? {
        Some(line) => Reply::parse(&line),
        None => Err(RouterError::Disconnected(format!(
            "router closed the connection during {}",
            op
        ))),
    }
}

fn expect_ok(op: &'static str, reply: Reply) -> Result<Reply> {
    let code = reply.result();
    if code.is_ok() {
        Ok(reply)
    } else {
        Err(RouterError::Rejected { op, code })
    }
}

/// New connection holding session `id` for as long as it stays open.
async fn open_session(endpoint: &str, id: &str, op_timeout: Duration) -> Result<Conn> {
    let mut conn = connect(endpoint, op_timeout).await?;
    let request = Request::SessionCreate { id: id.to_string() };
    expect_ok("session", roundtrip(&mut conn, &request, "session", op_timeout).await?)?;
    Ok(conn)
}

async fn open_session_with_retry(
    endpoint: &str,
    id: &str,
    op_timeout: Duration,
    retry: &RetryPolicy,
) -> Result<Conn> {
    let mut last_error = None;

    for attempt in 1..=retry.max_attempts {
        match open_session(endpoint, id, op_timeout).await {
            Ok(conn) => {
                if attempt > 1 {
                    info!("Connected to router at {} after {} attempts", endpoint, attempt);
                }
                return Ok(conn);
            }
            Err(e) => {
                warn!(
                    "Router connect attempt {}/{} to {} failed: {}",
                    attempt, retry.max_attempts, endpoint, e
                );
                last_error = Some(e);
            }
        }

        if attempt < retry.max_attempts {
            tokio::time::sleep(retry.delay_for(attempt)).await;
        }
    }

    // A router that answered with a refusal is reachable; report what it said.
    match last_error {
        Some(rejected @ RouterError::Rejected { .. }) => Err(rejected),
        other => Err(RouterError::Unreachable {
            endpoint: endpoint.to_string(),
            attempts: retry.max_attempts,
            last_error: other.map(|e| e.to_string()).unwrap_or_default(),
        }),
    }
}

/// Feed `tx` with inbound streams for `destination` until cancelled,
/// re-creating the session whenever the router drops it.
async fn listen_loop(
    shared: Arc<Shared>,
    destination: String,
    mut session: Conn,
    tx: mpsc::Sender<RouterStream>,
    cancel: CancellationToken,
) {
    loop {
        let lost = serve_accepts(&shared, &destination, &mut session, &tx, &cancel).await;
        if cancel.is_cancelled() || tx.is_closed() {
            break;
        }
        warn!("Listener {} lost its session: {}", destination, lost);

        let mut attempt = 0u32;
        session = loop {
            match open_session(&shared.endpoint(), &destination, shared.op_timeout).await {
                Ok(conn) => break conn,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    debug!("Listener {} session retry {} failed: {}", destination, attempt, e);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Listener {} stopped", destination);
                    return;
                }
                _ = tokio::time::sleep(shared.retry.delay_for(attempt)) => {}
            }
        };
        info!("Listener {} session restored", destination);
    }
    debug!("Listener {} stopped", destination);
}

/// Accept streams until the session is lost or the listener is dropped.
async fn serve_accepts(
    shared: &Shared,
    destination: &str,
    session: &mut Conn,
    tx: &mpsc::Sender<RouterStream>,
    cancel: &CancellationToken,
) -> RouterError {
    let mut failures = 0u32;
    loop {
        let endpoint = shared.endpoint();
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return RouterError::Closed,
            _ = tx.closed() => return RouterError::Closed,
            lost = session_lost(session) => return lost,
            accepted = accept_one(&endpoint, destination, shared.op_timeout) => accepted,
        };

        match accepted {
            Ok(stream) => {
                failures = 0;
                debug!("Inbound stream on {} from {}", destination, stream.peer());
                if tx.send(stream).await.is_err() {
                    return RouterError::Closed;
                }
            }
            Err(e @ RouterError::Rejected { code: ResultCode::InvalidId, .. }) => return e,
            Err(e) => {
                failures += 1;
                if failures >= shared.retry.max_attempts {
                    return e;
                }
                debug!("Accept on {} failed ({}/{}): {}", destination, failures, shared.retry.max_attempts, e);
                tokio::select! {
                    _ = cancel.cancelled() => return RouterError::Closed,
                    _ = tokio::time::sleep(shared.retry.delay_for(failures)) => {}
                }
            }
        }
    }
}

/// Resolves once the router closes a session socket. Nothing is ever sent on
/// it after `SESSION STATUS`.
async fn session_lost(session: &mut Conn) -> RouterError {
    match proto::read_line(session).await {
        Ok(None) => RouterError::Disconnected("session closed by router".to_string()),
        Ok(Some(line)) => RouterError::Protocol(format!("unexpected line on session: {}", line)),
        Err(e) => e,
    }
}

async fn accept_one(endpoint: &str, destination: &str, op_timeout: Duration) -> Result<RouterStream> {
    let mut conn = connect(endpoint, op_timeout).await?;
    let request = Request::StreamAccept {
        id: destination.to_string(),
    };
    expect_ok("accept", roundtrip(&mut conn, &request, "accept", op_timeout).await?)?;

    // Blocks until a peer dials in.
    let peer = proto::read_line(&mut conn)
        .await?
        .ok_or_else(|| RouterError::Disconnected("accept closed before a peer arrived".to_string()))?;
    Ok(RouterStream::new(peer, conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn options(node: &str) -> RouterOptions {
        RouterOptions {
            node: node.to_string(),
            start_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(3, Duration::from_millis(20), Duration::from_millis(100)),
        }
    }

    async fn echo_once(mut inbound: Inbound) {
        let mut stream = inbound.accept(Duration::from_secs(5)).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    async fn dial_until_ready(router: &RouterHandle, destination: &str) -> RouterStream {
        for _ in 0..100 {
            if let Ok(stream) = router.dial(destination).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        panic!("{} never became reachable", destination);
    }

    #[tokio::test]
    async fn test_auto_open_dial_listen_roundtrip() {
        let router = RouterHandle::open(RouterMode::Auto, options("node-a")).await.unwrap();
        assert_eq!(router.destination_for("echo"), "node-a.echo");

        let inbound = router.listen("echo").await.unwrap();
        assert_eq!(inbound.destination(), "node-a.echo");
        let server = tokio::spawn(echo_once(inbound));

        let mut stream = router.dial("node-a.echo").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();

        router.check_health().await.unwrap();
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_external_unreachable_after_retries() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mode = RouterMode::External {
            host: "127.0.0.1".to_string(),
            port,
        };
        let mut opts = options("node-a");
        opts.retry = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10));

        match RouterHandle::open(mode, opts).await {
            Err(RouterError::Unreachable { attempts, endpoint, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(endpoint, format!("127.0.0.1:{}", port));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[tokio::test]
    async fn test_external_router_shared_by_two_nodes() {
        let external = EmbeddedRouter::spawn("127.0.0.1:0".parse().unwrap(), Duration::from_millis(800))
            .await
            .unwrap();
        let mode = RouterMode::External {
            host: "127.0.0.1".to_string(),
            port: external.local_addr().port(),
        };

        let a = RouterHandle::open(mode.clone(), options("node-a")).await.unwrap();
        let b = RouterHandle::open(mode, options("node-b")).await.unwrap();
        assert_eq!(a.endpoint(), b.endpoint());

        let server = tokio::spawn(echo_once(b.listen("echo").await.unwrap()));
        let mut stream = a.dial("node-b.echo").await.unwrap();
        stream.write_all(b"abcd").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        server.await.unwrap();

        // a second handle with the same nickname cannot claim the session
        let mut opts = options("node-a");
        opts.retry = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10));
        let dup = RouterHandle::open(a.mode().clone(), opts).await;
        assert!(
            matches!(
                dup,
                Err(RouterError::Rejected {
                    op: "session",
                    code: ResultCode::DuplicatedId
                })
            ),
            "{:?}",
            dup.err()
        );
    }

    #[tokio::test]
    async fn test_dial_unknown_destination_is_rejected() {
        let router = RouterHandle::open(RouterMode::Auto, options("node-a")).await.unwrap();
        let err = router.dial("node-z.blob").await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::Rejected {
                op: "dial",
                code: ResultCode::CantReachPeer
            }
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_listeners() {
        let router = RouterHandle::open(RouterMode::Auto, options("node-a")).await.unwrap();
        let mut inbound = router.listen("blob").await.unwrap();

        router.close().await.unwrap();
        router.close().await.unwrap();
        assert!(router.is_closed());

        let next = tokio::time::timeout(Duration::from_secs(2), inbound.next()).await.unwrap();
        assert!(next.is_none());
        assert!(matches!(router.dial("node-a.blob").await, Err(RouterError::Closed)));
        assert!(matches!(router.check_health().await, Err(RouterError::Closed)));
    }

    #[tokio::test]
    async fn test_reconnect_restarts_dead_embedded_router() {
        let router = RouterHandle::open(RouterMode::Auto, options("node-a")).await.unwrap();
        let inbound = router.listen("echo").await.unwrap();
        let before = router.endpoint();

        if let Some(embedded) = router.embedded.lock().await.as_ref() {
            embedded.shutdown();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = router.check_health().await.unwrap_err();
        assert!(err.is_connection_loss());

        router.reconnect().await.unwrap();
        router.check_health().await.unwrap();
        assert_ne!(router.endpoint(), before);

        // the listener finds the new router on its own
        let server = tokio::spawn(echo_once(inbound));
        let mut stream = dial_until_ready(&router, "node-a.echo").await;
        stream.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
        server.await.unwrap();
    }
}
