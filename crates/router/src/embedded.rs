//! Embedded — the in-process router started in `Auto` mode.
//!
//! It speaks the same SAM subset as an external router over loopback TCP, so
//! `RouterHandle` has a single client code path for both modes. Destinations
//! are session ids; a `STREAM CONNECT` is matched with a pending
//! `STREAM ACCEPT` on the target session and the two sockets are spliced.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RouterError};
use crate::proto::{self, negotiate, Reply, Request, ResultCode};

/// Pending `STREAM ACCEPT` sockets per session.
const ACCEPT_QUEUE: usize = 64;

type Waiter = BufReader<TcpStream>;

struct Session {
    waiters_tx: mpsc::Sender<Waiter>,
    waiters_rx: Mutex<mpsc::Receiver<Waiter>>,
}

impl Session {
    fn new() -> Self {
        let (waiters_tx, waiters_rx) = mpsc::channel(ACCEPT_QUEUE);
        Self {
            waiters_tx,
            waiters_rx: Mutex::new(waiters_rx),
        }
    }
}

#[derive(Default)]
struct Sessions {
    map: DashMap<String, Arc<Session>>,
}

impl Sessions {
    /// Register `id`; `None` when another live session already holds it.
    fn create(self: &Arc<Self>, id: &str) -> Option<SessionGuard> {
        match self.map.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let session = Arc::new(Session::new());
                slot.insert(Arc::clone(&session));
                Some(SessionGuard {
                    sessions: Arc::clone(self),
                    id: id.to_string(),
                    session,
                })
            }
        }
    }

    fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.map.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

/// Removes its session when the owning control connection goes away.
struct SessionGuard {
    sessions: Arc<Sessions>,
    id: String,
    session: Arc<Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions
            .map
            .remove_if(&self.id, |_, s| Arc::ptr_eq(s, &self.session));
        debug!("Session {} closed", self.id);
    }
}

/// A running in-process router.
pub struct EmbeddedRouter {
    addr: SocketAddr,
    sessions: Arc<Sessions>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl EmbeddedRouter {
    /// Bind `bind` and start serving. `accept_wait` bounds how long a
    /// `STREAM CONNECT` waits for the target to have a pending accept.
    pub async fn spawn(bind: SocketAddr, accept_wait: Duration) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let sessions = Arc::new(Sessions::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&sessions),
            shutdown.clone(),
            accept_wait,
        ));

        info!("Embedded router listening on {}", addr);
        Ok(Self {
            addr,
            sessions,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.map.len()
    }

    /// Stop accepting and tear down every connection. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Embedded router on {} shutting down", self.addr);
        }
        self.shutdown.cancel();
        self.task.abort();
    }
}

impl Drop for EmbeddedRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: Arc<Sessions>,
    shutdown: CancellationToken,
    accept_wait: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let sessions = Arc::clone(&sessions);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let conn_shutdown = shutdown.clone();
                        tokio::select! {
                            _ = conn_shutdown.cancelled() => {}
                            result = handle_connection(stream, sessions, shutdown, accept_wait) => {
                                if let Err(e) = result {
                                    debug!("Router connection from {} ended: {}", peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Embedded router accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Embedded router accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    sessions: Arc<Sessions>,
    shutdown: CancellationToken,
    accept_wait: Duration,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = BufReader::new(stream);

    let Some(first) = proto::read_line(&mut conn).await? else {
        return Ok(());
    };
    match Request::parse(&first)? {
        Request::Hello { min, max } => {
            let version = negotiate(&min, &max);
            let result = if version.is_some() { ResultCode::Ok } else { ResultCode::NoVersion };
            send(&mut conn, &Reply::Hello { result, version: version.map(str::to_string) }).await?;
            if version.is_none() {
                return Ok(());
            }
        }
        other => {
            send(&mut conn, &Reply::stream_err(ResultCode::I2pError, "HELLO required")).await?;
            return Err(RouterError::Protocol(format!("expected HELLO, got {:?}", other)));
        }
    }

    // Held for as long as this connection lives.
    let mut session: Option<SessionGuard> = None;

    loop {
        let Some(line) = proto::read_line(&mut conn).await? else {
            return Ok(());
        };

        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                send(&mut conn, &Reply::stream_err(ResultCode::I2pError, e.to_string())).await?;
                continue;
            }
        };

        match request {
            Request::Ping(text) => send(&mut conn, &Reply::Pong(text)).await?,
            Request::Hello { .. } => {
                let reply = Reply::Hello {
                    result: ResultCode::Ok,
                    version: Some(proto::VERSION.to_string()),
                };
                send(&mut conn, &reply).await?;
            }
            Request::SessionCreate { id } => {
                let reply = if session.is_some() {
                    Reply::SessionStatus {
                        result: ResultCode::I2pError,
                        destination: None,
                        message: Some("connection already owns a session".to_string()),
                    }
                } else if let Some(guard) = sessions.create(&id) {
                    debug!("Session {} created", id);
                    session = Some(guard);
                    Reply::SessionStatus {
                        result: ResultCode::Ok,
                        destination: Some(id),
                        message: None,
                    }
                } else {
                    Reply::SessionStatus {
                        result: ResultCode::DuplicatedId,
                        destination: None,
                        message: None,
                    }
                };
                send(&mut conn, &reply).await?;
            }
            Request::StreamAccept { id } => {
                if session.is_some() {
                    send(&mut conn, &Reply::stream_err(ResultCode::I2pError, "accept needs its own connection")).await?;
                    continue;
                }
                let Some(target) = sessions.get(&id) else {
                    send(&mut conn, &Reply::stream_err(ResultCode::InvalidId, format!("no session {}", id))).await?;
                    continue;
                };
                send(&mut conn, &Reply::stream_ok()).await?;
                // The socket now belongs to the session's accept queue.
                if target.waiters_tx.send(conn).await.is_err() {
                    debug!("Session {} closed before accept could be queued", id);
                }
                return Ok(());
            }
            Request::StreamConnect { id, destination } => {
                if session.is_some() {
                    send(&mut conn, &Reply::stream_err(ResultCode::I2pError, "connect needs its own connection")).await?;
                    continue;
                }
                if sessions.get(&id).is_none() {
                    send(&mut conn, &Reply::stream_err(ResultCode::InvalidId, format!("no session {}", id))).await?;
                    continue;
                }
                let Some(target) = sessions.get(&destination) else {
                    send(&mut conn, &Reply::stream_err(ResultCode::CantReachPeer, format!("unknown destination {}", destination))).await?;
                    continue;
                };

                let mut acceptor = match next_live_waiter(&target, accept_wait).await {
                    Ok(acceptor) => acceptor,
                    Err(code) => {
                        send(&mut conn, &Reply::stream_err(code, format!("{} is not accepting", destination))).await?;
                        continue;
                    }
                };

                acceptor.write_all(format!("{}\n", id).as_bytes()).await?;
                send(&mut conn, &Reply::stream_ok()).await?;
                debug!("Spliced stream {} -> {}", id, destination);

                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    copied = tokio::io::copy_bidirectional(&mut conn, &mut acceptor) => {
                        if let Ok((up, down)) = copied {
                            debug!("Stream {} -> {} closed ({} bytes up, {} down)", id, destination, up, down);
                        }
                    }
                }
                return Ok(());
            }
        }
    }
}

/// Pop pending accepts until one whose socket is still open turns up.
async fn next_live_waiter(target: &Session, wait: Duration) -> std::result::Result<Waiter, ResultCode> {
    let mut queue = target.waiters_rx.lock().await;
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, queue.recv()).await {
            Ok(Some(waiter)) if is_alive(&waiter) => return Ok(waiter),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(ResultCode::CantReachPeer),
            Err(_) => return Err(ResultCode::Timeout),
        }
    }
}

/// An acceptor never sends before it has been handed a peer, so a readable
/// socket here means it hung up.
fn is_alive(waiter: &Waiter) -> bool {
    let mut peek = [0u8; 1];
    matches!(
        waiter.get_ref().try_read(&mut peek),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
    )
}

async fn send(conn: &mut BufReader<TcpStream>, reply: &Reply) -> Result<()> {
    conn.write_all(reply.encode().as_bytes()).await?;
    Ok(())
}
