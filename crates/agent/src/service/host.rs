//! Host — the accept loop every listening service runs on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use svrn_router::{Inbound, RouterStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn, Instrument};

use super::ServiceKind;
use crate::error::ServiceError;

/// Serves one inbound stream.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, stream: RouterStream) -> Result<(), ServiceError>;
}

/// Owns a service's accept loop and the connection tasks it spawned.
pub struct ServiceHost {
    kind: ServiceKind,
    destination: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl ServiceHost {
    pub fn spawn<H: Handler>(kind: ServiceKind, mut inbound: Inbound, handler: Arc<H>, span: tracing::Span) -> Self {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let destination = inbound.destination().to_string();

        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        let accept_task = tokio::spawn(
            async move {
                loop {
                    let stream = tokio::select! {
                        _ = loop_cancel.cancelled() => break,
                        next = inbound.next() => match next {
                            Some(stream) => stream,
                            None => {
                                warn!("Listener for {} closed", kind);
                                break;
                            }
                        },
                    };

                    let peer = stream.peer().to_string();
                    let handler = Arc::clone(&handler);
                    let conn_cancel = loop_cancel.clone();
                    loop_tracker.spawn(
                        async move {
                            tokio::select! {
                                _ = conn_cancel.cancelled() => {}
                                result = handler.handle(stream) => {
                                    if let Err(e) = result {
                                        debug!("Connection from {} ended with error: {}", peer, e);
                                    }
                                }
                            }
                        }
                        .in_current_span(),
                    );
                }
                debug!("Accept loop for {} stopped", kind);
            }
            .instrument(span),
        );

        Self {
            kind,
            destination,
            cancel,
            tracker,
            accept_task,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting and wait up to `grace` for open connections to finish.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), ServiceError> {
        self.cancel.cancel();
        self.tracker.close();

        let accept_task = &mut self.accept_task;
        let tracker = &self.tracker;
        let drained = tokio::time::timeout(grace, async {
            let _ = accept_task.await;
            tracker.wait().await;
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => Err(ServiceError::ServiceStopError {
                kind: self.kind,
                reason: format!("connections still open after {:?}", grace),
            }),
        }
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svrn_router::fake::{FakeNetwork, FakeRouter};
    use svrn_router::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Upper;

    #[async_trait]
    impl Handler for Upper {
        async fn handle(&self, mut stream: RouterStream) -> Result<(), ServiceError> {
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf.to_ascii_uppercase()).await?;
            Ok(())
        }
    }

    struct Stall;

    #[async_trait]
    impl Handler for Stall {
        async fn handle(&self, _stream: RouterStream) -> Result<(), ServiceError> {
            std::future::pending::<Result<(), ServiceError>>().await
        }
    }

    #[tokio::test]
    async fn test_host_serves_and_shuts_down() {
        let network = FakeNetwork::new();
        let server = FakeRouter::new("node-b", network.clone());
        let client = FakeRouter::new("node-a", network);

        let inbound = server.listen("blob").await.unwrap();
        let host = ServiceHost::spawn(ServiceKind::Blob, inbound, Arc::new(Upper), tracing::Span::none());
        assert_eq!(host.destination(), "node-b.blob");

        let mut stream = client.dial("node-b.blob").await.unwrap();
        stream.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ABC");

        host.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stuck_connections() {
        let network = FakeNetwork::new();
        let server = FakeRouter::new("node-b", network.clone());
        let client = FakeRouter::new("node-a", network);

        let inbound = server.listen("crdt").await.unwrap();
        let host = ServiceHost::spawn(ServiceKind::Crdt, inbound, Arc::new(Stall), tracing::Span::none());
        let _stream = client.dial("node-b.crdt").await.unwrap();

        for _ in 0..50 {
            if host.active_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.active_connections(), 1);
        host.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
