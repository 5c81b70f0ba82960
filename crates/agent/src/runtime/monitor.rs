//! Monitor — periodic router health checks with bounded reconnects.

use std::sync::Arc;
use std::time::Duration;

use svrn_router::{RetryPolicy, Router};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::health::HealthCell;
use crate::state::{AgentState, StateCell};

/// Pings the router every `interval`. A failed ping marks the router
/// Degraded and triggers up to `policy.max_attempts` reconnects; running out
/// marks it Unhealthy and moves the agent to Failed.
pub struct HealthMonitor {
    router: Arc<dyn Router>,
    health: Arc<HealthCell>,
    state: Arc<StateCell>,
    interval: Duration,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        router: Arc<dyn Router>,
        health: Arc<HealthCell>,
        state: Arc<StateCell>,
        interval: Duration,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            router,
            health,
            state,
            interval,
            policy,
            cancel,
        }
    }

    pub fn spawn(self, span: tracing::Span) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(span))
    }

    pub async fn run(self) {
        info!("Starting router health monitoring (interval: {:?})", self.interval);

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.check().await {
                        break;
                    }
                }
            }
        }

        info!("Router health monitoring stopped");
    }

    /// One health round. False once the router is given up on.
    async fn check(&self) -> bool {
        match self.router.check_health().await {
            Ok(()) => {
                debug!("Router health check passed");
                self.health.mark_healthy();
                true
            }
            Err(e) if e.is_connection_loss() => {
                warn!("Router health check failed: {}", e);
                self.health.mark_degraded();
                self.recover().await
            }
            Err(e) => {
                // The router answered; the next round checks again.
                warn!("Router refused health check: {}", e);
                self.health.mark_degraded();
                true
            }
        }
    }

    async fn recover(&self) -> bool {
        for attempt in 1..=self.policy.max_attempts {
            match self.router.reconnect().await {
                Ok(()) => {
                    info!("Router reconnected after {} attempt(s)", attempt);
                    self.health.mark_healthy();
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Router reconnect attempt {}/{} failed: {}",
                        attempt, self.policy.max_attempts, e
                    );
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = time::sleep(self.policy.delay_for(attempt)) => {}
                }
            }
        }

        self.health.mark_unhealthy();
        error!(
            "Router unreachable after {} reconnect attempts; marking agent failed",
            self.policy.max_attempts
        );
        self.state.transition(AgentState::Failed);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::health::HealthStatus;
    use svrn_router::fake::{FakeNetwork, FakeRouter};

    fn running_state() -> Arc<StateCell> {
        let state = Arc::new(StateCell::new());
        state.transition(AgentState::Starting);
        state.transition(AgentState::Running);
        state
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(10))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_healthy_router_marked_healthy() {
        let router = Arc::new(FakeRouter::new("node-a", FakeNetwork::new()));
        let health = Arc::new(HealthCell::new());
        let cancel = CancellationToken::new();
        let task = HealthMonitor::new(
            router,
            health.clone(),
            running_state(),
            Duration::from_millis(10),
            policy(),
            cancel.clone(),
        )
        .spawn(tracing::Span::none());

        assert!(eventually(|| health.is_healthy()).await);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connection_recovers() {
        let router = Arc::new(FakeRouter::new("node-a", FakeNetwork::new()));
        let health = Arc::new(HealthCell::new());
        let state = running_state();
        let cancel = CancellationToken::new();
        let task = HealthMonitor::new(
            router.clone(),
            health.clone(),
            state.clone(),
            Duration::from_millis(10),
            policy(),
            cancel.clone(),
        )
        .spawn(tracing::Span::none());

        assert!(eventually(|| health.is_healthy()).await);
        router.break_connection();
        assert!(eventually(|| router.reconnect_count() >= 1).await);
        assert!(eventually(|| health.is_healthy()).await);
        assert_eq!(state.get(), AgentState::Running);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_ping_degrades_without_reconnect() {
        let router = Arc::new(FakeRouter::new("node-a", FakeNetwork::new()));
        router.set_refuse_pings(true);
        let health = Arc::new(HealthCell::new());
        let state = running_state();
        let cancel = CancellationToken::new();
        let task = HealthMonitor::new(
            router.clone(),
            health.clone(),
            state.clone(),
            Duration::from_millis(10),
            policy(),
            cancel.clone(),
        )
        .spawn(tracing::Span::none());

        assert!(eventually(|| health.get() == HealthStatus::Degraded).await);
        router.set_refuse_pings(false);
        assert!(eventually(|| health.is_healthy()).await);
        assert_eq!(router.reconnect_count(), 0);
        assert_eq!(state.get(), AgentState::Running);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_fail_agent() {
        let router = Arc::new(FakeRouter::new("node-a", FakeNetwork::new()));
        router.break_connection();
        router.set_reconnect_ok(false);
        let health = Arc::new(HealthCell::new());
        let state = running_state();

        HealthMonitor::new(
            router.clone(),
            health.clone(),
            state.clone(),
            Duration::from_millis(10),
            policy(),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(router.reconnect_count(), 3);
        assert_eq!(health.get(), HealthStatus::Unhealthy);
        assert_eq!(state.get(), AgentState::Failed);
    }
}
