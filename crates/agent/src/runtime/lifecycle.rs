//! Lifecycle — the `Agent` orchestrator.
//!
//! Startup is all-or-nothing: the router opens first, then each eligible
//! service starts in configured order. Any failure tears down what already
//! started (services in reverse, then the router) before the error is
//! returned. Shutdown runs the same teardown under `shutdown_grace`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use svrn_router::{HandleOpener, Router, RouterOpener};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::health::{HealthCell, HealthStatus};
use super::monitor::HealthMonitor;
use crate::conf::Config;
use crate::error::{AgentError, ServiceError, ShutdownFailure};
use crate::service::{Service, ServiceContext, ServiceKind, ServiceRegistry};
use crate::state::{AgentState, RoleSet, StateCell};

/// Point-in-time view of an agent, for logs and callers.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub health: HealthStatus,
    pub node: String,
    pub roles: RoleSet,
    pub services: Vec<ServiceKind>,
    pub router: String,
    pub community: Option<String>,
    /// When `state` was entered.
    pub since: DateTime<Utc>,
}

struct MonitorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the agent owns while running. Guarded by one async lock so
/// start and stop never interleave their resource changes.
#[derive(Default)]
struct Inner {
    router: Option<Arc<dyn Router>>,
    /// In start order; torn down from the back.
    services: Vec<Box<dyn Service>>,
    monitor: Option<MonitorTask>,
}

pub struct Agent {
    config: Arc<Config>,
    registry: ServiceRegistry,
    opener: Arc<dyn RouterOpener>,
    state: Arc<StateCell>,
    health: Arc<HealthCell>,
    running: Mutex<Vec<ServiceKind>>,
    inner: tokio::sync::Mutex<Inner>,
    /// Cancels an in-flight start.
    cancel: CancellationToken,
    span: tracing::Span,
}

impl Agent {
    pub fn new(config: Config, registry: ServiceRegistry, opener: Arc<dyn RouterOpener>) -> Self {
        let span = info_span!("agent", node = %config.node(), roles = %config.roles());
        Self {
            config: Arc::new(config),
            registry,
            opener,
            state: Arc::new(StateCell::new()),
            health: Arc::new(HealthCell::new()),
            running: Mutex::new(Vec::new()),
            inner: tokio::sync::Mutex::new(Inner::default()),
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Built-in services and the real router.
    pub fn with_defaults(config: Config) -> Self {
        let opener = Arc::new(HandleOpener::new(config.router_options()));
        Self::new(config, ServiceRegistry::with_builtins(), opener)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    pub fn health(&self) -> HealthStatus {
        self.health.get()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Services currently started, in start order.
    pub fn running_services(&self) -> Vec<ServiceKind> {
        self.running.lock().clone()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            state: self.state.get(),
            health: self.health.get(),
            node: self.config.node().to_string(),
            roles: self.config.roles().clone(),
            services: self.running_services(),
            router: self.config.router().to_string(),
            community: self.config.community().map(str::to_string),
            since: self.state.since(),
        }
    }

    /// Resolves once the agent reaches Stopped or Failed.
    pub async fn wait_for_exit(&self) -> AgentState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        reached.unwrap_or_else(|_| self.state.get())
    }

    /// Created -> Starting -> Running. Fails with `InvalidState` on any other
    /// starting state; a failed start leaves the agent Failed with nothing
    /// allocated, a cancelled one leaves it Stopped.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().await;
        if !self.state.transition(AgentState::Starting) {
            return Err(AgentError::InvalidState {
                op: "start",
                state: self.state.get(),
            });
        }
        info!(parent: &self.span, "Starting agent (router: {})", self.config.router());

        let grace = self.config.timeouts().shutdown_grace();
        match self.bring_up(&mut inner).instrument(self.span.clone()).await {
            Ok(()) => {
                self.state.transition(AgentState::Running);
                let monitor = self.spawn_monitor(&inner);
                inner.monitor = Some(monitor);
                info!(parent: &self.span, "Agent running with services [{}]", join_kinds(&self.running_services()));
                Ok(())
            }
            Err(AgentError::Cancelled) => {
                self.state.transition(AgentState::Stopping);
                info!(parent: &self.span, "Start cancelled, rolling back");
                if let Err(e) = self.release(&mut inner, grace).await {
                    warn!(parent: &self.span, "Rollback after cancelled start: {}", e);
                }
                self.state.transition(AgentState::Stopped);
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Agent start failed, rolling back");
                if let Err(cleanup) = self.release(&mut inner, grace).await {
                    warn!(parent: &self.span, "Rollback after failed start: {}", cleanup);
                }
                self.state.transition(AgentState::Failed);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, inner: &mut Inner) -> Result<(), AgentError> {
        let router = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            opened = self.opener.open(self.config.router()) => opened?,
        };
        info!("Router ready ({})", router.mode());
        inner.router = Some(Arc::clone(&router));
        self.health.mark_healthy();

        let limit = self.config.timeouts().service_start();
        for kind in self.registry.select(self.config.services(), self.config.roles()) {
            let ctx = self.service_context(kind);
            let service = self
                .registry
                .instantiate(kind, &ctx)
                .map_err(|e| ServiceError::start_failed(kind, e))?;

            let started: Result<(), AgentError> = tokio::select! {
                _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
                started = time::timeout(limit, service.start(Arc::clone(&router))) => match started {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ServiceError::start_failed(kind, e).into()),
                    Err(_) => Err(ServiceError::start_failed(kind, ServiceError::Timeout(limit)).into()),
                },
            };
            if let Err(e) = started {
                self.discard(service.as_ref(), ctx.op_timeout).await;
                return Err(e);
            }

            info!("Started service {} on {}", kind, router.destination_for(kind.as_str()));
            inner.services.push(service);
            self.running.lock().push(kind);
        }

        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Best-effort stop of a service whose start did not complete.
    async fn discard(&self, service: &dyn Service, wait: Duration) {
        match time::timeout(wait, service.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Discarding half-started {}: {}", service.kind(), e),
            Err(_) => debug!("Discarding half-started {} timed out", service.kind()),
        }
    }

    fn service_context(&self, kind: ServiceKind) -> ServiceContext {
        ServiceContext {
            node: self.config.node().to_string(),
            community: self.config.community().map(str::to_string),
            op_timeout: self.config.timeouts().operation(),
            span: info_span!(parent: &self.span, "service", kind = %kind),
        }
    }

    fn spawn_monitor(&self, inner: &Inner) -> MonitorTask {
        let cancel = CancellationToken::new();
        let task = match &inner.router {
            Some(router) => {
                let timeouts = self.config.timeouts();
                HealthMonitor::new(
                    Arc::clone(router),
                    Arc::clone(&self.health),
                    Arc::clone(&self.state),
                    timeouts.health_interval(),
                    timeouts.reconnect_policy(),
                    cancel.clone(),
                )
                .spawn(info_span!(parent: &self.span, "monitor"))
            }
            None => tokio::spawn(async {}),
        };
        MonitorTask { cancel, task }
    }

    /// Running -> Stopping -> Stopped, releasing services in reverse start
    /// order and then the router. Failures are collected rather than
    /// stopping the teardown; the agent ends Stopped either way.
    ///
    /// No-op from Created and Stopped. From Starting it cancels the start and
    /// waits for its rollback. From Failed it releases whatever is left and
    /// stays Failed.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let grace = self.config.timeouts().shutdown_grace();
        if self.state.get() == AgentState::Starting {
            info!(parent: &self.span, "Stop requested during startup");
            self.cancel.cancel();
        }

        let mut inner = match time::timeout(grace, self.inner.lock()).await {
            Ok(inner) => inner,
            Err(_) => return Err(AgentError::ShutdownTimeout(grace)),
        };

        match self.state.get() {
            AgentState::Created | AgentState::Stopping | AgentState::Stopped => {
                debug!(parent: &self.span, "Stop in state {} has nothing to do", self.state.get());
                Ok(())
            }
            AgentState::Failed => {
                info!(parent: &self.span, "Cleaning up failed agent");
                self.release(&mut inner, grace).await
            }
            AgentState::Starting | AgentState::Running => {
                self.state.transition(AgentState::Stopping);
                info!(parent: &self.span, "Stopping agent");
                let result = self.release(&mut inner, grace).await;
                self.state.transition(AgentState::Stopped);
                match &result {
                    Ok(()) => info!(parent: &self.span, "Agent stopped"),
                    Err(e) => warn!(parent: &self.span, "Agent stopped with errors: {}", e),
                }
                result
            }
        }
    }

    /// Teardown bounded by `grace`. On expiry whatever is left is dropped.
    async fn release(&self, inner: &mut Inner, grace: Duration) -> Result<(), AgentError> {
        let outcome = time::timeout(grace, self.teardown(inner))
            .instrument(self.span.clone())
            .await;
        match outcome {
            Ok(failures) if failures.is_empty() => Ok(()),
            Ok(failures) => Err(AgentError::Shutdown(failures)),
            Err(_) => {
                warn!(parent: &self.span, "Teardown exceeded {:?}, dropping remaining resources", grace);
                if let Some(monitor) = inner.monitor.take() {
                    monitor.cancel.cancel();
                    monitor.task.abort();
                }
                inner.services.clear();
                inner.router = None;
                self.running.lock().clear();
                Err(AgentError::ShutdownTimeout(grace))
            }
        }
    }

    async fn teardown(&self, inner: &mut Inner) -> Vec<ShutdownFailure> {
        let mut failures = Vec::new();

        if let Some(monitor) = inner.monitor.take() {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                failures.push(ShutdownFailure {
                    component: "health monitor".to_string(),
                    error: e.to_string(),
                });
            }
        }

        while let Some(service) = inner.services.pop() {
            let kind = service.kind();
            match service.stop().await {
                Ok(()) => info!("Stopped service {}", kind),
                Err(e) => {
                    warn!("Service {} did not stop cleanly: {}", kind, e);
                    failures.push(ShutdownFailure {
                        component: format!("service {}", kind),
                        error: e.to_string(),
                    });
                }
            }
            self.running.lock().retain(|running| *running != kind);
        }

        if let Some(router) = inner.router.take() {
            match router.close().await {
                Ok(()) => info!("Router closed"),
                Err(e) => {
                    warn!("Router did not close cleanly: {}", e);
                    failures.push(ShutdownFailure {
                        component: "router".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        failures
    }
}

fn join_kinds(kinds: &[ServiceKind]) -> String {
    kinds.iter().map(ServiceKind::as_str).collect::<Vec<_>>().join(", ")
}
