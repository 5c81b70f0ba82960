//! Model — the validated `Config` and its file-only sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use svrn_router::{RetryPolicy, RouterMode, RouterOptions};

use crate::error::ConfigError;
use crate::service::ServiceKind;
use crate::state::RoleSet;

/// Timeouts and retry knobs. Every network-facing step is bounded by one of
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub router_start_ms: u64,
    pub operation_ms: u64,
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub service_start_ms: u64,
    pub health_interval_secs: u64,
    pub reconnect_attempts: u32,
    pub shutdown_grace_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            router_start_ms: 10_000,
            operation_ms: 5_000,
            connect_attempts: 5,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            service_start_ms: 10_000,
            health_interval_secs: 15,
            reconnect_attempts: 3,
            shutdown_grace_secs: 10,
        }
    }
}

impl Timeouts {
    pub fn router_start(&self) -> Duration {
        Duration::from_millis(self.router_start_ms)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn service_start(&self) -> Duration {
        Duration::from_millis(self.service_start_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Backoff for the initial external connect.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    /// Backoff for reconnects after a mid-run router loss.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 8] = [
            ("timeouts.router_start_ms", self.router_start_ms),
            ("timeouts.operation_ms", self.operation_ms),
            ("timeouts.connect_attempts", self.connect_attempts as u64),
            ("timeouts.backoff_max_ms", self.backoff_max_ms),
            ("timeouts.service_start_ms", self.service_start_ms),
            ("timeouts.health_interval_secs", self.health_interval_secs),
            ("timeouts.reconnect_attempts", self.reconnect_attempts as u64),
            ("timeouts.shutdown_grace_secs", self.shutdown_grace_secs),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidValue {
                key: "timeouts.backoff_base_ms",
                reason: format!("must not exceed backoff_max_ms ({})", self.backoff_max_ms),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence at runtime.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,svrn=debug,svrn_router=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Validated, immutable node configuration.
///
/// Only `Config::validate` (and `Default`) construct one, so holding a
/// `Config` means every role, service and router string was recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(super) roles: RoleSet,
    pub(super) services: Vec<ServiceKind>,
    pub(super) community: Option<String>,
    pub(super) router: RouterMode,
    pub(super) node: String,
    pub(super) timeouts: Timeouts,
    pub(super) logging: LoggingConfig,
}

impl Config {
    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    /// Configured services in first-mention order, without duplicates.
    pub fn services(&self) -> &[ServiceKind] {
        &self.services
    }

    pub fn community(&self) -> Option<&str> {
        self.community.as_deref()
    }

    pub fn router(&self) -> &RouterMode {
        &self.router
    }

    /// Session nickname used on the router.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            node: self.node.clone(),
            start_timeout: self.timeouts.router_start(),
            op_timeout: self.timeouts.operation(),
            retry: self.timeouts.connect_policy(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roles: RoleSet::default(),
            services: Vec::new(),
            community: None,
            router: RouterMode::Auto,
            node: default_node(),
            timeouts: Timeouts::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn default_node() -> String {
    format!("svrn-{}", std::process::id())
}
