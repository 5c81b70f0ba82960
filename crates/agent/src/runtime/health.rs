//! Health — lock-free router health shared between the monitor and status
//! readers.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Router health as last observed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
    /// A ping failed; reconnects are in progress.
    Degraded = 3,
}

impl From<u8> for HealthStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Unhealthy,
            3 => HealthStatus::Degraded,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct HealthCell(AtomicU8);

impl HealthCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> HealthStatus {
        self.0.load(Ordering::Acquire).into()
    }

    pub fn is_healthy(&self) -> bool {
        self.get() == HealthStatus::Healthy
    }

    pub fn set(&self, status: HealthStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    pub fn mark_healthy(&self) {
        self.set(HealthStatus::Healthy);
    }

    pub fn mark_degraded(&self) {
        self.set(HealthStatus::Degraded);
    }

    pub fn mark_unhealthy(&self) {
        self.set(HealthStatus::Unhealthy);
    }
}
