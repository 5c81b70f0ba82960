//! Mode — how the node reaches its overlay router.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Default SAM bridge port of an externally managed router.
pub const DEFAULT_SAM_PORT: u16 = 7656;

/// Router selection, resolved once at `open()` time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RouterMode {
    /// Spawn an in-process router bound to loopback.
    #[default]
    Auto,
    /// Talk to a router managed outside this process.
    External { host: String, port: u16 },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected 'auto' or 'external:<host>:<port>', got '{0}'")]
pub struct ParseModeError(pub String);

impl RouterMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, RouterMode::Auto)
    }

    /// `host:port` for external mode, with IPv6 hosts bracketed.
    pub fn endpoint(&self) -> Option<String> {
        match self {
            RouterMode::Auto => None,
            RouterMode::External { host, port } => Some(join_host_port(host, *port)),
        }
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl FromStr for RouterMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.eq_ignore_ascii_case("auto") {
            return Ok(RouterMode::Auto);
        }

        let rest = raw
            .strip_prefix("external:")
            .ok_or_else(|| ParseModeError(raw.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ParseModeError(raw.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseModeError(raw.to_string()));
        }
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ParseModeError(raw.to_string()))?;

        Ok(RouterMode::External {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for RouterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            None => f.write_str("auto"),
            Some(endpoint) => write!(f, "external:{}", endpoint),
        }
    }
}
