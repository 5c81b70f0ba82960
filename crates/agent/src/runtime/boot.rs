//! Boot — tracing setup, in two phases.
//!
//! Phase one installs a thread-local subscriber so config loading can log.
//! Phase two installs the global subscriber the config asks for.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::conf::{LogFormat, LoggingConfig};

/// Filter used before any config is read.
pub const BOOT_FILTER: &str = "info,svrn=debug";

/// Phase 1: basic tracing for the config-loading window. `RUST_LOG` wins over
/// the built-in filter. Dropping the guard uninstalls it.
pub fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(BOOT_FILTER));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: the process-wide subscriber from `logging`. `RUST_LOG` still
/// overrides `logging.level`.
pub fn init_tracing(logging: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    }
}
