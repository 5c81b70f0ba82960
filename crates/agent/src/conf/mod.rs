//! Conf module — configuration model and layered loading.

pub mod load;
pub mod model;

pub use load::{load, split_csv, ConfigLayer};
pub use model::{Config, LogFormat, LoggingConfig, Timeouts};
