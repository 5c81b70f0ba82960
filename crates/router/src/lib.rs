// Transport layer for svrn nodes: router modes, the wire protocol,
// the embedded router and the handle services talk through.

pub mod embedded;
pub mod error;
pub mod fake;
pub mod handle;
pub mod mode;
pub mod proto;
pub mod retry;
pub mod stream;
pub mod traits;

pub use embedded::EmbeddedRouter;
pub use error::{Result, RouterError};
pub use handle::{HandleOpener, RouterHandle, RouterOptions};
pub use mode::{ParseModeError, RouterMode, DEFAULT_SAM_PORT};
pub use retry::RetryPolicy;
pub use stream::{Inbound, RouterStream};
pub use traits::{Router, RouterOpener};
