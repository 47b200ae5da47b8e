//! # machdump-utils
//!
//! Shared infrastructure for the machdump workspace: the `tracing`-based
//! logging setup used by the driver binary and the examples.
//!
//! The core library itself only *emits* `tracing` events and never installs
//! a subscriber; that stays the embedding application's call, which matters
//! when the embedding application is a crash handler.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, LogFormat, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
