//! Shared helpers for the spindle services
//!
//! - logging initialization (console + optional rolling file)
//! - hex formatting for raw bus frames
//! - shutdown signal handling

pub mod hex;
pub mod logging;
pub mod shutdown;

pub use logging::{LogConfig, LoggingConfig};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
