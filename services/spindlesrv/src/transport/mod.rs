//! Transport Layer Module
//!
//! Byte-level access to the RS-485 bus, separated from the Modbus framing
//! above it.
//!
//! ```text
//! ┌────────────────────────────┐
//! │  Link (send_command)       │
//! └────────────────────────────┘
//!               │
//!               ▼
//! ┌────────────────────────────┐
//! │  Transport (trait)         │
//! │  open, flush_input, send,  │
//! │  receive, close            │
//! └────────────────────────────┘
//!        │              │
//!        ▼              ▼
//!   ┌─────────┐    ┌─────────┐
//!   │ Serial  │    │  Mock   │
//!   └─────────┘    └─────────┘
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod serial;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockTransport;
pub use serial::SerialTransport;
pub use traits::{
    ConnectionState, Parity, SerialSettings, Transport, TransportError, TransportStats,
};
