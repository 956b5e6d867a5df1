//! VFD spindle control over RS-485 Modbus-RTU
//!
//! Layers, bottom up:
//! - [`transport`]: serial byte channel
//! - [`codec`]: RTU framing and CRC
//! - [`link`]: addressed request/reply exchange owned by one task
//! - [`protocol`]: brand adapters (Huanyang)
//! - [`controller`]: command mailbox, reconciliation loop, alarm escalation

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod machine;
pub mod pins;
pub mod protocol;
pub mod transport;

pub use config::ServiceConfig;
pub use controller::{bound_rpm, FatalCondition, SpindleLimits, VfdController, RPM_TOLERANCE};
pub use error::{Result, VfdError};
pub use machine::{Alarm, MachineContext, MachineState};
pub use protocol::{
    create_protocol, DesiredConfig, Huanyang, ObservedStatus, SpindleState, VfdBrand, VfdProtocol,
};
