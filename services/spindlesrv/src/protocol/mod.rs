//! Brand-specific drive protocols
//!
//! Each brand maps abstract spindle intents onto its own Modbus-RTU command
//! set. The controller only talks to [`VfdProtocol`].

pub mod huanyang;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::link::VfdLink;
use crate::transport::SerialSettings;

pub use huanyang::{Huanyang, StatusRegister};

/// Commanded or reported spindle direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleState {
    #[default]
    Disabled,
    Clockwise,
    CounterClockwise,
}

impl SpindleState {
    pub fn is_spinning(self) -> bool {
        self != SpindleState::Disabled
    }
}

impl fmt::Display for SpindleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpindleState::Disabled => write!(f, "off"),
            SpindleState::Clockwise => write!(f, "cw"),
            SpindleState::CounterClockwise => write!(f, "ccw"),
        }
    }
}

/// What the spindle should be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DesiredConfig {
    pub state: SpindleState,
    pub rpm: u32,
}

impl DesiredConfig {
    pub const STOPPED: DesiredConfig = DesiredConfig {
        state: SpindleState::Disabled,
        rpm: 0,
    };

    pub fn new(state: SpindleState, rpm: u32) -> Self {
        Self { state, rpm }
    }
}

/// One complete status read from the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedStatus {
    /// Speed the drive is set to
    pub configured_rpm: u32,
    /// Speed the motor is turning at
    pub actual_rpm: u32,
    pub configured_state: SpindleState,
    pub actual_state: SpindleState,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "set {} @ {} rpm, running {} @ {} rpm",
            self.configured_state, self.configured_rpm, self.actual_state, self.actual_rpm
        )
    }
}

/// Supported drive brands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfdBrand {
    #[default]
    Huanyang,
}

impl fmt::Display for VfdBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfdBrand::Huanyang => write!(f, "huanyang"),
        }
    }
}

/// Brand adapter used by the poll task
///
/// Implementations are only ever called from the task that owns the link.
#[async_trait]
pub trait VfdProtocol: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Line settings the drive ships with
    fn default_serial_settings(&self) -> SerialSettings;

    /// Send the commands for the parameters that are present
    ///
    /// Every command is attempted even if an earlier one fails; the first
    /// failure is returned. `Ok` means every command sent was acknowledged.
    async fn request_configuration(
        &mut self,
        link: &mut VfdLink,
        state: Option<SpindleState>,
        rpm: Option<u32>,
    ) -> Result<()>;

    /// Read configured and actual speed and direction
    async fn read_status(&mut self, link: &mut VfdLink) -> Result<ObservedStatus>;
}

#[async_trait]
impl VfdProtocol for Box<dyn VfdProtocol> {
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    fn default_serial_settings(&self) -> SerialSettings {
        self.as_ref().default_serial_settings()
    }

    async fn request_configuration(
        &mut self,
        link: &mut VfdLink,
        state: Option<SpindleState>,
        rpm: Option<u32>,
    ) -> Result<()> {
        self.as_mut().request_configuration(link, state, rpm).await
    }

    async fn read_status(&mut self, link: &mut VfdLink) -> Result<ObservedStatus> {
        self.as_mut().read_status(link).await
    }
}

/// Build the adapter for a brand
pub fn create_protocol(brand: VfdBrand) -> Box<dyn VfdProtocol> {
    match brand {
        VfdBrand::Huanyang => Box::new(Huanyang::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Parity;

    #[test]
    fn test_create_protocol() {
        let protocol = create_protocol(VfdBrand::Huanyang);
        assert_eq!(protocol.name(), "Huanyang");
        assert_eq!(
            protocol.default_serial_settings(),
            SerialSettings::new(9600, Parity::None)
        );
    }

    #[test]
    fn test_spindle_state_display() {
        assert_eq!(SpindleState::Disabled.to_string(), "off");
        assert_eq!(SpindleState::CounterClockwise.to_string(), "ccw");
        assert!(SpindleState::Clockwise.is_spinning());
        assert!(!SpindleState::default().is_spinning());
    }
}
