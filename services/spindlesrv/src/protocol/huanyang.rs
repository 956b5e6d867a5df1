//! Huanyang drive protocol
//!
//! Huanyang drives speak a vendor dialect framed like Modbus RTU. Every
//! request carries a sub-length byte after the function code:
//!
//! | Function | Request data           | Reply data             |
//! |----------|------------------------|------------------------|
//! | `0x03`   | `01 <control>`         | `01 <status>`          |
//! | `0x04`   | `03 <register> 00 00`  | `03 <register> hi lo`  |
//! | `0x05`   | `02 hi lo` (Hz x 100)  | `02 hi lo` (echo)      |

use async_trait::async_trait;
use tracing::debug;

use super::{ObservedStatus, SpindleState, VfdProtocol};
use crate::error::{Result, VfdError};
use crate::link::{ModbusCommand, VfdLink};
use crate::transport::{Parity, SerialSettings};

/// Function codes
pub mod function {
    pub const WRITE_CONTROL: u8 = 0x03;
    pub const READ_STATUS: u8 = 0x04;
    pub const WRITE_FREQUENCY: u8 = 0x05;
}

/// Bits of the control byte written with [`function::WRITE_CONTROL`]
pub mod control {
    pub const RUN: u8 = 1 << 0;
    pub const FORWARD: u8 = 1 << 1;
    pub const REVERSE: u8 = 1 << 2;
    pub const STOP: u8 = 1 << 3;
    /// Toggle run direction
    pub const RUN_REVERSE: u8 = 1 << 4;
    pub const JOG: u8 = 1 << 5;
    pub const JOG_FORWARD: u8 = 1 << 6;
    pub const JOG_REVERSE: u8 = 1 << 7;
}

/// Bits of the status byte returned by [`function::WRITE_CONTROL`]
pub mod status {
    pub const RUN: u8 = 1 << 0;
    pub const JOG: u8 = 1 << 1;
    pub const REVERSE: u8 = 1 << 2;
    pub const RUNNING: u8 = 1 << 3;
    pub const JOGGING: u8 = 1 << 4;
    pub const REVERSE_RUNNING: u8 = 1 << 5;
    pub const BRAKING: u8 = 1 << 6;
    pub const TRACK_START: u8 = 1 << 7;
}

const CONTROL_LEN: u8 = 0x01;
const STATUS_LEN: u8 = 0x03;
const FREQUENCY_LEN: u8 = 0x02;

/// Control byte sent to read the status byte without commanding anything
const PROBE: u8 = 0x00;

/// Readable status values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusRegister {
    /// Set frequency, Hz x 100
    SetFrequency = 0,
    /// Output frequency, Hz x 100
    OutputFrequency = 1,
    /// Output current, A x 10
    OutputCurrent = 2,
    /// Rotation speed, rpm
    RotationSpeed = 3,
    DcVoltage = 4,
    AcVoltage = 5,
    Counter = 6,
    Temperature = 7,
}

impl StatusRegister {
    pub const ALL: [StatusRegister; 8] = [
        StatusRegister::SetFrequency,
        StatusRegister::OutputFrequency,
        StatusRegister::OutputCurrent,
        StatusRegister::RotationSpeed,
        StatusRegister::DcVoltage,
        StatusRegister::AcVoltage,
        StatusRegister::Counter,
        StatusRegister::Temperature,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            StatusRegister::SetFrequency => "set frequency",
            StatusRegister::OutputFrequency => "output frequency",
            StatusRegister::OutputCurrent => "output current",
            StatusRegister::RotationSpeed => "rotation speed",
            StatusRegister::DcVoltage => "DC bus voltage",
            StatusRegister::AcVoltage => "AC voltage",
            StatusRegister::Counter => "counter",
            StatusRegister::Temperature => "temperature",
        }
    }
}

/// rpm to Hz x 100, rounded, saturating at the 16-bit limit
pub fn rpm_to_frequency(rpm: u32) -> u16 {
    let centihertz = (u64::from(rpm) * 100 + 30) / 60;
    centihertz.min(u64::from(u16::MAX)) as u16
}

/// Hz x 100 to rpm, truncating
pub fn frequency_to_rpm(frequency: u16) -> u32 {
    u32::from(frequency) * 60 / 100
}

fn control_byte(state: SpindleState) -> u8 {
    match state {
        SpindleState::Disabled => control::STOP,
        SpindleState::Clockwise => control::RUN,
        SpindleState::CounterClockwise => control::RUN | control::RUN_REVERSE,
    }
}

fn direction(status_byte: u8) -> SpindleState {
    if status_byte & status::REVERSE != 0 {
        SpindleState::CounterClockwise
    } else {
        SpindleState::Clockwise
    }
}

fn configured_state(status_byte: u8) -> SpindleState {
    if status_byte & status::RUN == 0 {
        SpindleState::Disabled
    } else {
        direction(status_byte)
    }
}

fn actual_state(status_byte: u8) -> SpindleState {
    if status_byte & status::RUNNING == 0 {
        SpindleState::Disabled
    } else {
        direction(status_byte)
    }
}

/// Huanyang adapter
#[derive(Debug, Default)]
pub struct Huanyang {
    /// Control byte of the last state command, for diagnostics
    last_control: Option<u8>,
}

impl Huanyang {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_control(&self) -> Option<u8> {
        self.last_control
    }

    /// Write a control byte and return the drive's status byte
    async fn write_control(&mut self, link: &mut VfdLink, control_byte: u8) -> Result<u8> {
        let command = ModbusCommand::new(
            vec![function::WRITE_CONTROL, CONTROL_LEN, control_byte],
            3,
        );
        let reply = link.send_command(&command).await?;

        match reply.as_slice() {
            [function::WRITE_CONTROL, CONTROL_LEN, status_byte] => Ok(*status_byte),
            other => Err(VfdError::unexpected(format!(
                "control reply {:02X?} to control byte {:#04X}",
                other, control_byte
            ))),
        }
    }

    async fn write_frequency(&mut self, link: &mut VfdLink, frequency: u16) -> Result<()> {
        let [hi, lo] = frequency.to_be_bytes();
        let command = ModbusCommand::new(vec![function::WRITE_FREQUENCY, FREQUENCY_LEN, hi, lo], 4);
        let reply = link.send_command(&command).await?;

        match reply.as_slice() {
            [function::WRITE_FREQUENCY, FREQUENCY_LEN, hi, lo] => {
                let echoed = u16::from_be_bytes([*hi, *lo]);
                if echoed == frequency {
                    Ok(())
                } else {
                    Err(VfdError::EchoMismatch {
                        sent: frequency,
                        received: echoed,
                    })
                }
            },
            other => Err(VfdError::unexpected(format!(
                "frequency reply {:02X?}",
                other
            ))),
        }
    }

    /// Read one status value
    pub async fn read_register(&mut self, link: &mut VfdLink, register: StatusRegister) -> Result<u16> {
        let index = register.index();
        let command = ModbusCommand::new(vec![function::READ_STATUS, STATUS_LEN, index, 0x00, 0x00], 5);
        let reply = link.send_command(&command).await?;

        match reply.as_slice() {
            [function::READ_STATUS, STATUS_LEN, echoed, hi, lo] if *echoed == index => {
                Ok(u16::from_be_bytes([*hi, *lo]))
            },
            other => Err(VfdError::unexpected(format!(
                "{} reply {:02X?}",
                register.label(),
                other
            ))),
        }
    }
}

#[async_trait]
impl VfdProtocol for Huanyang {
    fn name(&self) -> &str {
        "Huanyang"
    }

    fn default_serial_settings(&self) -> SerialSettings {
        SerialSettings::new(9600, Parity::None)
    }

    async fn request_configuration(
        &mut self,
        link: &mut VfdLink,
        state: Option<SpindleState>,
        rpm: Option<u32>,
    ) -> Result<()> {
        let mut first_error = None;

        if let Some(state) = state {
            let byte = control_byte(state);
            self.last_control = Some(byte);
            debug!("Huanyang control {:#04X} ({})", byte, state);
            if let Err(e) = self.write_control(link, byte).await {
                first_error.get_or_insert(e);
            }
        }

        if let Some(rpm) = rpm {
            let frequency = rpm_to_frequency(rpm);
            debug!("Huanyang frequency {} for {} rpm", frequency, rpm);
            if let Err(e) = self.write_frequency(link, frequency).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn read_status(&mut self, link: &mut VfdLink) -> Result<ObservedStatus> {
        let actual_rpm = u32::from(self.read_register(link, StatusRegister::RotationSpeed).await?);
        let set_frequency = self.read_register(link, StatusRegister::SetFrequency).await?;
        let status_byte = self.write_control(link, PROBE).await?;

        Ok(ObservedStatus {
            configured_rpm: frequency_to_rpm(set_frequency),
            actual_rpm,
            configured_state: configured_state(status_byte),
            actual_state: actual_state(status_byte),
        })
    }
}
