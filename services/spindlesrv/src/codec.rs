//! Modbus RTU frame codec
//!
//! A frame on the wire is `address, function_code, payload..., crc_lo, crc_hi`.
//! The CRC covers everything before it.

use crc::{Crc, CRC_16_MODBUS};
use thiserror::Error;

/// Modbus RTU CRC16 (init 0xFFFF, reflected poly 0xA001)
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Address + function code + CRC
pub const MIN_FRAME_LEN: usize = 4;

/// Reply validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("CRC mismatch: computed {computed:#06X}, received {received:#06X}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("address mismatch: expected {expected:#04X}, got {actual:#04X}")]
    AddressMismatch { expected: u8, actual: u8 },
}

/// Compute the Modbus CRC16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// One Modbus RTU frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub address: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub crc: u16,
}

impl RtuFrame {
    /// Build a frame, computing its CRC
    pub fn new(address: u8, function_code: u8, payload: Vec<u8>) -> Self {
        let mut head = Vec::with_capacity(2 + payload.len());
        head.push(address);
        head.push(function_code);
        head.extend_from_slice(&payload);
        let crc = crc16(&head);

        Self {
            address,
            function_code,
            payload,
            crc,
        }
    }

    /// Build a frame from a PDU (`function_code, payload...`)
    pub fn from_pdu(address: u8, pdu: &[u8]) -> Result<Self, FrameError> {
        match pdu.split_first() {
            Some((&function_code, payload)) => Ok(Self::new(address, function_code, payload.to_vec())),
            None => Err(FrameError::TooShort(pdu.len() + 3)),
        }
    }

    /// Length of the encoded frame in bytes
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len()
    }

    /// Serialize for the wire, CRC low byte first
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.push(self.address);
        bytes.push(self.function_code);
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    /// Function code followed by payload
    pub fn pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.payload.len());
        pdu.push(self.function_code);
        pdu.extend_from_slice(&self.payload);
        pdu
    }

    /// Validate a reply of known length from the configured device
    ///
    /// Checks run in order: length, CRC, address. Anything shorter than
    /// [`MIN_FRAME_LEN`] is a length mismatch whatever `expected_len` says.
    pub fn decode(raw: &[u8], expected_len: usize, address: u8) -> Result<Self, FrameError> {
        if raw.len() != expected_len || raw.len() < MIN_FRAME_LEN {
            return Err(FrameError::LengthMismatch {
                expected: expected_len.max(MIN_FRAME_LEN),
                actual: raw.len(),
            });
        }

        let frame = Self::parse(raw)?;
        if frame.address != address {
            return Err(FrameError::AddressMismatch {
                expected: address,
                actual: frame.address,
            });
        }

        Ok(frame)
    }

    /// Split a raw frame and verify its CRC without any length or address expectation
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort(raw.len()));
        }

        let body_len = raw.len() - 2;
        let computed = crc16(&raw[..body_len]);
        let received = u16::from_le_bytes([raw[body_len], raw[body_len + 1]]);
        if computed != received {
            return Err(FrameError::CrcMismatch { computed, received });
        }

        Ok(Self {
            address: raw[0],
            function_code: raw[1],
            payload: raw[2..body_len].to_vec(),
            crc: received,
        })
    }
}
