//! Opaque pin identifiers and their diagnostic names

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pin number as assigned by the board pin map
///
/// Ranges: `0..64` native GPIO, `64..128` SPI-attached, `128..255` I2S
/// output expander, `255` unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pin(pub u8);

impl Pin {
    pub const UNDEFINED: Pin = Pin(255);

    const I2SO_BASE: u8 = 128;
    const SPI_BASE: u8 = 64;

    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }

    /// Map a configured value to a pin, treating absence as unassigned
    pub fn from_config(value: Option<u8>) -> Self {
        value.map_or(Self::UNDEFINED, Pin)
    }
}

impl Default for Pin {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            255 => write!(f, "None"),
            n if n >= Self::I2SO_BASE => write!(f, "I2SO({})", n - Self::I2SO_BASE),
            // SPI pins keep their raw number
            n if n >= Self::SPI_BASE => write!(f, "SPI({})", n),
            n => write!(f, "GPIO({})", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_names() {
        assert_eq!(Pin(255).to_string(), "None");
        assert_eq!(Pin(130).to_string(), "I2SO(2)");
        assert_eq!(Pin(128).to_string(), "I2SO(0)");
        assert_eq!(Pin(70).to_string(), "SPI(70)");
        assert_eq!(Pin(17).to_string(), "GPIO(17)");
        assert_eq!(Pin(0).to_string(), "GPIO(0)");
    }

    #[test]
    fn test_from_config() {
        assert_eq!(Pin::from_config(None), Pin::UNDEFINED);
        assert!(!Pin::from_config(None).is_defined());
        assert!(Pin::from_config(Some(4)).is_defined());
    }
}
