//! Hex formatting for raw bus frames

use std::fmt::Write;

/// Encode bytes as space separated uppercase pairs, the way bus analyzers
/// print frames.
/// Example: [0x01, 0x03, 0x01] -> "01 03 01"
pub fn encode_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
