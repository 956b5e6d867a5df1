//! Transport Layer Traits
//!
//! The spindle link talks to the drive through a half-duplex byte channel.
//! Exactly one task owns a transport at a time, so implementations take
//! `&mut self` and keep their state unsynchronized.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Port could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation attempted on a closed port
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "{c}")
    }
}

/// UART line settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialSettings {
    /// 8 data bits, 1 stop bit
    pub const fn new(baud_rate: u32, parity: Parity) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            parity,
            stop_bits: 1,
        }
    }

    /// Apply optional overrides for baud rate and parity
    pub fn with_overrides(mut self, baud_rate: Option<u32>, parity: Option<Parity>) -> Self {
        if let Some(baud_rate) = baud_rate {
            self.baud_rate = baud_rate;
        }
        if let Some(parity) = parity {
            self.parity = parity;
        }
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.baud_rate == 0 {
            return Err(TransportError::ConfigError(
                "Baud rate must be greater than zero".to_string(),
            ));
        }

        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(TransportError::ConfigError(
                "Data bits must be 5, 6, 7, or 8".to_string(),
            ));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(TransportError::ConfigError(
                "Stop bits must be 1 or 2".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
}

/// Transport statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Number of open attempts
    pub connection_attempts: u64,
    /// Number of failed opens
    pub failed_connections: u64,
    /// Receives that hit their deadline
    pub timeouts: u64,
    /// Current connection state
    pub connection_state: ConnectionState,
}

impl TransportStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            connection_attempts: 0,
            failed_connections: 0,
            timeouts: 0,
            connection_state: ConnectionState::Disconnected,
        }
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_successful_connection(&mut self) {
        self.connection_state = ConnectionState::Connected;
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
        self.connection_state = ConnectionState::Error;
    }

    pub fn record_disconnection(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
    }

    pub fn record_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }
}

impl Default for TransportStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Half-duplex byte channel to the drive
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Get transport type identifier
    fn transport_type(&self) -> &str;

    /// Get human-readable transport name
    fn name(&self) -> &str;

    /// Open the channel with the given line settings
    async fn open(&mut self, settings: &SerialSettings) -> Result<(), TransportError>;

    /// Close the channel; closing a closed channel is a no-op
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Discard any bytes received but not yet read
    async fn flush_input(&mut self) -> Result<(), TransportError>;

    /// Write all of `data`
    ///
    /// # Returns
    ///
    /// `Ok(bytes_sent)` if successful, `Err` otherwise
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available into `buffer`, waiting at most `timeout`
    ///
    /// # Returns
    ///
    /// `Ok(bytes_received)`, possibly fewer than `buffer.len()`;
    /// `Err(TransportError::Timeout)` when nothing arrived in time
    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError>;

    /// Check if transport is currently open
    async fn is_connected(&self) -> bool;

    /// Get transport statistics
    async fn stats(&self) -> TransportStats;

    /// Get transport-specific diagnostic information
    async fn diagnostics(&self) -> HashMap<String, String> {
        let mut diag = HashMap::new();
        diag.insert(
            "transport_type".to_string(),
            self.transport_type().to_string(),
        );
        diag.insert("name".to_string(), self.name().to_string());
        diag.insert(
            "connected".to_string(),
            self.is_connected().await.to_string(),
        );
        diag
    }
}

/// Allows `Box<dyn Transport>` to be used where `Transport` is required
#[async_trait]
impl Transport for Box<dyn Transport> {
    fn transport_type(&self) -> &str {
        self.as_ref().transport_type()
    }

    fn name(&self) -> &str {
        self.as_ref().name()
    }

    async fn open(&mut self, settings: &SerialSettings) -> Result<(), TransportError> {
        self.as_mut().open(settings).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.as_mut().close().await
    }

    async fn flush_input(&mut self) -> Result<(), TransportError> {
        self.as_mut().flush_input().await
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.as_mut().send(data).await
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        self.as_mut().receive(buffer, timeout).await
    }

    async fn is_connected(&self) -> bool {
        self.as_ref().is_connected().await
    }

    async fn stats(&self) -> TransportStats {
        self.as_ref().stats().await
    }

    async fn diagnostics(&self) -> HashMap<String, String> {
        self.as_ref().diagnostics().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.connection_state, ConnectionState::Disconnected);

        stats.record_connection_attempt();
        stats.record_successful_connection();
        stats.record_bytes_sent(6);
        stats.record_bytes_received(8);
        stats.record_timeout();

        assert_eq!(stats.connection_attempts, 1);
        assert_eq!(stats.connection_state, ConnectionState::Connected);
        assert_eq!(stats.bytes_sent, 6);
        assert_eq!(stats.bytes_received, 8);
        assert_eq!(stats.timeouts, 1);

        stats.record_disconnection();
        assert_eq!(stats.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_transport_error() {
        let error = TransportError::Timeout("no response from drive".to_string());
        assert_eq!(error.to_string(), "Operation timed out: no response from drive");
    }

    #[test]
    fn test_serial_settings_overrides() {
        let base = SerialSettings::new(9600, Parity::None);
        assert_eq!(base.to_string(), "9600 8N1");

        let tuned = base.with_overrides(Some(19200), Some(Parity::Even));
        assert_eq!(tuned.baud_rate, 19200);
        assert_eq!(tuned.parity, Parity::Even);
        assert_eq!(base.with_overrides(None, None), base);
    }

    #[test]
    fn test_serial_settings_validate() {
        assert!(SerialSettings::new(9600, Parity::None).validate().is_ok());
        assert!(SerialSettings::new(0, Parity::None).validate().is_err());

        let mut bad = SerialSettings::new(9600, Parity::Odd);
        bad.stop_bits = 3;
        assert!(matches!(
            bad.validate(),
            Err(TransportError::ConfigError(_))
        ));
    }
}
