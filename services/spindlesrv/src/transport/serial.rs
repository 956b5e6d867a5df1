//! Serial Transport Implementation
//!
//! RS-485 port opened through `tokio-serial`. Direction switching (RTS) is
//! handled by the UART driver.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

use super::traits::{
    ConnectionState, Parity, SerialSettings, Transport, TransportError, TransportStats,
};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial transport implementation
#[derive(Debug)]
pub struct SerialTransport {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    port: String,
    /// Settings of the currently open port
    settings: Option<SerialSettings>,
    stream: Option<SerialStream>,
    stats: TransportStats,
}

impl SerialTransport {
    pub fn new(port: impl Into<String>) -> Result<Self, TransportError> {
        let port = port.into();
        if port.is_empty() {
            return Err(TransportError::ConfigError(
                "Port path cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            port,
            settings: None,
            stream: None,
            stats: TransportStats::new(),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    fn parse_parity(parity: Parity) -> tokio_serial::Parity {
        match parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }

    fn parse_data_bits(data_bits: u8) -> tokio_serial::DataBits {
        match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn parse_stop_bits(stop_bits: u8) -> tokio_serial::StopBits {
        match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::NotConnected(self.port.clone()))
    }

    fn mark_broken(&mut self) {
        self.stream = None;
        self.stats.connection_state = ConnectionState::Error;
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    fn name(&self) -> &str {
        "Serial Transport"
    }

    async fn open(&mut self, settings: &SerialSettings) -> Result<(), TransportError> {
        settings.validate()?;
        self.stats.record_connection_attempt();

        debug!("Opening serial port: {} ({})", self.port, settings);

        let port_result = tokio_serial::new(&self.port, settings.baud_rate)
            .data_bits(Self::parse_data_bits(settings.data_bits))
            .parity(Self::parse_parity(settings.parity))
            .stop_bits(Self::parse_stop_bits(settings.stop_bits))
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(DEFAULT_READ_TIMEOUT)
            .open_native_async();

        match port_result {
            Ok(mut port) => {
                #[cfg(unix)]
                port.set_exclusive(false).map_err(|e| {
                    TransportError::IoError(format!("Failed to set exclusive mode: {e}"))
                })?;

                self.stream = Some(port);
                self.settings = Some(*settings);
                self.stats.record_successful_connection();

                info!("Opened serial port: {} ({})", self.port, settings);
                Ok(())
            },
            Err(e) => {
                let error_msg = format!("Failed to open serial port {}: {e}", self.port);
                error!("{error_msg}");
                self.stats.record_failed_connection();
                Err(TransportError::ConnectionFailed(error_msg))
            },
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.stream.take().is_some() {
            // Port closes on drop
            self.stats.record_disconnection();
            info!("Closed serial port: {}", self.port);
        }
        Ok(())
    }

    async fn flush_input(&mut self) -> Result<(), TransportError> {
        let port = self.port.clone();
        let stream = self.stream_mut()?;
        stream.clear(ClearBuffer::Input).map_err(|e| {
            TransportError::IoError(format!("Failed to flush input on {port}: {e}"))
        })
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream_mut()?;
        let send_operation = async {
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok::<_, std::io::Error>(data.len())
        };

        match timeout(WRITE_TIMEOUT, send_operation).await {
            Ok(Ok(bytes_sent)) => {
                self.stats.record_bytes_sent(bytes_sent);
                trace!(
                    hex_data = %common::hex::encode_spaced(data),
                    length = bytes_sent,
                    direction = "send",
                    "[Serial Transport] Raw packet"
                );
                Ok(bytes_sent)
            },
            Ok(Err(e)) => {
                let error_msg = format!("Failed to send data: {e}");
                error!("{error_msg}");
                self.mark_broken();
                Err(TransportError::SendFailed(error_msg))
            },
            Err(_) => {
                let error_msg = format!("Send operation timed out after {WRITE_TIMEOUT:?}");
                warn!("{error_msg}");
                Err(TransportError::Timeout(error_msg))
            },
        }
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout_duration: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let receive_timeout = timeout_duration.unwrap_or(DEFAULT_READ_TIMEOUT);
        let stream = self.stream_mut()?;

        match timeout(receive_timeout, stream.read(buffer)).await {
            Ok(Ok(bytes_read)) => {
                self.stats.record_bytes_received(bytes_read);
                trace!(
                    hex_data = %common::hex::encode_spaced(&buffer[..bytes_read]),
                    length = bytes_read,
                    direction = "recv",
                    "[Serial Transport] Raw packet"
                );
                Ok(bytes_read)
            },
            Ok(Err(e)) => {
                let error_msg = format!("Failed to receive data: {e}");
                error!("{error_msg}");
                self.mark_broken();
                Err(TransportError::ReceiveFailed(error_msg))
            },
            Err(_) => {
                self.stats.record_timeout();
                // Expected whenever the drive is silent
                let error_msg = format!("Receive operation timed out after {receive_timeout:?}");
                debug!("{error_msg}");
                Err(TransportError::Timeout(error_msg))
            },
        }
    }

    async fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    async fn diagnostics(&self) -> HashMap<String, String> {
        let mut diag = HashMap::new();
        diag.insert(
            "transport_type".to_string(),
            self.transport_type().to_string(),
        );
        diag.insert("port".to_string(), self.port.clone());
        diag.insert(
            "connected".to_string(),
            self.stream.is_some().to_string(),
        );
        if let Some(settings) = &self.settings {
            diag.insert("line".to_string(), settings.to_string());
        }
        diag.insert("timeouts".to_string(), self.stats.timeouts.to_string());
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_creation() {
        let transport = SerialTransport::new("/dev/ttyUSB0").unwrap();
        assert_eq!(transport.port(), "/dev/ttyUSB0");
        assert_eq!(transport.transport_type(), "serial");
    }

    #[test]
    fn test_empty_port_rejected() {
        assert!(matches!(
            SerialTransport::new(""),
            Err(TransportError::ConfigError(_))
        ));
    }

    #[test]
    fn test_line_setting_conversion() {
        assert_eq!(
            SerialTransport::parse_parity(Parity::Even),
            tokio_serial::Parity::Even
        );
        assert_eq!(
            SerialTransport::parse_data_bits(7),
            tokio_serial::DataBits::Seven
        );
        assert_eq!(
            SerialTransport::parse_stop_bits(2),
            tokio_serial::StopBits::Two
        );
    }

    #[tokio::test]
    async fn test_io_on_closed_port_fails() {
        let mut transport = SerialTransport::new("/dev/ttyUSB0").unwrap();
        assert!(!transport.is_connected().await);
        assert!(matches!(
            transport.send(&[0x01]).await,
            Err(TransportError::NotConnected(_))
        ));
        assert!(matches!(
            transport.flush_input().await,
            Err(TransportError::NotConnected(_))
        ));
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::new("/dev/spindlesrv-does-not-exist").unwrap();
        let settings = SerialSettings::new(9600, Parity::None);
        assert!(matches!(
            transport.open(&settings).await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert_eq!(transport.stats().await.failed_connections, 1);
    }
}
