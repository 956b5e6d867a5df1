//! Mock Transport for Testing
//!
//! Scripted replies and a record of every frame written. Clones share state,
//! so a test can keep a handle after boxing the transport into a link.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::traits::{ConnectionState, SerialSettings, Transport, TransportError, TransportStats};

#[derive(Debug, Default)]
struct MockTransportState {
    connected: bool,
    settings: Option<SerialSettings>,
    /// Chunks handed out by successive `receive` calls
    receive_queue: VecDeque<Vec<u8>>,
    sent_data: Vec<Vec<u8>>,
    flush_count: usize,
    should_fail_open: bool,
    should_fail_send: bool,
    stats: TransportStats,
}

/// Mock transport implementation
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the next `receive`
    pub fn add_receive_data(&self, data: Vec<u8>) {
        self.state.lock().receive_queue.push_back(data);
    }

    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent_data.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flush_count
    }

    pub fn opened_with(&self) -> Option<SerialSettings> {
        self.state.lock().settings
    }

    pub fn set_open_failure(&self, should_fail: bool) {
        self.state.lock().should_fail_open = should_fail;
    }

    pub fn set_send_failure(&self, should_fail: bool) {
        self.state.lock().should_fail_send = should_fail;
    }

    /// Lose the port without a `close` call, as a failed serial read does
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.stats.connection_state = ConnectionState::Error;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        "Mock Transport"
    }

    async fn open(&mut self, settings: &SerialSettings) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.stats.record_connection_attempt();
        if state.should_fail_open {
            state.stats.record_failed_connection();
            return Err(TransportError::ConnectionFailed(
                "Mock open failure".to_string(),
            ));
        }
        state.connected = true;
        state.settings = Some(*settings);
        state.stats.record_successful_connection();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            state.stats.record_disconnection();
        }
        Ok(())
    }

    async fn flush_input(&mut self) -> Result<(), TransportError> {
        self.state.lock().flush_count += 1;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected("mock".to_string()));
        }
        if state.should_fail_send {
            return Err(TransportError::SendFailed("Mock send failure".to_string()));
        }
        state.sent_data.push(data.to_vec());
        state.stats.record_bytes_sent(data.len());
        debug!("Mock transport sent {} bytes", data.len());
        Ok(data.len())
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected("mock".to_string()));
        }

        let Some(mut chunk) = state.receive_queue.pop_front() else {
            state.stats.record_timeout();
            return Err(TransportError::Timeout("Mock receive queue empty".to_string()));
        };

        let n = chunk.len().min(buffer.len());
        buffer[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            // Leftover stays at the head of the queue
            let rest = chunk.split_off(n);
            state.receive_queue.push_front(rest);
        }
        state.stats.record_bytes_received(n);
        Ok(n)
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Parity;

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let mut transport = MockTransport::new();
        let handle = transport.clone();
        transport
            .open(&SerialSettings::new(9600, Parity::None))
            .await
            .unwrap();

        transport.send(&[0x01, 0x03]).await.unwrap();
        assert_eq!(handle.sent_data(), vec![vec![0x01, 0x03]]);

        handle.add_receive_data(vec![0xAA, 0xBB, 0xCC]);
        let mut buf = [0u8; 2];
        assert_eq!(transport.receive(&mut buf, None).await.unwrap(), 2);
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(transport.receive(&mut buf, None).await.unwrap(), 1);
        assert_eq!(buf[0], 0xCC);

        assert!(matches!(
            transport.receive(&mut buf, None).await,
            Err(TransportError::Timeout(_))
        ));
        assert_eq!(transport.stats().await.connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_mock_transport_failures() {
        let mut transport = MockTransport::new();
        transport.set_open_failure(true);
        assert!(transport
            .open(&SerialSettings::new(9600, Parity::None))
            .await
            .is_err());
        assert!(transport.send(&[0x01]).await.is_err());
    }
}
