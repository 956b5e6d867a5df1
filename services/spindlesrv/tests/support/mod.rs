//! Simulated Huanyang drive for integration tests
//!
//! Implements `Transport` directly: every frame written is answered the way a
//! Huanyang drive at the configured address would, with the reply available
//! to the next `receive`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use spindlesrv::codec::RtuFrame;
use spindlesrv::config::ServiceConfig;
use spindlesrv::protocol::huanyang::{control, function, status};
use spindlesrv::transport::{SerialSettings, Transport, TransportError, TransportStats};

#[derive(Debug)]
struct DriveState {
    address: u8,
    running: bool,
    reverse: bool,
    /// Hz x 100
    frequency: u16,
    /// Never answer
    silent: bool,
    /// Acknowledge commands without applying them
    ignore_commands: bool,
    open: bool,
    /// Refuse to open, as an unplugged adapter does
    fail_open: bool,
    pending: Vec<u8>,
    frames: Vec<Vec<u8>>,
    stats: TransportStats,
}

#[derive(Debug, Clone)]
pub struct SimulatedDrive {
    state: Arc<Mutex<DriveState>>,
}

impl SimulatedDrive {
    pub fn new(address: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(DriveState {
                address,
                running: false,
                reverse: false,
                frequency: 0,
                silent: false,
                ignore_commands: false,
                open: false,
                fail_open: false,
                pending: Vec::new(),
                frames: Vec::new(),
                stats: TransportStats::new(),
            })),
        }
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn set_ignore_commands(&self, ignore: bool) {
        self.state.lock().ignore_commands = ignore;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_reverse(&self) -> bool {
        self.state.lock().reverse
    }

    pub fn frequency(&self) -> u16 {
        self.state.lock().frequency
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().frames.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Lose the port without a `close`, as a failed serial read does
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.pending.clear();
    }

    pub fn set_open_failure(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }
}

impl DriveState {
    fn status_byte(&self) -> u8 {
        let mut byte = 0;
        if self.running {
            byte |= status::RUN | status::RUNNING;
            if self.reverse {
                byte |= status::REVERSE;
            }
        }
        byte
    }

    fn register(&self, index: u8) -> u16 {
        match index {
            0 => self.frequency,
            1 if self.running => self.frequency,
            3 if self.running => (u32::from(self.frequency) * 60 / 100) as u16,
            4 => 3100,
            5 => 2200,
            7 => 35,
            _ => 0,
        }
    }

    fn apply_control(&mut self, byte: u8) {
        if self.ignore_commands || byte == 0 {
            return;
        }
        if byte & control::STOP != 0 {
            self.running = false;
        } else if byte & control::RUN != 0 {
            self.running = true;
            self.reverse = byte & control::RUN_REVERSE != 0;
        }
    }

    /// Reply PDU for a request, or None when the drive would stay quiet
    fn answer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let frame = RtuFrame::parse(request).ok()?;
        if frame.address != self.address {
            return None;
        }

        match (frame.function_code, frame.payload.as_slice()) {
            (function::WRITE_CONTROL, [0x01, byte]) => {
                self.apply_control(*byte);
                Some(vec![function::WRITE_CONTROL, 0x01, self.status_byte()])
            },
            (function::READ_STATUS, [0x03, index, _, _]) => {
                let [hi, lo] = self.register(*index).to_be_bytes();
                Some(vec![function::READ_STATUS, 0x03, *index, hi, lo])
            },
            (function::WRITE_FREQUENCY, [0x02, hi, lo]) => {
                if !self.ignore_commands {
                    self.frequency = u16::from_be_bytes([*hi, *lo]);
                }
                Some(vec![function::WRITE_FREQUENCY, 0x02, *hi, *lo])
            },
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for SimulatedDrive {
    fn transport_type(&self) -> &str {
        "simulated"
    }

    fn name(&self) -> &str {
        "Simulated Huanyang"
    }

    async fn open(&mut self, _settings: &SerialSettings) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.stats.record_connection_attempt();
        if state.fail_open {
            state.stats.record_failed_connection();
            return Err(TransportError::ConnectionFailed(
                "simulated adapter unplugged".to_string(),
            ));
        }
        state.open = true;
        state.stats.record_successful_connection();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open = false;
        state.stats.record_disconnection();
        Ok(())
    }

    async fn flush_input(&mut self) -> Result<(), TransportError> {
        self.state.lock().pending.clear();
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected("simulated drive".to_string()));
        }
        state.frames.push(data.to_vec());
        state.stats.record_bytes_sent(data.len());

        if state.silent {
            return Ok(data.len());
        }
        if let Some(pdu) = state.answer(data) {
            let address = state.address;
            let reply = RtuFrame::from_pdu(address, &pdu)
                .map_err(|e| TransportError::SendFailed(e.to_string()))?
                .encode();
            state.pending.extend_from_slice(&reply);
        }
        Ok(data.len())
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected("simulated drive".to_string()));
        }
        if state.pending.is_empty() {
            state.stats.record_timeout();
            return Err(TransportError::Timeout("simulated drive silent".to_string()));
        }
        let n = state.pending.len().min(buffer.len());
        buffer[..n].copy_from_slice(&state.pending[..n]);
        state.pending.drain(..n);
        state.stats.record_bytes_received(n);
        Ok(n)
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().open
    }

    async fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }

    async fn diagnostics(&self) -> HashMap<String, String> {
        let mut diag = HashMap::new();
        diag.insert("transport_type".to_string(), "simulated".to_string());
        diag.insert("frames".to_string(), self.frame_count().to_string());
        diag
    }
}

/// Configuration with all pins assigned and no dwell
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.spindle.min_rpm = 6000;
    config.spindle.max_rpm = 24000;
    config.vfd.txd_pin = Some(17);
    config.vfd.rxd_pin = Some(4);
    config.vfd.rts_pin = Some(16);
    config
}
