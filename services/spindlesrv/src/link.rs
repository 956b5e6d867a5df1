//! Wire-level exchange with the drive
//!
//! [`VfdLink::send_command`] is the only path to the bus. It must run inside
//! the task that owns the link; see [`LinkOwner::scope`].
//!
//! A port lost to an I/O error is reopened with the settings of the last
//! [`VfdLink::open`], at most once per reconnect interval. Each attempt rides
//! on a command, so the next command after a loss tries first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::RtuFrame;
use crate::error::{Result, VfdError};
use crate::pins::Pin;
use crate::transport::{SerialSettings, Transport, TransportError, TransportStats};

tokio::task_local! {
    static LINK_OWNER: u64;
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the task allowed to drive a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOwner(u64);

impl LinkOwner {
    /// Run `fut` as the owner of the link this token was taken from
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        LINK_OWNER.scope(self.0, fut).await
    }
}

/// Physical connection parameters of the RS-485 bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub port: String,
    pub serial: SerialSettings,
    pub tx_pin: Pin,
    pub rx_pin: Pin,
    pub rts_pin: Pin,
}

impl LinkSettings {
    /// All three UART pins must be assigned
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("TXD", self.tx_pin),
            ("RXD", self.rx_pin),
            ("RTS", self.rts_pin),
        ]
        .iter()
        .filter(|(_, pin)| !pin.is_defined())
        .map(|(name, _)| *name)
        .collect();

        if !missing.is_empty() {
            return Err(VfdError::config(format!(
                "Undefined RS485 pin(s): {}",
                missing.join(", ")
            )));
        }

        self.serial.validate()?;
        Ok(())
    }

    pub fn config_message(&self) -> String {
        format!(
            "VFD RS485 Tx:{} Rx:{} RTS:{}",
            self.tx_pin, self.rx_pin, self.rts_pin
        )
    }
}

/// Bus timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Longest wait for a complete reply
    pub response_timeout: Duration,
    /// Idle time enforced after every exchange
    pub quiet_interval: Duration,
    /// Minimum spacing between attempts to reopen a lost port
    pub reconnect_interval: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(50),
            quiet_interval: Duration::from_millis(50),
            reconnect_interval: Duration::from_millis(500),
        }
    }
}

/// One request and the size of the reply it expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusCommand {
    /// Function code followed by data; the address is filled in by the link
    pub pdu: Vec<u8>,
    /// Reply size without address and CRC
    pub response_len: usize,
}

impl ModbusCommand {
    pub fn new(pdu: Vec<u8>, response_len: usize) -> Self {
        Self { pdu, response_len }
    }

    fn wire_response_len(&self) -> usize {
        self.response_len + 3
    }
}

/// Port reopen counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct ReconnectContext {
    /// Settings of the last explicit open; `None` disables reopening
    settings: Option<SerialSettings>,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
    stats: ReconnectStats,
}

/// Errors after which the port can no longer be trusted
fn drops_connection(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::NotConnected(_)
            | TransportError::SendFailed(_)
            | TransportError::ReceiveFailed(_)
            | TransportError::IoError(_)
    )
}

/// Addressed Modbus RTU link to one drive
#[derive(Debug)]
pub struct VfdLink {
    transport: Box<dyn Transport>,
    address: u8,
    owner: u64,
    timing: LinkTiming,
    reconnect: ReconnectContext,
}

impl VfdLink {
    pub fn new(transport: Box<dyn Transport>, address: u8, timing: LinkTiming) -> Self {
        Self {
            transport,
            address,
            owner: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            timing,
            reconnect: ReconnectContext::default(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Token for the task that will own this link
    pub fn owner(&self) -> LinkOwner {
        LinkOwner(self.owner)
    }

    /// Open the port and remember the settings for later reopens
    pub async fn open(&mut self, settings: &SerialSettings) -> Result<()> {
        self.transport.open(settings).await?;
        self.reconnect.settings = Some(*settings);
        self.reconnect.last_attempt = None;
        self.reconnect.consecutive_failures = 0;
        Ok(())
    }

    /// Close the port; it stays closed until the next [`VfdLink::open`]
    pub async fn close(&mut self) -> Result<()> {
        self.reconnect.settings = None;
        self.transport.close().await?;
        Ok(())
    }

    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.reconnect.stats
    }

    pub async fn stats(&self) -> TransportStats {
        self.transport.stats().await
    }

    pub async fn diagnostics(&self) -> HashMap<String, String> {
        self.transport.diagnostics().await
    }

    /// Send one command and return the validated reply PDU
    ///
    /// Fills in the address, appends the CRC, flushes stale input, writes,
    /// reads the expected reply length before the response timeout, waits the
    /// quiet interval and then validates length, CRC and address.
    ///
    /// # Panics
    ///
    /// When called from any task other than the link owner.
    pub async fn send_command(&mut self, command: &ModbusCommand) -> Result<Vec<u8>> {
        let caller = LINK_OWNER.try_with(|id| *id).ok();
        assert!(
            caller == Some(self.owner),
            "VFD link {} used outside the poll task that owns it (caller {:?})",
            self.owner,
            caller
        );

        let request = RtuFrame::from_pdu(self.address, &command.pdu)?.encode();
        let expected_len = command.wire_response_len();

        let outcome = match self.ensure_connected().await {
            Ok(()) => self.exchange(&request, expected_len).await,
            Err(e) => Err(e),
        };
        if let Err(VfdError::Transport(e)) = &outcome {
            if drops_connection(e) {
                self.discard_connection(e).await;
            }
        }
        tokio::time::sleep(self.timing.quiet_interval).await;

        let raw = outcome?;
        let reply = RtuFrame::decode(&raw, expected_len, self.address)?;
        Ok(reply.pdu())
    }

    /// Reopen a lost port, rate limited by the reconnect interval
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.transport.is_connected().await {
            return Ok(());
        }

        let Some(settings) = self.reconnect.settings else {
            return Err(TransportError::NotConnected(format!(
                "VFD link to address {} is closed",
                self.address
            ))
            .into());
        };

        let now = Instant::now();
        if let Some(last) = self.reconnect.last_attempt {
            let since = now.duration_since(last);
            if since < self.timing.reconnect_interval {
                return Err(TransportError::NotConnected(format!(
                    "reopen due in {:?}",
                    self.timing.reconnect_interval - since
                ))
                .into());
            }
        }

        self.reconnect.last_attempt = Some(now);
        self.reconnect.stats.attempts += 1;
        match self.transport.open(&settings).await {
            Ok(()) => {
                self.reconnect.stats.successes += 1;
                info!(
                    "RS485 port reopened after {} failed attempt(s)",
                    self.reconnect.consecutive_failures
                );
                self.reconnect.consecutive_failures = 0;
                Ok(())
            },
            Err(e) => {
                self.reconnect.stats.failures += 1;
                self.reconnect.consecutive_failures += 1;
                if self.reconnect.consecutive_failures == 1 {
                    warn!("RS485 port reopen failed: {}", e);
                } else {
                    debug!(
                        "RS485 port reopen failed ({} in a row): {}",
                        self.reconnect.consecutive_failures, e
                    );
                }
                Err(e.into())
            },
        }
    }

    /// Close a port that failed mid-exchange so the next command reopens it
    async fn discard_connection(&mut self, cause: &TransportError) {
        if !self.transport.is_connected().await {
            return;
        }
        warn!("RS485 port dropped: {}", cause);
        if let Err(e) = self.transport.close().await {
            debug!("Closing failed RS485 port: {}", e);
        }
    }

    async fn exchange(&mut self, request: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        self.transport.flush_input().await?;
        self.transport.send(request).await?;
        trace!("VFD Tx: {}", common::hex::encode_spaced(request));

        let deadline = Instant::now() + self.timing.response_timeout;
        let mut buffer = vec![0u8; expected_len];
        let mut received = 0;

        while received < expected_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self
                .transport
                .receive(&mut buffer[received..], Some(remaining))
                .await
            {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(TransportError::Timeout(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(received);
        trace!("VFD Rx: {}", common::hex::encode_spaced(&buffer));

        if received == 0 {
            debug!("No response from VFD at address {}", self.address);
            return Err(TransportError::Timeout(format!(
                "no response within {:?}",
                self.timing.response_timeout
            ))
            .into());
        }

        Ok(buffer)
    }
}
