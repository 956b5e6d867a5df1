//! VFD spindle controller
//!
//! Callers command the spindle through [`VfdController`]; a single background
//! task owns the link and reconciles the commanded configuration against what
//! the drive reports. Commands travel through a one-slot mailbox (last write
//! wins), so callers never wait on the bus.
//!
//! Each poll the task:
//! 1. takes the newest commanded configuration, if any
//! 2. forces a stop while the link is unhealthy or the machine is alarmed
//! 3. sends only what differs from the last observed drive configuration
//! 4. reads status back; the outcome alone decides health
//! 5. raises a spindle control alarm when the drive disagrees with the
//!    command or a spin is requested over a dead link
//!
//! An alarm drops the commanded configuration back to stopped. Clearing the
//! alarm never restarts the spindle; that takes a new command.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, SpindleConfig};
use crate::error::Result;
use crate::link::{LinkSettings, VfdLink};
use crate::machine::MachineContext;
use crate::pins::Pin;
use crate::protocol::{DesiredConfig, ObservedStatus, SpindleState, VfdProtocol};
use crate::transport::Transport;

/// Largest configured-vs-commanded rpm difference treated as equal
pub const RPM_TOLERANCE: u32 = 1;

/// Speed limits and dwell times applied to every command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpindleLimits {
    pub min_rpm: u32,
    pub max_rpm: u32,
    pub spinup_delay: Duration,
    pub spindown_delay: Duration,
}

impl From<&SpindleConfig> for SpindleLimits {
    fn from(config: &SpindleConfig) -> Self {
        Self {
            min_rpm: config.min_rpm,
            max_rpm: config.max_rpm,
            spinup_delay: config.spinup_delay(),
            spindown_delay: config.spindown_delay(),
        }
    }
}

/// Apply the speed override, then clamp into the configured range
///
/// Zero stays zero unless the range is degenerate (`min >= max`), in which
/// case every request maps to `max`.
pub fn bound_rpm(rpm: u32, override_percent: u32, min_rpm: u32, max_rpm: u32) -> u32 {
    let scaled = (u64::from(rpm) * u64::from(override_percent) / 100).min(u64::from(u32::MAX)) as u32;

    if min_rpm >= max_rpm || scaled >= max_rpm {
        max_rpm
    } else if scaled != 0 && scaled <= min_rpm {
        min_rpm
    } else {
        scaled
    }
}

/// Mismatch that forces a machine reset and alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCondition {
    StateMismatch {
        expected: SpindleState,
        actual: SpindleState,
    },
    RpmMismatch {
        expected: u32,
        actual: u32,
    },
    UnhealthyWithAction {
        state: SpindleState,
        rpm: u32,
    },
}

impl fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCondition::StateMismatch { expected, actual } => write!(
                f,
                "RS485 spindle reported incorrect state configuration (expected {} but got {})",
                expected, actual
            ),
            FatalCondition::RpmMismatch { expected, actual } => write!(
                f,
                "RS485 spindle reported incorrect rpm configuration (expected {} but got {})",
                expected, actual
            ),
            FatalCondition::UnhealthyWithAction { state, rpm } => write!(
                f,
                "RS485 unhealthy but action requested! (state {}, rpm {})",
                state, rpm
            ),
        }
    }
}

/// State shared between callers and the poll task
///
/// Lock order: `state` before `mailbox`.
#[derive(Debug)]
struct ControllerShared {
    /// Last commanded direction, as seen by callers
    state: Mutex<SpindleState>,
    mailbox: Mutex<Option<DesiredConfig>>,
    healthy: AtomicBool,
    last_status: Mutex<Option<ObservedStatus>>,
    polls: AtomicU64,
}

impl ControllerShared {
    fn new(healthy: bool) -> Self {
        Self {
            state: Mutex::new(SpindleState::Disabled),
            mailbox: Mutex::new(None),
            healthy: AtomicBool::new(healthy),
            last_status: Mutex::new(None),
            polls: AtomicU64::new(0),
        }
    }

    fn post(&self, desired: DesiredConfig) {
        *self.mailbox.lock() = Some(desired);
    }

    fn take(&self) -> Option<DesiredConfig> {
        self.mailbox.lock().take()
    }

    /// Record a new direction and post it in one step; returns the previous one
    fn command(&self, state: SpindleState, rpm: u32) -> SpindleState {
        let mut current = self.state.lock();
        let previous = std::mem::replace(&mut *current, state);
        self.post(DesiredConfig::new(state, rpm));
        previous
    }

    /// Post a new speed for the current direction
    fn command_rpm(&self, rpm: u32) {
        let current = self.state.lock();
        self.post(DesiredConfig::new(*current, rpm));
    }

    fn state(&self) -> SpindleState {
        *self.state.lock()
    }

    /// Forget the commanded direction after an alarm
    fn stand_down(&self) {
        *self.state.lock() = SpindleState::Disabled;
    }
}

/// Background half of the controller; owns the link and the adapter
struct Reconciler<P> {
    protocol: P,
    link: VfdLink,
    shared: Arc<ControllerShared>,
    machine: Arc<dyn MachineContext>,
    desired: DesiredConfig,
    observed: Option<ObservedStatus>,
    healthy: bool,
}

impl<P: VfdProtocol> Reconciler<P> {
    fn new(
        protocol: P,
        link: VfdLink,
        shared: Arc<ControllerShared>,
        machine: Arc<dyn MachineContext>,
    ) -> Self {
        Self {
            protocol,
            link,
            shared,
            machine,
            desired: DesiredConfig::STOPPED,
            observed: None,
            healthy: true,
        }
    }

    async fn run(mut self, poll_interval: Duration) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "VFD poll task started: {} at address {}, interval {}ms",
            self.protocol.name(),
            self.link.address(),
            poll_interval.as_millis()
        );

        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    /// One reconciliation cycle
    async fn poll_once(&mut self) -> Option<FatalCondition> {
        if let Some(next) = self.shared.take() {
            self.desired = next;
        }

        let alarmed = self.machine.is_alarmed();
        if alarmed {
            self.stand_down();
        }

        let forced = !self.healthy || alarmed;
        let (state, rpm) = if forced {
            (Some(SpindleState::Disabled), Some(0))
        } else {
            self.changes()
        };

        if state.is_some() || rpm.is_some() {
            if let Err(e) = self
                .protocol
                .request_configuration(&mut self.link, state, rpm)
                .await
            {
                debug!("VFD configuration request failed: {}", e);
            }
        }

        match self.protocol.read_status(&mut self.link).await {
            Ok(status) => {
                self.observed = Some(status);
                *self.shared.last_status.lock() = Some(status);
                self.set_health(true);
            },
            Err(e) => {
                if e.is_transient() {
                    debug!("VFD status read failed: {}", e);
                } else {
                    warn!("VFD status read failed: {}", e);
                }
                if self.healthy {
                    let stats = self.link.stats().await;
                    debug!(
                        "RS485 link: {} bytes out, {} bytes in, {} timeouts",
                        stats.bytes_sent, stats.bytes_received, stats.timeouts
                    );
                }
                self.set_health(false);
            },
        }
        self.shared.polls.fetch_add(1, Ordering::AcqRel);

        if self.machine.is_alarmed() {
            return None;
        }

        let fatal = self.check();
        if let Some(condition) = fatal {
            error!("{}", condition);
            self.machine.raise_spindle_control_alarm();
            self.stand_down();
        }
        fatal
    }

    /// Drop whatever was commanded; the spindle stays stopped until a new command
    fn stand_down(&mut self) {
        if self.desired != DesiredConfig::STOPPED {
            info!(
                "Spindle request {} at {} rpm discarded by alarm",
                self.desired.state, self.desired.rpm
            );
            self.desired = DesiredConfig::STOPPED;
        }
        self.shared.stand_down();
        self.machine.set_spindle_speed(0);
    }

    /// Components of the desired configuration the drive does not have yet
    fn changes(&self) -> (Option<SpindleState>, Option<u32>) {
        let desired = self.desired;
        match self.observed {
            None => (Some(desired.state), Some(desired.rpm)),
            Some(observed) => {
                let state = (observed.configured_state != desired.state).then_some(desired.state);
                let rpm = (observed.configured_rpm.abs_diff(desired.rpm) > RPM_TOLERANCE)
                    .then_some(desired.rpm);
                (state, rpm)
            },
        }
    }

    fn check(&self) -> Option<FatalCondition> {
        let desired = self.desired;

        if !self.healthy {
            if desired.rpm > 0 || desired.state.is_spinning() {
                return Some(FatalCondition::UnhealthyWithAction {
                    state: desired.state,
                    rpm: desired.rpm,
                });
            }
            return None;
        }

        let observed = self.observed?;
        if observed.configured_state != desired.state {
            return Some(FatalCondition::StateMismatch {
                expected: desired.state,
                actual: observed.configured_state,
            });
        }
        if desired.state.is_spinning()
            && observed.configured_rpm.abs_diff(desired.rpm) > RPM_TOLERANCE
        {
            return Some(FatalCondition::RpmMismatch {
                expected: desired.rpm,
                actual: observed.configured_rpm,
            });
        }
        None
    }

    fn set_health(&mut self, healthy: bool) {
        if healthy != self.healthy {
            if healthy {
                info!("RS485 became healthy");
            } else {
                warn!("RS485 is NOT healthy");
            }
        }
        self.healthy = healthy;
        self.shared.healthy.store(healthy, Ordering::Release);
    }
}

/// Public control surface of one VFD spindle
pub struct VfdController {
    shared: Arc<ControllerShared>,
    machine: Arc<dyn MachineContext>,
    limits: SpindleLimits,
    task: Option<JoinHandle<()>>,
}

impl VfdController {
    /// Start the controller; on any failure log it and return a disabled one
    pub async fn init<P>(
        config: &ServiceConfig,
        protocol: P,
        transport: Box<dyn Transport>,
        machine: Arc<dyn MachineContext>,
    ) -> Self
    where
        P: VfdProtocol + 'static,
    {
        let limits = SpindleLimits::from(&config.spindle);
        match Self::try_init(config, protocol, transport, Arc::clone(&machine)).await {
            Ok(controller) => controller,
            Err(e) => {
                error!("VFD spindle disabled: {}", e);
                Self::disabled(machine, limits)
            },
        }
    }

    /// Start the controller, returning the reason if it cannot run
    pub async fn try_init<P>(
        config: &ServiceConfig,
        protocol: P,
        transport: Box<dyn Transport>,
        machine: Arc<dyn MachineContext>,
    ) -> Result<Self>
    where
        P: VfdProtocol + 'static,
    {
        config.validate()?;

        let vfd = &config.vfd;
        let settings = LinkSettings {
            port: vfd.port.clone(),
            serial: protocol
                .default_serial_settings()
                .with_overrides(vfd.baud_rate, vfd.parity),
            tx_pin: Pin::from_config(vfd.txd_pin),
            rx_pin: Pin::from_config(vfd.rxd_pin),
            rts_pin: Pin::from_config(vfd.rts_pin),
        };
        settings.validate()?;
        info!("{}", settings.config_message());

        let mut link = VfdLink::new(transport, vfd.address, vfd.link_timing());
        link.open(&settings.serial).await?;
        debug!("VFD transport: {:?}", link.diagnostics().await);
        info!(
            "{} VFD on {} ({}), address {}",
            protocol.name(),
            settings.port,
            settings.serial,
            vfd.address
        );

        let shared = Arc::new(ControllerShared::new(true));
        let owner = link.owner();
        let reconciler = Reconciler::new(protocol, link, Arc::clone(&shared), Arc::clone(&machine));
        let poll_interval = vfd.poll_interval();
        let task = tokio::spawn(owner.scope(reconciler.run(poll_interval)));

        Ok(Self {
            shared,
            machine,
            limits: SpindleLimits::from(&config.spindle),
            task: Some(task),
        })
    }

    fn disabled(machine: Arc<dyn MachineContext>, limits: SpindleLimits) -> Self {
        Self {
            shared: Arc::new(ControllerShared::new(false)),
            machine,
            limits,
            task: None,
        }
    }

    /// Command direction and speed
    ///
    /// Returns after the spin-up or spin-down dwell when the direction
    /// changes. Does nothing while the machine is aborting or when the
    /// controller is disabled.
    pub async fn set_state(&self, state: SpindleState, rpm: u32) {
        if !self.is_enabled() || self.machine.is_aborting() {
            return;
        }

        let rpm = self.bound(rpm);
        self.machine.set_spindle_speed(if state.is_spinning() { rpm } else { 0 });

        let previous = self.shared.command(state, rpm);
        if previous != state {
            let dwell = if state.is_spinning() {
                self.limits.spinup_delay
            } else {
                self.limits.spindown_delay
            };
            debug!("Spindle {} -> {}, dwell {}ms", previous, state, dwell.as_millis());
            tokio::time::sleep(dwell).await;
        }
    }

    /// Change speed keeping the current direction; returns the bounded rpm
    pub fn set_rpm(&self, rpm: u32) -> u32 {
        if !self.is_enabled() {
            return 0;
        }

        let rpm = self.bound(rpm);
        self.machine.set_spindle_speed(rpm);
        self.shared.command_rpm(rpm);
        rpm
    }

    pub async fn stop(&self) {
        self.set_state(SpindleState::Disabled, 0).await;
    }

    /// Last commanded direction
    pub fn get_state(&self) -> SpindleState {
        self.shared.state()
    }

    pub fn is_enabled(&self) -> bool {
        self.task.is_some()
    }

    /// Outcome of the most recent status read
    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire)
    }

    /// Most recent successful status read, up to one poll old
    pub fn last_status(&self) -> Option<ObservedStatus> {
        *self.shared.last_status.lock()
    }

    /// Completed poll cycles
    pub fn poll_count(&self) -> u64 {
        self.shared.polls.load(Ordering::Acquire)
    }

    pub fn limits(&self) -> SpindleLimits {
        self.limits
    }

    fn bound(&self, rpm: u32) -> u32 {
        bound_rpm(
            rpm,
            self.machine.spindle_speed_override(),
            self.limits.min_rpm,
            self.limits.max_rpm,
        )
    }
}

impl fmt::Debug for VfdController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfdController")
            .field("enabled", &self.is_enabled())
            .field("healthy", &self.is_healthy())
            .field("state", &self.get_state())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Drop for VfdController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
