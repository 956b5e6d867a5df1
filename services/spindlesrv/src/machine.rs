//! Machine-wide state shared with the spindle controller
//!
//! The controller reads the override and abort/alarm flags and writes the
//! commanded spindle speed. A fatal spindle condition goes through
//! [`MachineContext::raise_spindle_control_alarm`], which resets the machine
//! and latches an alarm until someone clears it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::RwLock;
use tracing::{error, info};

/// Narrow view of the motion controller consumed by the spindle layer
pub trait MachineContext: Send + Sync {
    /// A latched alarm is active
    fn is_alarmed(&self) -> bool;

    /// A reset/abort is in progress
    fn is_aborting(&self) -> bool;

    /// Spindle speed override in percent (100 = no override)
    fn spindle_speed_override(&self) -> u32;

    /// Publish the commanded spindle speed
    fn set_spindle_speed(&self, rpm: u32);

    /// Reset the machine and latch a spindle control alarm
    fn raise_spindle_control_alarm(&self);
}

/// Latched machine alarms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alarm {
    SpindleControl = 10,
}

impl Alarm {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            10 => Some(Alarm::SpindleControl),
            _ => None,
        }
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alarm::SpindleControl => write!(f, "ALARM:{} Spindle Control", *self as u8),
        }
    }
}

type ResetHandler = Box<dyn Fn() + Send + Sync>;

const NO_ALARM: u8 = 0;

/// Atomics-backed machine state
pub struct MachineState {
    alarm: AtomicU8,
    aborting: AtomicBool,
    override_percent: AtomicU32,
    spindle_speed: AtomicU32,
    reset_count: AtomicU32,
    reset_handler: RwLock<Option<ResetHandler>>,
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            alarm: AtomicU8::new(NO_ALARM),
            aborting: AtomicBool::new(false),
            override_percent: AtomicU32::new(100),
            spindle_speed: AtomicU32::new(0),
            reset_count: AtomicU32::new(0),
            reset_handler: RwLock::new(None),
        }
    }

    /// Install a callback invoked on every machine reset
    pub fn set_reset_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.reset_handler.write() = Some(Box::new(handler));
    }

    pub fn alarm(&self) -> Option<Alarm> {
        Alarm::from_code(self.alarm.load(Ordering::Acquire))
    }

    /// Unlatch the alarm after external re-initialization
    pub fn clear_alarm(&self) {
        if self.alarm.swap(NO_ALARM, Ordering::AcqRel) != NO_ALARM {
            info!("Alarm cleared");
        }
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::Acquire)
    }

    pub fn spindle_speed(&self) -> u32 {
        self.spindle_speed.load(Ordering::Acquire)
    }

    pub fn set_aborting(&self, aborting: bool) {
        self.aborting.store(aborting, Ordering::Release);
    }

    /// Set the spindle override, clamped to 10..=200 percent
    pub fn set_override(&self, percent: u32) {
        self.override_percent
            .store(percent.clamp(10, 200), Ordering::Release);
    }

    fn reset(&self) {
        self.reset_count.fetch_add(1, Ordering::AcqRel);
        if let Some(handler) = self.reset_handler.read().as_ref() {
            handler();
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineState")
            .field("alarm", &self.alarm())
            .field("aborting", &self.is_aborting())
            .field("override_percent", &self.spindle_speed_override())
            .field("spindle_speed", &self.spindle_speed())
            .field("reset_count", &self.reset_count())
            .finish()
    }
}

impl MachineContext for MachineState {
    fn is_alarmed(&self) -> bool {
        self.alarm().is_some()
    }

    fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    fn spindle_speed_override(&self) -> u32 {
        self.override_percent.load(Ordering::Acquire)
    }

    fn set_spindle_speed(&self, rpm: u32) {
        self.spindle_speed.store(rpm, Ordering::Release);
    }

    fn raise_spindle_control_alarm(&self) {
        self.reset();
        self.alarm
            .store(Alarm::SpindleControl as u8, Ordering::Release);
        error!("{}", Alarm::SpindleControl);
    }
}
