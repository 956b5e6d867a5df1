//! Service configuration
//!
//! Layers, lowest priority first: built-in defaults, an optional YAML/TOML/JSON
//! file, then `SPINDLESRV_` environment variables (`__` separates nested keys,
//! e.g. `SPINDLESRV_VFD__PORT=/dev/ttyS1`).

use std::path::Path;
use std::time::Duration;

use common::LoggingConfig;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VfdError};
use crate::link::LinkTiming;
use crate::protocol::VfdBrand;
use crate::transport::Parity;

pub const ENV_PREFIX: &str = "SPINDLESRV_";

/// Highest Modbus slave address
const MAX_ADDRESS: u8 = 247;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub spindle: SpindleConfig,

    #[serde(default)]
    pub vfd: VfdConfig,
}

/// Speed limits and dwell times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleConfig {
    #[serde(default)]
    pub min_rpm: u32,

    #[serde(default = "default_max_rpm")]
    pub max_rpm: u32,

    /// Dwell after a command that starts or reverses the spindle
    #[serde(default)]
    pub spinup_delay_ms: u64,

    /// Dwell after a stop command
    #[serde(default)]
    pub spindown_delay_ms: u64,

    #[serde(default)]
    pub laser_mode: bool,
}

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            min_rpm: 0,
            max_rpm: default_max_rpm(),
            spinup_delay_ms: 0,
            spindown_delay_ms: 0,
            laser_mode: false,
        }
    }
}

impl SpindleConfig {
    pub fn spinup_delay(&self) -> Duration {
        Duration::from_millis(self.spinup_delay_ms)
    }

    pub fn spindown_delay(&self) -> Duration {
        Duration::from_millis(self.spindown_delay_ms)
    }
}

/// Drive and bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfdConfig {
    #[serde(default)]
    pub brand: VfdBrand,

    /// Modbus slave address of the drive
    #[serde(default = "default_address")]
    pub address: u8,

    #[serde(default = "default_port")]
    pub port: String,

    /// Overrides the brand default
    #[serde(default)]
    pub baud_rate: Option<u32>,

    /// Overrides the brand default
    #[serde(default)]
    pub parity: Option<Parity>,

    #[serde(default)]
    pub txd_pin: Option<u8>,

    #[serde(default)]
    pub rxd_pin: Option<u8>,

    #[serde(default)]
    pub rts_pin: Option<u8>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_bus_delay_ms")]
    pub quiet_interval_ms: u64,

    #[serde(default = "default_bus_delay_ms")]
    pub response_timeout_ms: u64,

    /// Minimum spacing between attempts to reopen a lost port
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for VfdConfig {
    fn default() -> Self {
        Self {
            brand: VfdBrand::default(),
            address: default_address(),
            port: default_port(),
            baud_rate: None,
            parity: None,
            txd_pin: None,
            rxd_pin: None,
            rts_pin: None,
            poll_interval_ms: default_poll_interval_ms(),
            quiet_interval_ms: default_bus_delay_ms(),
            response_timeout_ms: default_bus_delay_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl VfdConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming {
            response_timeout: self.response_timeout(),
            quiet_interval: self.quiet_interval(),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}

fn default_max_rpm() -> u32 {
    24000
}

fn default_address() -> u8 {
    0x01
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_bus_delay_ms() -> u64 {
    50
}

fn default_reconnect_interval_ms() -> u64 {
    500
}

impl ServiceConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(VfdError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }

            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| VfdError::config("Invalid file extension"))?;

            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(VfdError::config(format!(
                        "Unsupported config format: {}",
                        extension
                    )))
                },
            };
            debug!("Loading config from {}", path.display());
        }

        figment = figment.merge(Env::prefixed(env_prefix).split("__"));

        let config: ServiceConfig = figment
            .extract()
            .map_err(|e| VfdError::config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Check everything the controller needs before touching the bus
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.spindle.laser_mode {
            problems.push("VFD spindle cannot be used in laser mode".to_string());
        }

        for (name, pin) in [
            ("txd_pin", self.vfd.txd_pin),
            ("rxd_pin", self.vfd.rxd_pin),
            ("rts_pin", self.vfd.rts_pin),
        ] {
            if pin.is_none() {
                problems.push(format!("vfd.{} is not set", name));
            }
        }

        if self.vfd.address == 0 || self.vfd.address > MAX_ADDRESS {
            problems.push(format!(
                "vfd.address {} outside 1..={}",
                self.vfd.address, MAX_ADDRESS
            ));
        }

        if self.vfd.port.is_empty() {
            problems.push("vfd.port is empty".to_string());
        }

        if self.vfd.poll_interval_ms == 0 {
            problems.push("vfd.poll_interval_ms must be greater than zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(VfdError::Config(problems.join("; ")))
        }
    }

    /// Effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
