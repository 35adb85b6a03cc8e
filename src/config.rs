//! Rig configuration using Figment.
//!
//! Configuration is loaded from a TOML file and then from environment variables
//! prefixed with `REACTOR_`; nested keys are separated by a double underscore:
//!
//! ```text
//! REACTOR_APPLICATION__LOG_LEVEL=debug
//! REACTOR_PORTS__RS485=/dev/ttyUSB3
//! REACTOR_LIMITS__REACTOR_MAX_TEMP=450
//! ```
//!
//! Every section has defaults, so a file only needs the values that differ.
//! The settings are validated after loading. [`Settings::save_to`] writes the
//! effective settings back out (the `write-config` command).

use crate::error::{AppResult, DaqError};
use crate::messages::CommandLimits;
use crate::snapshot::{DeviceEnabled, FLOW_CHANNELS, HEATER_COUNT, PRESSURE_HAZARDS, TEMPERATURE_HAZARDS};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level rig configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// `[application]`
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[ports]`
    #[serde(default)]
    pub ports: PortConfig,
    /// `[scheduler]`
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// `[limits]`
    #[serde(default)]
    pub limits: LimitConfig,
    /// `[heaters]`: heater setpoints
    #[serde(default)]
    pub heaters: SetpointConfig,
    /// `[flows]`: flow controller setpoints
    #[serde(default)]
    pub flows: SetpointConfig,
    /// `[devices]`: which devices are polled
    #[serde(default)]
    pub devices: DeviceEnabled,
    /// `[power_meter]`
    #[serde(default)]
    pub power_meter: PowerMeterConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Display name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory for the hourly CSV process logs
    pub data_dir: PathBuf,
    /// Where the pre-emergency snapshot is kept while an emergency is active
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Reactor DAQ".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
            state_file: Some(PathBuf::from("data/pre_emergency.toml")),
        }
    }
}

/// Serial port identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Shared RS-485 line (Modbus devices and flow devices)
    pub rs485: String,
    /// Power meter port
    pub power_meter: String,
    /// Gas analyzer port
    pub gas_analyzer: String,
    /// Power meter baud rate
    #[serde(default = "default_baud_rate")]
    pub power_meter_baud: u32,
    /// Gas analyzer baud rate
    #[serde(default = "default_baud_rate")]
    pub gas_analyzer_baud: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            rs485: "/dev/ttyUSB0".to_string(),
            power_meter: "/dev/ttyUSB1".to_string(),
            gas_analyzer: "/dev/ttyUSB2".to_string(),
            power_meter_baud: default_baud_rate(),
            gas_analyzer_baud: default_baud_rate(),
        }
    }
}

/// Worker timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pause between the end of one poll pass and the start of the next
    pub poll_interval_ms: u64,
    /// Upper bound on an idle wait for commands
    pub command_poll_ms: u64,
    /// Timeout for synchronous requests to the worker
    pub reply_timeout_ms: u64,
    /// Timeout for each request issued during Restart
    pub restart_reply_timeout_ms: u64,
    /// Depth of each command queue
    pub command_channel_capacity: usize,
    /// Settle time after (re)opening the shared line
    pub reconnect_settle_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            command_poll_ms: 200,
            reply_timeout_ms: 2000,
            restart_reply_timeout_ms: 4000,
            command_channel_capacity: 256,
            reconnect_settle_ms: 100,
        }
    }
}

impl SchedulerConfig {
    /// `poll_interval_ms` as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `command_poll_ms` as a `Duration`.
    pub fn command_poll(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms)
    }

    /// `reply_timeout_ms` as a `Duration`.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// `restart_reply_timeout_ms` as a `Duration`.
    pub fn restart_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_reply_timeout_ms)
    }

    /// `reconnect_settle_ms` as a `Duration`.
    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }
}

/// Hazard limits. A missing limit disables that hazard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Heater 1 (TK4 address 2)
    #[serde(default)]
    pub heater_1_max_temp: Option<f64>,
    /// Heater 2 coil (TK4 address 1)
    #[serde(default)]
    pub heater_2_coil_max_temp: Option<f64>,
    /// Reactor (TK4 address 3)
    #[serde(default)]
    pub reactor_max_temp: Option<f64>,
    /// PSM4 channel 1, bar
    #[serde(default)]
    pub pressure_1_max: Option<f64>,
    /// PSM4 channel 2, bar
    #[serde(default)]
    pub pressure_2_max: Option<f64>,
    /// PSM4 channel 3, bar
    #[serde(default)]
    pub pressure_3_max: Option<f64>,
    /// Largest setpoint an operator may send to a heater
    #[serde(default = "default_max_heater_setpoint")]
    pub max_heater_setpoint: f64,
    /// Largest setpoint an operator may send to a flow controller
    #[serde(default = "default_max_flow_setpoint")]
    pub max_flow_setpoint: f64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            heater_1_max_temp: Some(400.0),
            heater_2_coil_max_temp: Some(400.0),
            reactor_max_temp: Some(400.0),
            pressure_1_max: Some(5.0),
            pressure_2_max: Some(5.0),
            pressure_3_max: Some(5.0),
            max_heater_setpoint: default_max_heater_setpoint(),
            max_flow_setpoint: default_max_flow_setpoint(),
        }
    }
}

impl LimitConfig {
    /// Over-temperature limits in hazard-zone order.
    pub fn temperature_limits(&self) -> [Option<f64>; TEMPERATURE_HAZARDS] {
        [
            self.heater_1_max_temp,
            self.heater_2_coil_max_temp,
            self.reactor_max_temp,
        ]
    }

    /// Over-pressure limits for PSM4 channels 1..=3.
    pub fn pressure_limits(&self) -> [Option<f64>; PRESSURE_HAZARDS] {
        [self.pressure_1_max, self.pressure_2_max, self.pressure_3_max]
    }

    /// Operator input limits derived from these settings.
    pub fn command_limits(&self) -> CommandLimits {
        CommandLimits {
            max_heater_setpoint: self.max_heater_setpoint,
            max_flow_setpoint: self.max_flow_setpoint,
            ..CommandLimits::default()
        }
    }
}

/// Last operator-confirmed setpoints, restored into the snapshot at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetpointConfig {
    /// One setpoint per channel
    pub setpoints: [f64; HEATER_COUNT],
}

/// Power meter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerMeterConfig {
    /// Multiplier applied to power and energy readings
    pub scaling_factor: f64,
}

impl Default for PowerMeterConfig {
    fn default() -> Self {
        Self {
            scaling_factor: 1.0,
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_max_heater_setpoint() -> f64 {
    1200.0
}

fn default_max_flow_setpoint() -> f64 {
    1000.0
}

impl Settings {
    /// Load configuration from a TOML file and `REACTOR_` environment variables.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("REACTOR_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Write the settings back as TOML.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| DaqError::Persistence(format!("cannot serialize settings: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        for (name, port) in [
            ("rs485", &self.ports.rs485),
            ("power_meter", &self.ports.power_meter),
            ("gas_analyzer", &self.ports.gas_analyzer),
        ] {
            if port.trim().is_empty() {
                return invalid(format!("Port '{name}' cannot be empty"));
            }
        }

        let s = &self.scheduler;
        for (name, value) in [
            ("poll_interval_ms", s.poll_interval_ms),
            ("command_poll_ms", s.command_poll_ms),
            ("reply_timeout_ms", s.reply_timeout_ms),
            ("restart_reply_timeout_ms", s.restart_reply_timeout_ms),
        ] {
            if value == 0 {
                return invalid(format!("scheduler.{name} must be positive"));
            }
        }
        if s.command_channel_capacity == 0 {
            return invalid("scheduler.command_channel_capacity must be positive".to_string());
        }

        let limits = self
            .limits
            .temperature_limits()
            .into_iter()
            .chain(self.limits.pressure_limits())
            .flatten()
            .chain([self.limits.max_heater_setpoint, self.limits.max_flow_setpoint]);
        for limit in limits {
            if !limit.is_finite() || limit < 0.0 {
                return invalid(format!("Invalid limit {limit}: must be finite and non-negative"));
            }
        }

        for (group, setpoints, max) in [
            ("heaters", &self.heaters.setpoints, self.limits.max_heater_setpoint),
            ("flows", &self.flows.setpoints, self.limits.max_flow_setpoint),
        ] {
            if let Some(bad) = setpoints
                .iter()
                .find(|v| !v.is_finite() || **v < 0.0 || **v > max)
            {
                return invalid(format!("{group}.setpoints contains {bad}, allowed 0..={max}"));
            }
        }

        if !self.power_meter.scaling_factor.is_finite() || self.power_meter.scaling_factor <= 0.0 {
            return invalid("power_meter.scaling_factor must be positive".to_string());
        }

        Ok(())
    }
}

// `SetpointConfig` serves both heaters and flow channels.
const _: () = assert!(FLOW_CHANNELS == HEATER_COUNT);
