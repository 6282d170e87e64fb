//! # Actuator Host Configuration
//!
//! A single TOML file describes the actuator, the control loop tuning, the
//! sensor calibration table, and the command interface.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [actuator]
//! name = "tensile-rig"
//! min_travel_mm = 0.0
//! max_travel_mm = 146.0
//! default_speed_limit = 500
//!
//! [control]
//! tick_ms = 10
//! kp = 20.0
//! kd = 0.5
//!
//! [calibration]
//! file = "calibration.json"
//!
//! [interface]
//! protocol = "both"
//! serial = "/dev/ttyUSB0"
//! baud = 9600
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::calibration::{Calibration, CalibrationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the actuator, control loop, calibration and interface.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Directory the config was loaded from; relative calibration paths resolve against it.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Mechanical limits and output ratings of the actuator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActuatorConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_min_travel")]
    pub min_travel_mm: f64,
    #[serde(default = "default_max_travel")]
    pub max_travel_mm: f64,
    #[serde(default)]
    pub soft_margin_mm: f64,
    #[serde(default = "default_rated_output")]
    pub rated_output: u16,
    #[serde(default = "default_speed_limit")]
    pub default_speed_limit: u16,
    #[serde(default)]
    pub home_mm: Option<f64>,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            name: None,
            min_travel_mm: default_min_travel(),
            max_travel_mm: default_max_travel(),
            soft_margin_mm: 0.0,
            rated_output: default_rated_output(),
            default_speed_limit: default_speed_limit(),
            home_mm: None,
        }
    }
}

/// Control loop cadence, deadbands and PID gains.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_position_deadband")]
    pub position_deadband_mm: f64,
    #[serde(default = "default_output_deadband")]
    pub output_deadband: f64,
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    #[serde(default = "default_integral_limit")]
    pub integral_limit: f64,
    /// Output units per second the effective speed limit may fall by. Zero disables ramping.
    #[serde(default = "default_ramp_rate")]
    pub ramp_rate: f64,
    #[serde(default = "default_sensor_fault_threshold")]
    pub sensor_fault_threshold: u32,
    #[serde(default = "default_feedrate")]
    pub default_feedrate: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            position_deadband_mm: default_position_deadband(),
            output_deadband: default_output_deadband(),
            kp: default_kp(),
            ki: 0.0,
            kd: default_kd(),
            integral_limit: default_integral_limit(),
            ramp_rate: default_ramp_rate(),
            sensor_fault_threshold: default_sensor_fault_threshold(),
            default_feedrate: default_feedrate(),
        }
    }
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Calibration table source: a JSON file, or inline arrays.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub analogs_mv: Vec<f64>,
    #[serde(default)]
    pub positions_mm: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Positioning-language subset only (G0/G1/G90/G91).
    Gcode,
    /// Terminal-style commands only.
    Terminal,
    #[default]
    Both,
}

impl std::str::FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gcode" => Ok(Protocol::Gcode),
            "terminal" => Ok(Protocol::Terminal),
            "both" => Ok(Protocol::Both),
            other => Err(ConfigError::Invalid(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Where commands come from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            serial: None,
            baud: default_baud(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: false,
        }
    }
}

/// Parameters of the simulated plant used when no real hardware is attached.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_sim_max_speed")]
    pub max_speed_mm_s: f64,
    #[serde(default)]
    pub sensor_noise_mv: f64,
    /// Probability in [0, 1] that any single read fails.
    #[serde(default)]
    pub sensor_dropout: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_speed_mm_s: default_sim_max_speed(),
            sensor_noise_mv: 0.0,
            sensor_dropout: 0.0,
        }
    }
}

impl Config {
    /// Validate ranges that the control loop relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.actuator;
        let c = &self.control;
        let s = &self.simulation;
        let reals = [
            ("min_travel_mm", a.min_travel_mm),
            ("max_travel_mm", a.max_travel_mm),
            ("soft_margin_mm", a.soft_margin_mm),
            ("home_mm", a.home_mm.unwrap_or(0.0)),
            ("position_deadband_mm", c.position_deadband_mm),
            ("output_deadband", c.output_deadband),
            ("kp", c.kp),
            ("ki", c.ki),
            ("kd", c.kd),
            ("integral_limit", c.integral_limit),
            ("ramp_rate", c.ramp_rate),
            ("default_feedrate", c.default_feedrate),
            ("max_speed_mm_s", s.max_speed_mm_s),
            ("sensor_noise_mv", s.sensor_noise_mv),
            ("sensor_dropout", s.sensor_dropout),
        ];
        if let Some((name, value)) = reals.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!("{} must be finite, got {}", name, value)));
        }
        if a.min_travel_mm >= a.max_travel_mm {
            return Err(ConfigError::Invalid(format!(
                "min_travel_mm ({}) must be below max_travel_mm ({})",
                a.min_travel_mm, a.max_travel_mm
            )));
        }
        if a.soft_margin_mm < 0.0 || 2.0 * a.soft_margin_mm >= a.max_travel_mm - a.min_travel_mm {
            return Err(ConfigError::Invalid(format!(
                "soft_margin_mm ({}) leaves no usable travel",
                a.soft_margin_mm
            )));
        }
        if a.default_speed_limit > a.rated_output {
            return Err(ConfigError::Invalid(format!(
                "default_speed_limit ({}) exceeds rated_output ({})",
                a.default_speed_limit, a.rated_output
            )));
        }
        if c.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be > 0".to_string()));
        }
        if c.position_deadband_mm < 0.0 || c.output_deadband < 0.0 {
            return Err(ConfigError::Invalid("deadbands must be >= 0".to_string()));
        }
        if c.kp < 0.0 || c.ki < 0.0 || c.kd < 0.0 || c.integral_limit < 0.0 {
            return Err(ConfigError::Invalid("PID gains and integral_limit must be >= 0".to_string()));
        }
        if c.ramp_rate < 0.0 {
            return Err(ConfigError::Invalid("ramp_rate must be >= 0".to_string()));
        }
        if !(0.0..=1.0).contains(&s.sensor_dropout) {
            return Err(ConfigError::Invalid("sensor_dropout must be between 0 and 1".to_string()));
        }
        Ok(())
    }

    /// Resolve the calibration table. Without a file or inline table, a
    /// linear 0..5000 mV span over the travel range is assumed.
    pub fn calibration(&self) -> Result<Calibration, ConfigError> {
        let cal = &self.calibration;
        if let Some(file) = &cal.file {
            let path = match &self.base_dir {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            tracing::info!("Loading calibration from: {}", path.display());
            return Ok(Calibration::load(&path)?);
        }
        if !cal.analogs_mv.is_empty() || !cal.positions_mm.is_empty() {
            return Ok(Calibration::new(cal.analogs_mv.clone(), cal.positions_mm.clone())?);
        }
        Ok(Calibration::linear(
            0.0,
            5000.0,
            self.actuator.min_travel_mm,
            self.actuator.max_travel_mm,
        )?)
    }
}

// Default value functions
fn default_min_travel() -> f64 { 0.0 }
fn default_max_travel() -> f64 { 146.0 }
fn default_rated_output() -> u16 { 1000 }
fn default_speed_limit() -> u16 { 500 }
fn default_tick_ms() -> u64 { 10 }
fn default_position_deadband() -> f64 { 0.5 }
fn default_output_deadband() -> f64 { 10.0 }
fn default_kp() -> f64 { 20.0 }
fn default_kd() -> f64 { 0.5 }
fn default_integral_limit() -> f64 { 500.0 }
fn default_ramp_rate() -> f64 { 1000.0 }
fn default_sensor_fault_threshold() -> u32 { 5 }
fn default_feedrate() -> f64 { 100.0 }
fn default_baud() -> u32 { 9600 }
fn default_log_level() -> String { "info".to_string() }
fn default_sim_max_speed() -> f64 { 40.0 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(mut config) => {
                config.base_dir = path.parent().map(Path::to_path_buf);
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            Err(ConfigError::Io(e))
        }
    }
}
