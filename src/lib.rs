// src/lib.rs - Linear actuator positioning host
pub mod actuator;
pub mod calibration;
pub mod command;
pub mod config;
pub mod control;
pub mod hardware;
pub mod motion;

pub use actuator::{ActuatorSystem, SystemError};
pub use config::{load_config, Config, Protocol};
