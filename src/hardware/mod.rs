// src/hardware/mod.rs - Position sensing and actuator drive interfaces
pub mod serial;
pub mod simulated;

use thiserror::Error;

use crate::calibration::RawReading;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),
    #[error("Drive error: {0}")]
    Drive(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Motor drive direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Extend,
    Retract,
    Stop,
}

/// Source of raw position feedback. Called once per control tick, so
/// implementations must return promptly and never wait on I/O.
pub trait PositionSource: Send {
    fn read_raw(&mut self) -> Result<RawReading, HardwareError>;
}

/// H-bridge style output stage: a direction line plus a duty value in
/// `0..=rated_output`.
pub trait ActuatorDriver: Send {
    fn drive(&mut self, direction: Direction, magnitude: u16) -> Result<(), HardwareError>;

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.drive(Direction::Stop, 0)
    }
}
