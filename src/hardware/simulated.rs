//! Simulated screw actuator with potentiometer feedback.
//!
//! One [`SimulatedPlant`] is shared (by cloning) between the control loop's
//! position source and its driver. Each drive command is held for one
//! control period, so the plant advances by `velocity * dt` per call.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ActuatorDriver, Direction, HardwareError, PositionSource};
use crate::calibration::{Calibration, RawReading};
use crate::config::SimulationConfig;

#[derive(Debug)]
struct PlantState {
    position_mm: f64,
    direction: Direction,
    magnitude: u16,
    failing_reads: u32,
    drive_fault: bool,
}

#[derive(Debug, Clone)]
pub struct SimulatedPlant {
    state: Arc<Mutex<PlantState>>,
    calibration: Arc<Calibration>,
    params: SimulationConfig,
    rated_output: u16,
    dt: f64,
    stroke: (f64, f64),
}

impl SimulatedPlant {
    pub fn new(
        calibration: Calibration,
        params: SimulationConfig,
        rated_output: u16,
        period: Duration,
        initial_position_mm: f64,
    ) -> Self {
        let stroke = calibration.position_range();
        Self {
            state: Arc::new(Mutex::new(PlantState {
                position_mm: initial_position_mm.clamp(stroke.0, stroke.1),
                direction: Direction::Stop,
                magnitude: 0,
                failing_reads: 0,
                drive_fault: false,
            })),
            calibration: Arc::new(calibration),
            params,
            rated_output: rated_output.max(1),
            dt: period.as_secs_f64(),
            stroke,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlantState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True (noise-free) rod position.
    pub fn position(&self) -> f64 {
        self.lock().position_mm
    }

    pub fn set_position(&self, position_mm: f64) {
        self.lock().position_mm = position_mm.clamp(self.stroke.0, self.stroke.1);
    }

    /// Most recent drive command.
    pub fn last_command(&self) -> (Direction, u16) {
        let state = self.lock();
        (state.direction, state.magnitude)
    }

    /// Make the next `count` sensor reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    pub fn set_drive_fault(&self, faulted: bool) {
        self.lock().drive_fault = faulted;
    }
}

impl PositionSource for SimulatedPlant {
    fn read_raw(&mut self) -> Result<RawReading, HardwareError> {
        let position = {
            let mut state = self.lock();
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(HardwareError::SensorUnavailable("injected read failure".to_string()));
            }
            state.position_mm
        };
        if self.params.sensor_dropout > 0.0 && rand::random::<f64>() < self.params.sensor_dropout {
            return Err(HardwareError::SensorUnavailable("ADC dropout".to_string()));
        }
        let RawReading(mut raw) = self.calibration.position_to_raw(position);
        if self.params.sensor_noise_mv > 0.0 {
            raw += self.params.sensor_noise_mv * (rand::random::<f64>() - 0.5);
        }
        Ok(RawReading(raw))
    }
}

impl ActuatorDriver for SimulatedPlant {
    fn drive(&mut self, direction: Direction, magnitude: u16) -> Result<(), HardwareError> {
        let mut state = self.lock();
        if state.drive_fault {
            state.direction = Direction::Stop;
            state.magnitude = 0;
            return Err(HardwareError::Drive("H-bridge fault".to_string()));
        }
        let magnitude = magnitude.min(self.rated_output);
        state.direction = direction;
        state.magnitude = magnitude;

        let speed = self.params.max_speed_mm_s * f64::from(magnitude) / f64::from(self.rated_output);
        let velocity = match direction {
            Direction::Extend => speed,
            Direction::Retract => -speed,
            Direction::Stop => 0.0,
        };
        // Mechanical end stops.
        state.position_mm = (state.position_mm + velocity * self.dt).clamp(self.stroke.0, self.stroke.1);
        tracing::trace!("sim plant: {:?} {} -> {:.3} mm", direction, magnitude, state.position_mm);
        Ok(())
    }
}
