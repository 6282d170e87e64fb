// src/motion/controller.rs - Fixed-cadence closed-loop position controller
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::calibration::{Calibration, RawReading};
use crate::config::ControlConfig;
use crate::control::{ControlError, ControlSnapshot, Coordinator, SpeedLimit};
use crate::hardware::{ActuatorDriver, Direction, HardwareError, PositionSource};
use crate::motion::pid::PositionPid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Stopped,
    Extending,
    Retracting,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Stopped => "stopped",
            RunState::Extending => "extending",
            RunState::Retracting => "retracting",
        };
        f.write_str(name)
    }
}

/// One tick's drive decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrivePlan {
    pub direction: Direction,
    pub magnitude: u16,
    /// Signed output after deadband and limit.
    pub output: f64,
    pub state: RunState,
}

impl DrivePlan {
    pub const STOP: DrivePlan = DrivePlan {
        direction: Direction::Stop,
        magnitude: 0,
        output: 0.0,
        state: RunState::Stopped,
    };
}

/// Turn a position error and a raw controller output into a drive command.
///
/// Inside the positional deadband the plan is always `STOP`. Otherwise small
/// outputs are zeroed to prevent chatter and the rest is clamped to `limit`.
/// The run state follows the final output, so a zero limit yields `Stopped`
/// however large the error.
pub fn plan_drive(
    error: f64,
    position_deadband: f64,
    pid_output: f64,
    output_deadband: f64,
    limit: SpeedLimit,
) -> DrivePlan {
    if error.abs() <= position_deadband || !pid_output.is_finite() {
        return DrivePlan::STOP;
    }
    let mut output = pid_output;
    if output.abs() < output_deadband {
        output = 0.0;
    }
    let output = limit.apply(output);
    // `as` saturates, and the limit already bounds the value.
    let magnitude = output.abs() as u16;
    if magnitude == 0 {
        return DrivePlan::STOP;
    }
    if output > 0.0 {
        DrivePlan { direction: Direction::Extend, magnitude, output, state: RunState::Extending }
    } else {
        DrivePlan { direction: Direction::Retract, magnitude, output, state: RunState::Retracting }
    }
}

/// Emitted whenever the run state changes.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub timestamp: DateTime<Utc>,
    pub position: f64,
    pub state: RunState,
    /// Present in verbose configurations.
    pub raw: Option<f64>,
    pub output: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub enum ControllerEvent {
    Transition(TransitionEvent),
    SensorDegraded { consecutive_failures: u32, error: String },
    SensorRecovered { after_failures: u32 },
    DriveFault { message: String },
    DriveRecovered,
}

/// Latest loop observation, published every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorStatus {
    /// Last good calibrated position, if any read has succeeded.
    pub position: Option<f64>,
    pub raw: Option<RawReading>,
    pub sensor_ok: bool,
    pub target: f64,
    pub speed_limit: SpeedLimit,
    pub state: RunState,
    pub output: f64,
    pub tick: u64,
}

/// Loop parameters lifted out of [`ControlConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub period: Duration,
    pub position_deadband: f64,
    pub output_deadband: f64,
    pub sensor_fault_threshold: u32,
    pub verbose: bool,
}

impl LoopSettings {
    pub fn from_config(config: &ControlConfig, verbose: bool) -> Self {
        Self {
            period: config.tick_period(),
            position_deadband: config.position_deadband_mm,
            output_deadband: config.output_deadband,
            sensor_fault_threshold: config.sensor_fault_threshold.max(1),
            verbose,
        }
    }
}

pub struct MotionController {
    coordinator: Coordinator,
    source: Box<dyn PositionSource>,
    driver: Box<dyn ActuatorDriver>,
    calibration: Calibration,
    pid: PositionPid,
    settings: LoopSettings,
    last_state: RunState,
    last_position: Option<f64>,
    last_revision: Option<u64>,
    sensor_failures: u32,
    drive_faulted: bool,
    ticks: u64,
    events: broadcast::Sender<ControllerEvent>,
    status: watch::Sender<ActuatorStatus>,
}

impl MotionController {
    pub fn new(
        coordinator: Coordinator,
        source: Box<dyn PositionSource>,
        driver: Box<dyn ActuatorDriver>,
        calibration: Calibration,
        pid: PositionPid,
        settings: LoopSettings,
    ) -> Result<Self, ControlError> {
        let snapshot = coordinator.snapshot()?;
        let (events, _) = broadcast::channel(64);
        let (status, _) = watch::channel(ActuatorStatus {
            position: None,
            raw: None,
            sensor_ok: false,
            target: snapshot.target,
            speed_limit: snapshot.speed_limit,
            state: RunState::Stopped,
            output: 0.0,
            tick: 0,
        });
        Ok(Self {
            coordinator,
            source,
            driver,
            calibration,
            pid,
            settings,
            last_state: RunState::Stopped,
            last_position: None,
            last_revision: None,
            sensor_failures: 0,
            drive_faulted: false,
            ticks: 0,
            events,
            status,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ActuatorStatus> {
        self.status.subscribe()
    }

    /// Run one control period. Only a broken state lock is an error; sensor
    /// and drive faults are handled here and reported as events.
    pub fn tick(&mut self) -> Result<ActuatorStatus, ControlError> {
        self.ticks += 1;
        let reading = self.source.read_raw().and_then(|raw| {
            if raw.0.is_finite() {
                Ok(raw)
            } else {
                Err(HardwareError::SensorUnavailable(format!("non-finite reading {}", raw.0)))
            }
        });
        let snapshot = self.coordinator.tick_snapshot(self.settings.period)?;
        self.log_revision(&snapshot);

        let (plan, raw) = match reading {
            Ok(raw) => {
                self.sensor_ok();
                let position = self.calibration.raw_to_position(raw);
                self.last_position = Some(position);
                (self.plan(&snapshot, position, raw), Some(raw))
            }
            Err(e) => {
                self.sensor_failed(e);
                // Never act on stale feedback.
                self.pid.reset();
                (DrivePlan::STOP, None)
            }
        };

        self.apply(plan);

        let position = self.last_position.unwrap_or(snapshot.target);
        if plan.state != self.last_state {
            self.notify_transition(position, plan, raw);
            self.last_state = plan.state;
        }

        let status = ActuatorStatus {
            position: self.last_position,
            raw,
            sensor_ok: raw.is_some(),
            target: snapshot.target,
            speed_limit: snapshot.speed_limit,
            state: plan.state,
            output: plan.output,
            tick: self.ticks,
        };
        self.status.send_replace(status);
        Ok(status)
    }

    fn plan(&mut self, snapshot: &ControlSnapshot, position: f64, raw: RawReading) -> DrivePlan {
        let error = snapshot.target - position;
        let inside = error.abs() <= self.settings.position_deadband;
        let pid_output = if inside || snapshot.speed_limit.is_zero() {
            self.pid.reset();
            0.0
        } else {
            self.pid.update(snapshot.target, position, self.settings.period.as_secs_f64())
        };
        let plan = plan_drive(
            error,
            self.settings.position_deadband,
            pid_output,
            self.settings.output_deadband,
            snapshot.speed_limit,
        );
        if plan.magnitude > 0 {
            tracing::debug!(
                "Pos:{:6.2}mm | Target:{:6.1}mm | Error:{:+6.1}mm | PID:{:+6.1} | PWM:{:3} | Dir:{:?} | Raw:{:.0}",
                position, snapshot.target, error, pid_output, plan.magnitude, plan.direction, raw.0
            );
        }
        plan
    }

    fn apply(&mut self, plan: DrivePlan) {
        match self.driver.drive(plan.direction, plan.magnitude) {
            Ok(()) => {
                if self.drive_faulted {
                    self.drive_faulted = false;
                    tracing::info!("Actuator driver recovered");
                    let _ = self.events.send(ControllerEvent::DriveRecovered);
                }
            }
            Err(e) => {
                if !self.drive_faulted {
                    self.drive_faulted = true;
                    tracing::error!("Actuator drive failed: {}", e);
                    let _ = self.events.send(ControllerEvent::DriveFault { message: e.to_string() });
                }
            }
        }
    }

    fn sensor_ok(&mut self) {
        if self.sensor_failures >= self.settings.sensor_fault_threshold {
            tracing::info!("Position sensor recovered after {} failed reads", self.sensor_failures);
            let _ = self.events.send(ControllerEvent::SensorRecovered { after_failures: self.sensor_failures });
        }
        self.sensor_failures = 0;
    }

    fn sensor_failed(&mut self, error: HardwareError) {
        self.sensor_failures = self.sensor_failures.saturating_add(1);
        if self.sensor_failures == self.settings.sensor_fault_threshold {
            tracing::warn!(
                "Position sensor degraded: {} consecutive failed reads ({})",
                self.sensor_failures, error
            );
            let _ = self.events.send(ControllerEvent::SensorDegraded {
                consecutive_failures: self.sensor_failures,
                error: error.to_string(),
            });
        } else {
            tracing::debug!("Sensor read failed ({}), output held at zero", error);
        }
    }

    fn notify_transition(&self, position: f64, plan: DrivePlan, raw: Option<RawReading>) {
        match plan.state {
            RunState::Extending => tracing::info!("Extending, current position: {:.2} mm", position),
            RunState::Retracting => tracing::info!("Retracting, current position: {:.2} mm", position),
            RunState::Stopped => tracing::info!("Stopped, current position: {:.2} mm", position),
        }
        let verbose = self.settings.verbose;
        let _ = self.events.send(ControllerEvent::Transition(TransitionEvent {
            timestamp: Utc::now(),
            position,
            state: plan.state,
            raw: raw.filter(|_| verbose).map(|r| r.0),
            output: verbose.then_some(plan.output),
        }));
    }

    fn log_revision(&mut self, snapshot: &ControlSnapshot) {
        if self.last_revision != Some(snapshot.revision) {
            tracing::debug!(
                "Control state r{}: target {:.2} mm, limit {}, {:?}{}",
                snapshot.revision,
                snapshot.target,
                snapshot.speed_limit,
                snapshot.mode,
                if snapshot.cancelled { ", cancelled" } else { "" }
            );
            self.last_revision = Some(snapshot.revision);
        }
    }

    /// Command zero output.
    pub fn halt(&mut self) {
        if let Err(e) = self.driver.stop() {
            tracing::error!("Failed to stop actuator: {}", e);
        }
    }

    /// Tick at the configured cadence until shutdown. The actuator is
    /// stopped on every exit path.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ControlError> {
        let mut interval = tokio::time::interval(self.settings.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("Control loop running every {:?}", self.settings.period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Control loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        tracing::error!("Control loop aborted: {}", e);
                        self.halt();
                        return Err(e);
                    }
                }
            }
        }
        self.halt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::control::{PositioningMode, SafetyClamp};
    use crate::hardware::simulated::SimulatedPlant;

    struct NanSource;

    impl PositionSource for NanSource {
        fn read_raw(&mut self) -> Result<RawReading, HardwareError> {
            Ok(RawReading(f64::NAN))
        }
    }

    fn controller(nan_source: bool) -> (MotionController, Coordinator, SimulatedPlant) {
        let calibration = Calibration::linear(0.0, 5000.0, 0.0, 146.0).unwrap();
        let config = ControlConfig { sensor_fault_threshold: 3, ..ControlConfig::default() };
        let plant = SimulatedPlant::new(
            calibration.clone(),
            SimulationConfig::default(),
            1000,
            config.tick_period(),
            20.0,
        );
        let source: Box<dyn PositionSource> = if nan_source { Box::new(NanSource) } else { Box::new(plant.clone()) };
        let coordinator = Coordinator::new(SafetyClamp::new(0.0, 146.0, 0.0, 1000), 20.0, 500.0, 100.0, 1000.0);
        let controller = MotionController::new(
            coordinator.clone(),
            source,
            Box::new(plant.clone()),
            calibration,
            PositionPid::new(config.kp, config.ki, config.kd, config.integral_limit),
            LoopSettings::from_config(&config, false),
        )
        .unwrap();
        (controller, coordinator, plant)
    }

    #[test]
    fn test_non_finite_reading_stops_drive() {
        let (mut controller, coordinator, mut plant) = controller(true);
        let mut events = controller.subscribe();
        coordinator.request_move(100.0, PositioningMode::Absolute).unwrap();
        plant.drive(Direction::Extend, 500).unwrap();

        for _ in 0..3 {
            let status = tokio_test::assert_ok!(controller.tick());
            assert!(!status.sensor_ok);
            assert_eq!(status.state, RunState::Stopped);
            assert_eq!(plant.last_command(), (Direction::Stop, 0));
        }
        assert!(matches!(
            events.try_recv(),
            Ok(ControllerEvent::SensorDegraded { consecutive_failures: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_poisoned_state_ends_run_with_drive_halted() {
        let (mut controller, coordinator, plant) = controller(false);
        coordinator.request_move(100.0, PositioningMode::Absolute).unwrap();
        controller.tick().unwrap();
        assert_eq!(plant.last_command(), (Direction::Extend, 500));

        coordinator.poison();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let result = tokio::time::timeout(Duration::from_secs(2), controller.run(shutdown_rx))
            .await
            .unwrap();
        assert_eq!(result, Err(ControlError::StatePoisoned));
        assert_eq!(plant.last_command(), (Direction::Stop, 0));
    }

    #[test]
    fn test_inside_deadband_is_stopped() {
        let limit = SpeedLimit::symmetric(500.0);
        for error in [0.0, 0.3, -0.5, 0.5] {
            assert_eq!(plan_drive(error, 0.5, 999.0, 10.0, limit), DrivePlan::STOP);
        }
    }

    #[test]
    fn test_output_deadband_suppresses_chatter() {
        let plan = plan_drive(2.0, 0.5, 9.9, 10.0, SpeedLimit::symmetric(500.0));
        assert_eq!(plan, DrivePlan::STOP);
    }

    #[test]
    fn test_output_clamped_to_limit() {
        let plan = plan_drive(33.0, 0.5, 660.0, 10.0, SpeedLimit::symmetric(500.0));
        assert_eq!(plan.direction, Direction::Extend);
        assert_eq!(plan.magnitude, 500);
        assert_eq!(plan.state, RunState::Extending);

        let plan = plan_drive(-17.0, 0.5, -340.0, 10.0, SpeedLimit::symmetric(200.0));
        assert_eq!(plan.direction, Direction::Retract);
        assert_eq!(plan.magnitude, 200);
        assert_eq!(plan.output, -200.0);
        assert_eq!(plan.state, RunState::Retracting);
    }

    #[test]
    fn test_zero_limit_stops_despite_error() {
        let plan = plan_drive(33.0, 0.5, 660.0, 10.0, SpeedLimit::ZERO);
        assert_eq!(plan, DrivePlan::STOP);
    }
}
