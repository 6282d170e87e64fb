// src/actuator.rs - Wires calibration, plant, coordinator, controller and interpreter together
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::command::{CommandInterpreter, LineBuffer, HELP};
use crate::config::{Config, ConfigError, Protocol};
use crate::control::{ControlError, Coordinator, SafetyClamp};
use crate::hardware::serial::CommandLink;
use crate::hardware::simulated::SimulatedPlant;
use crate::hardware::PositionSource;
use crate::motion::{ActuatorStatus, ControllerEvent, LoopSettings, MotionController, PositionPid};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Control error: {0}")]
    Control(#[from] ControlError),
    #[error("Command link error: {0}")]
    Link(#[from] std::io::Error),
    #[error("Control task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct ActuatorSystem {
    coordinator: Coordinator,
    controller: MotionController,
    interpreter: CommandInterpreter,
    plant: SimulatedPlant,
    shutdown_tx: broadcast::Sender<()>,
}

impl ActuatorSystem {
    /// Build the system on the simulated plant. The initial setpoint is
    /// `home_mm` when configured, else the first sensor reading, else the
    /// retracted end of travel.
    pub fn new(config: Config) -> Result<Self, SystemError> {
        config.validate()?;
        let calibration = config.calibration()?;
        let actuator = &config.actuator;
        let clamp = SafetyClamp::new(
            actuator.min_travel_mm,
            actuator.max_travel_mm,
            actuator.soft_margin_mm,
            actuator.rated_output,
        );

        let plant = SimulatedPlant::new(
            calibration.clone(),
            config.simulation.clone(),
            actuator.rated_output,
            config.control.tick_period(),
            actuator.home_mm.unwrap_or(actuator.min_travel_mm),
        );
        let mut source = plant.clone();
        let home = match actuator.home_mm {
            Some(home) => home,
            None => match source.read_raw() {
                Ok(raw) => calibration.raw_to_position(raw),
                Err(e) => {
                    tracing::warn!("No initial position reading ({}), homing to {} mm", e, clamp.min_travel());
                    clamp.min_travel()
                }
            },
        };

        let coordinator = Coordinator::new(
            clamp,
            home,
            f64::from(actuator.default_speed_limit),
            config.control.default_feedrate,
            config.control.ramp_rate,
        );
        let c = &config.control;
        let controller = MotionController::new(
            coordinator.clone(),
            Box::new(source),
            Box::new(plant.clone()),
            calibration,
            PositionPid::new(c.kp, c.ki, c.kd, c.integral_limit),
            LoopSettings::from_config(c, config.logging.verbose),
        )?;
        let interpreter = CommandInterpreter::new(coordinator.clone(), controller.status(), config.interface.protocol);
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            "Actuator '{}' ready: travel {:.1}-{:.1} mm, home {:.2} mm",
            actuator.name.as_deref().unwrap_or("unnamed"),
            coordinator.clamp().min_travel(),
            coordinator.clamp().max_travel(),
            coordinator.snapshot()?.target
        );

        Ok(Self { coordinator, controller, interpreter, plant, shutdown_tx })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn plant(&self) -> &SimulatedPlant {
        &self.plant
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.controller.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ActuatorStatus> {
        self.controller.status()
    }

    /// Sender that stops the control loop when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve commands from `link` while the control loop runs. Returns on
    /// `quit`, end of input or Ctrl-C (after stopping the actuator), or as
    /// soon as the control loop dies.
    pub async fn run<L: CommandLink>(self, mut link: L) -> Result<(), SystemError> {
        let Self { controller, interpreter, shutdown_tx, .. } = self;
        tracing::info!("Serving commands on {}", link.describe());

        let telemetry = tokio::spawn(log_events(controller.subscribe()));
        let mut control = tokio::spawn(controller.run(shutdown_tx.subscribe()));

        enum Ended {
            Session(Result<(), SystemError>),
            Control(Result<Result<(), ControlError>, tokio::task::JoinError>),
        }

        let ended = tokio::select! {
            served = serve_link(&mut link, &interpreter) => Ended::Session(served),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopped by user (Ctrl-C)");
                Ended::Session(Ok(()))
            }
            joined = &mut control => Ended::Control(joined),
        };

        let result = match ended {
            Ended::Session(served) => {
                let _ = shutdown_tx.send(());
                let joined = control.await;
                served.and(joined?.map_err(SystemError::from))
            }
            Ended::Control(joined) => {
                tracing::error!("Control loop exited; closing command session");
                joined?.map_err(SystemError::from)
            }
        };

        let _ = telemetry.await;
        tracing::info!("Shut down, actuator stopped");
        result
    }
}

/// Read lines from `link`, answer each one, stop on `quit` or end of input.
pub async fn serve_link<L: CommandLink + ?Sized>(
    link: &mut L,
    interpreter: &CommandInterpreter,
) -> Result<(), SystemError> {
    let banner = match interpreter.protocol() {
        Protocol::Gcode => "Ready for G-code".to_string(),
        _ => format!("Ready. {}", HELP),
    };
    link.write_line(&banner).await?;

    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = link.read_chunk(&mut chunk).await?;
        let lines = if n == 0 {
            buffer.finish().into_iter().collect()
        } else {
            buffer.push(&chunk[..n])
        };
        for line in lines {
            let reply = interpreter.handle_line(&line)?;
            link.write_line(&reply.text).await?;
            if reply.quit {
                return Ok(());
            }
        }
        if n == 0 {
            tracing::info!("Command link closed");
            return Ok(());
        }
    }
}

/// Telemetry consumer: one structured log record per controller event.
async fn log_events(mut events: broadcast::Receiver<ControllerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!(target: "telemetry", "{}", json),
                Err(e) => tracing::warn!("Unserializable controller event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Telemetry consumer lagged, {} events dropped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
