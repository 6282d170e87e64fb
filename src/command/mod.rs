// src/command/mod.rs - Command interpreter: text in, coordinator calls and replies out
pub mod line_buffer;
pub mod parser;

pub use line_buffer::LineBuffer;
pub use parser::{parse_line, Command, CommandError, MoveKind, HELP};

use tokio::sync::watch;

use crate::config::Protocol;
use crate::control::{ControlError, Coordinator, MoveOutcome, PositioningMode};
use crate::motion::ActuatorStatus;

/// Text to send back to the operator, and whether the session should end.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub quit: bool,
}

impl Reply {
    fn say(text: impl Into<String>) -> Self {
        Self { text: text.into(), quit: false }
    }
}

/// Applies parsed commands through the [`Coordinator`]. Never drives hardware;
/// position queries read the controller's latest published status.
#[derive(Clone)]
pub struct CommandInterpreter {
    coordinator: Coordinator,
    status: watch::Receiver<ActuatorStatus>,
    protocol: Protocol,
}

impl CommandInterpreter {
    pub fn new(coordinator: Coordinator, status: watch::Receiver<ActuatorStatus>, protocol: Protocol) -> Self {
        Self { coordinator, status, protocol }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Handle one line. Malformed input becomes a diagnostic reply; only a
    /// broken control-state lock is returned as an error.
    pub fn handle_line(&self, line: &str) -> Result<Reply, ControlError> {
        tracing::debug!("Processing command: {}", line);
        match parse_line(line, self.protocol) {
            Ok(command) => self.execute(command),
            Err(e) => {
                tracing::warn!("Rejected command '{}': {}", line, e);
                Ok(Reply::say(self.diagnostic(&e)))
            }
        }
    }

    fn diagnostic(&self, error: &CommandError) -> String {
        match (error, self.protocol) {
            (CommandError::Unknown(line), Protocol::Gcode) => format!("Unknown or unsupported G-code: {}", line),
            (CommandError::Usage(usage), _) => format!("[cmd] Usage: {}", usage),
            (e, _) => format!("[cmd] {}. Type 'help' for commands", e),
        }
    }

    pub fn execute(&self, command: Command) -> Result<Reply, ControlError> {
        let reply = match command {
            Command::Move { kind, x, feedrate } => {
                let outcome = self.coordinator.request_positioning_move(x, feedrate)?;
                let text = match kind {
                    MoveKind::Rapid => format!("Rapid move to: {:.2}", outcome.target.value),
                    MoveKind::Linear => format!(
                        "Linear move to: {:.2} at feedrate: {}",
                        outcome.target.value, outcome.feedrate
                    ),
                };
                Reply::say(annotate_move(text, &outcome))
            }
            Command::MoveTo(position) => {
                let outcome = self.coordinator.request_move(position, PositioningMode::Absolute)?;
                Reply::say(annotate_move(format!("[move] Target: {:.1} mm", outcome.target.value), &outcome))
            }
            Command::SetMode(mode) => {
                self.coordinator.set_mode(mode)?;
                Reply::say(match mode {
                    PositioningMode::Absolute => "Switched to absolute positioning (G90)",
                    PositioningMode::Relative => "Switched to relative (incremental) positioning (G91)",
                })
            }
            Command::SpeedLimit(value) => {
                let outcome = self.coordinator.set_speed_limit(value)?;
                let limit = outcome.limit.value;
                let mut text = if outcome.deferred {
                    format!("[speed] Limit {:.0} applies on the next move (motion cancelled)", limit)
                } else if outcome.ramping {
                    format!("[speed] Limit ramping down to {:.0}", limit)
                } else {
                    format!("[speed] Limit set to {:.0}", limit)
                };
                if outcome.limit.was_clamped() {
                    tracing::warn!("Speed limit {} clamped to {}", outcome.limit.requested, limit);
                    text.push_str(&format!(" (clamped from {})", outcome.limit.requested));
                }
                Reply::say(text)
            }
            Command::Cancel => {
                let outcome = self.coordinator.cancel()?;
                if outcome.already_cancelled {
                    Reply::say("[move] Already cancelled")
                } else {
                    match self.status.borrow().position {
                        Some(p) => Reply::say(format!("[move] Cancelled at {:.2} mm", p)),
                        None => Reply::say("[move] Cancelled"),
                    }
                }
            }
            Command::QueryPosition => {
                let status = *self.status.borrow();
                match (status.position, status.sensor_ok) {
                    (Some(p), true) => Reply::say(format!("[pos] {:.2} mm", p)),
                    (Some(p), false) => Reply::say(format!("[pos] {:.2} mm (stale, sensor unavailable)", p)),
                    (None, _) => Reply::say("[pos] unavailable (no sensor reading yet)"),
                }
            }
            Command::Status => {
                let snapshot = self.coordinator.snapshot()?;
                let status = *self.status.borrow();
                let position = status
                    .position
                    .map(|p| format!("{:.2} mm", p))
                    .unwrap_or_else(|| "unknown".to_string());
                Reply::say(format!(
                    "[status] pos {} | target {:.2} mm | {} | limit {}{} | {:?} | F{}",
                    position,
                    snapshot.target,
                    status.state,
                    snapshot.speed_limit,
                    if snapshot.cancelled { " (cancelled)" } else { "" },
                    snapshot.mode,
                    snapshot.feedrate
                ))
            }
            Command::Help => Reply::say(HELP),
            Command::Quit => Reply { text: "[system] Shutting down".to_string(), quit: true },
        };
        tracing::info!("{}", reply.text);
        Ok(reply)
    }
}

fn annotate_move(mut text: String, outcome: &MoveOutcome) -> String {
    if outcome.target.was_clamped() {
        tracing::warn!(
            "Target {} outside travel, clamped to {}",
            outcome.target.requested, outcome.target.value
        );
        text.push_str(&format!(" (clamped from {:.2})", outcome.target.requested));
    }
    if let Some(limit) = outcome.resumed {
        text.push_str(&format!(" (resumed, limit {})", limit));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{SafetyClamp, SpeedLimit};
    use crate::motion::RunState;

    fn status(position: Option<f64>) -> ActuatorStatus {
        ActuatorStatus {
            position,
            raw: None,
            sensor_ok: position.is_some(),
            target: 0.0,
            speed_limit: SpeedLimit::symmetric(500.0),
            state: RunState::Stopped,
            output: 0.0,
            tick: 1,
        }
    }

    fn interpreter(protocol: Protocol) -> (CommandInterpreter, Coordinator, watch::Sender<ActuatorStatus>) {
        let coordinator = Coordinator::new(SafetyClamp::new(0.0, 146.0, 0.0, 1000), 0.0, 500.0, 100.0, 0.0);
        let (tx, rx) = watch::channel(status(Some(67.0)));
        (CommandInterpreter::new(coordinator.clone(), rx, protocol), coordinator, tx)
    }

    #[test]
    fn test_gcode_scenario() {
        let (interp, coordinator, _tx) = interpreter(Protocol::Both);
        interp.handle_line("G0 X50").unwrap();
        assert_eq!(coordinator.snapshot().unwrap().target, 50.0);
        interp.handle_line("G91").unwrap();
        let reply = interp.handle_line("G1 X-10").unwrap();
        assert_eq!(reply.text, "Linear move to: 40.00 at feedrate: 100");
        assert_eq!(coordinator.snapshot().unwrap().target, 40.0);
    }

    #[test]
    fn test_clamp_is_reported() {
        let (interp, coordinator, _tx) = interpreter(Protocol::Both);
        let reply = interp.handle_line("500").unwrap();
        assert_eq!(reply.text, "[move] Target: 146.0 mm (clamped from 500.00)");
        assert_eq!(coordinator.snapshot().unwrap().target, 146.0);
    }

    #[test]
    fn test_cancel_and_resume() {
        let (interp, coordinator, _tx) = interpreter(Protocol::Both);
        interp.handle_line("100").unwrap();
        let reply = interp.handle_line("cancel").unwrap();
        assert_eq!(reply.text, "[move] Cancelled at 67.00 mm");
        assert!(coordinator.snapshot().unwrap().speed_limit.is_zero());
        assert_eq!(interp.handle_line("cancel").unwrap().text, "[move] Already cancelled");
        let reply = interp.handle_line("50").unwrap();
        assert_eq!(reply.text, "[move] Target: 50.0 mm (resumed, limit (-500, 500))");
    }

    #[test]
    fn test_speed_replies() {
        let (interp, _coordinator, _tx) = interpreter(Protocol::Both);
        assert_eq!(interp.handle_line("speed 200").unwrap().text, "[speed] Limit set to 200");
        assert_eq!(
            interp.handle_line("speed 4000").unwrap().text,
            "[speed] Limit set to 1000 (clamped from 4000)"
        );
        interp.handle_line("cancel").unwrap();
        assert_eq!(
            interp.handle_line("speed 300").unwrap().text,
            "[speed] Limit 300 applies on the next move (motion cancelled)"
        );
    }

    #[test]
    fn test_pos_reports_status() {
        let (interp, _coordinator, tx) = interpreter(Protocol::Both);
        assert_eq!(interp.handle_line("pos").unwrap().text, "[pos] 67.00 mm");
        tx.send_replace(status(None));
        assert_eq!(interp.handle_line("pos").unwrap().text, "[pos] unavailable (no sensor reading yet)");
    }

    #[test]
    fn test_rejections_leave_state_unchanged() {
        let (interp, coordinator, _tx) = interpreter(Protocol::Gcode);
        let before = coordinator.snapshot().unwrap();
        let reply = interp.handle_line("G28").unwrap();
        assert_eq!(reply.text, "Unknown or unsupported G-code: G28");
        assert!(!reply.quit);
        assert_eq!(coordinator.snapshot().unwrap(), before);
    }

    #[test]
    fn test_quit() {
        let (interp, _coordinator, _tx) = interpreter(Protocol::Terminal);
        assert!(interp.handle_line("QUIT").unwrap().quit);
    }
}
