// src/control/state.rs - Shared setpoint / speed-limit record
use serde::Serialize;

/// How position words are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositioningMode {
    Absolute,
    Relative,
}

/// Symmetric bound on control output. `(0, 0)` is the cancelled/locked bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedLimit {
    pub low: f64,
    pub high: f64,
}

impl SpeedLimit {
    pub const ZERO: SpeedLimit = SpeedLimit { low: 0.0, high: 0.0 };

    pub fn symmetric(magnitude: f64) -> Self {
        let magnitude = magnitude.abs();
        if magnitude == 0.0 {
            return Self::ZERO;
        }
        Self { low: -magnitude, high: magnitude }
    }

    pub fn magnitude(&self) -> f64 {
        self.high
    }

    pub fn is_zero(&self) -> bool {
        self.low == 0.0 && self.high == 0.0
    }

    pub fn apply(&self, output: f64) -> f64 {
        output.clamp(self.low, self.high)
    }
}

impl std::fmt::Display for SpeedLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.0}, {:.0})", self.low, self.high)
    }
}

/// The one record shared between command ingestion and the control loop.
/// Only [`Coordinator`](super::Coordinator) mutates it.
#[derive(Debug, Clone)]
pub struct ControlState {
    pub target: f64,
    /// Effective limit the loop clamps against this tick.
    pub speed_limit: SpeedLimit,
    /// Magnitude the effective limit ramps toward.
    pub requested_limit: f64,
    /// Limit to restore on the next move; `Some` exactly while cancelled.
    pub saved_speed_limit: Option<SpeedLimit>,
    pub mode: PositioningMode,
    pub feedrate: f64,
    /// Bumped on every mutation.
    pub revision: u64,
}

impl ControlState {
    pub fn new(home: f64, limit: f64, feedrate: f64) -> Self {
        Self {
            target: home,
            speed_limit: SpeedLimit::symmetric(limit),
            requested_limit: limit.abs(),
            saved_speed_limit: None,
            mode: PositioningMode::Absolute,
            feedrate,
            revision: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.saved_speed_limit.is_some()
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            target: self.target,
            speed_limit: self.speed_limit,
            requested_limit: self.requested_limit,
            saved_speed_limit: self.saved_speed_limit,
            mode: self.mode,
            feedrate: self.feedrate,
            cancelled: self.is_cancelled(),
            revision: self.revision,
        }
    }
}

/// Consistent copy of [`ControlState`] taken under one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlSnapshot {
    pub target: f64,
    pub speed_limit: SpeedLimit,
    pub requested_limit: f64,
    pub saved_speed_limit: Option<SpeedLimit>,
    pub mode: PositioningMode,
    pub feedrate: f64,
    pub cancelled: bool,
    pub revision: u64,
}
