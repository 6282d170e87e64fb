//! Cancellation and speed-limit coordination.
//!
//! Every write to the shared [`ControlState`] goes through a [`Coordinator`].
//! All operations take the state mutex once and leave the record consistent
//! before releasing it, so the control loop's per-tick snapshot never sees a
//! half-applied command (for example a new target paired with a stale limit).
//! Critical sections contain no I/O and no `.await`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

use super::clamp::{Clamped, SafetyClamp};
use super::state::{ControlSnapshot, ControlState, PositioningMode, SpeedLimit};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    /// A writer panicked mid-update; the record may be torn.
    #[error("control state lock poisoned: snapshot consistency can no longer be guaranteed")]
    StatePoisoned,
}

/// What a move request did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOutcome {
    pub target: Clamped,
    pub mode: PositioningMode,
    pub feedrate: f64,
    /// Limit restored because the move lifted a cancellation.
    pub resumed: Option<SpeedLimit>,
}

/// What a speed-limit request did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitOutcome {
    pub limit: Clamped,
    /// True when the actuator is cancelled; the value takes effect on the next move.
    pub deferred: bool,
    /// True when the effective limit will ramp down rather than step.
    pub ramping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CancelOutcome {
    pub saved: SpeedLimit,
    pub already_cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    state: Arc<Mutex<ControlState>>,
    clamp: SafetyClamp,
    ramp_rate: f64,
}

impl Coordinator {
    /// `home` and `limit` go through the clamp like any other request.
    pub fn new(clamp: SafetyClamp, home: f64, limit: f64, feedrate: f64, ramp_rate: f64) -> Self {
        let home = clamp.clamp_target(home).value;
        let limit = clamp.clamp_limit(limit).value;
        Self {
            state: Arc::new(Mutex::new(ControlState::new(home, limit, feedrate.max(0.0)))),
            clamp,
            ramp_rate: ramp_rate.max(0.0),
        }
    }

    pub fn clamp(&self) -> &SafetyClamp {
        &self.clamp
    }

    fn lock(&self) -> Result<MutexGuard<'_, ControlState>, ControlError> {
        self.state.lock().map_err(|_| ControlError::StatePoisoned)
    }

    /// Set a new setpoint. `Relative` adds `value` to the current target,
    /// `Absolute` replaces it. A pending cancellation is lifted and the
    /// pre-cancel limit restored.
    pub fn request_move(&self, value: f64, mode: PositioningMode) -> Result<MoveOutcome, ControlError> {
        let mut state = self.lock()?;
        Ok(self.apply_move(&mut state, value, mode))
    }

    /// Positioning-language move: `x` is read in the state's current mode,
    /// defaulting to "stay put" when absent. `feedrate`, when given, is stored.
    pub fn request_positioning_move(
        &self,
        x: Option<f64>,
        feedrate: Option<f64>,
    ) -> Result<MoveOutcome, ControlError> {
        let mut state = self.lock()?;
        let mode = state.mode;
        let value = match (x, mode) {
            (Some(v), _) => v,
            (None, PositioningMode::Absolute) => state.target,
            (None, PositioningMode::Relative) => 0.0,
        };
        if let Some(f) = feedrate {
            state.feedrate = f.max(0.0);
        }
        Ok(self.apply_move(&mut state, value, mode))
    }

    fn apply_move(&self, state: &mut ControlState, value: f64, mode: PositioningMode) -> MoveOutcome {
        let requested = match mode {
            PositioningMode::Absolute => value,
            PositioningMode::Relative => state.target + value,
        };
        let target = self.clamp.clamp_target(requested);
        state.target = target.value;

        let resumed = state.saved_speed_limit.take();
        if let Some(saved) = resumed {
            state.speed_limit = saved;
            state.requested_limit = saved.magnitude();
        }
        state.revision += 1;

        MoveOutcome { target, mode, feedrate: state.feedrate, resumed }
    }

    /// Request a symmetric output limit `[-value, value]`. Decreases ramp down
    /// at `ramp_rate`; increases apply at once.
    pub fn set_speed_limit(&self, value: f64) -> Result<LimitOutcome, ControlError> {
        let limit = self.clamp.clamp_limit(value);
        let mut state = self.lock()?;
        state.revision += 1;

        if state.is_cancelled() {
            state.saved_speed_limit = Some(SpeedLimit::symmetric(limit.value));
            return Ok(LimitOutcome { limit, deferred: true, ramping: false });
        }

        state.requested_limit = limit.value;
        let ramping = self.ramp_rate > 0.0 && limit.value < state.speed_limit.magnitude();
        if !ramping {
            state.speed_limit = SpeedLimit::symmetric(limit.value);
        }
        Ok(LimitOutcome { limit, deferred: false, ramping })
    }

    /// Halt in place by zeroing the output bound. The target is untouched.
    /// Idempotent: repeated calls keep the limit captured by the first.
    pub fn cancel(&self) -> Result<CancelOutcome, ControlError> {
        let mut state = self.lock()?;
        if let Some(saved) = state.saved_speed_limit {
            return Ok(CancelOutcome { saved, already_cancelled: true });
        }
        // Capture the ramp's destination, not a transient mid-ramp value.
        let saved = SpeedLimit::symmetric(state.requested_limit);
        state.saved_speed_limit = Some(saved);
        state.speed_limit = SpeedLimit::ZERO;
        state.requested_limit = 0.0;
        state.revision += 1;
        Ok(CancelOutcome { saved, already_cancelled: false })
    }

    pub fn set_mode(&self, mode: PositioningMode) -> Result<(), ControlError> {
        let mut state = self.lock()?;
        state.mode = mode;
        state.revision += 1;
        Ok(())
    }

    pub fn set_feedrate(&self, feedrate: f64) -> Result<(), ControlError> {
        let mut state = self.lock()?;
        state.feedrate = feedrate.max(0.0);
        state.revision += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ControlSnapshot, ControlError> {
        Ok(self.lock()?.snapshot())
    }

    /// Advance the speed-limit ramp by one control period and return the
    /// resulting snapshot, both under the same lock.
    pub fn tick_snapshot(&self, dt: Duration) -> Result<ControlSnapshot, ControlError> {
        let mut state = self.lock()?;
        let current = state.speed_limit.magnitude();
        if current > state.requested_limit {
            let next = if self.ramp_rate > 0.0 {
                (current - self.ramp_rate * dt.as_secs_f64()).max(state.requested_limit)
            } else {
                state.requested_limit
            };
            state.speed_limit = SpeedLimit::symmetric(next);
        }
        Ok(state.snapshot())
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let state = self.state.clone();
        let _ = std::thread::spawn(move || {
            let _guard = state.lock();
            panic!("poisoning control state for test");
        })
        .join();
    }
}
