// src/control/mod.rs - Shared control state and the only API allowed to mutate it
pub mod clamp;
pub mod coordinator;
pub mod state;

pub use clamp::{Clamped, SafetyClamp};
pub use coordinator::{CancelOutcome, ControlError, Coordinator, LimitOutcome, MoveOutcome};
pub use state::{ControlSnapshot, ControlState, PositioningMode, SpeedLimit};
