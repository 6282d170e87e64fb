// src/motion/mod.rs - Closed-loop position control
pub mod controller;
pub mod pid;

pub use controller::{
    plan_drive, ActuatorStatus, ControllerEvent, DrivePlan, LoopSettings, MotionController, RunState,
    TransitionEvent,
};
pub use pid::PositionPid;
