// Closed-loop behaviour on the simulated plant, driven tick by tick

use std::time::Duration;

use linact_rs::calibration::Calibration;
use linact_rs::command::CommandInterpreter;
use linact_rs::config::{ControlConfig, Protocol, SimulationConfig};
use linact_rs::control::{Coordinator, SafetyClamp};
use linact_rs::hardware::Direction;
use linact_rs::hardware::simulated::SimulatedPlant;
use linact_rs::motion::{ControllerEvent, LoopSettings, MotionController, PositionPid, RunState};
use tokio::sync::broadcast::error::TryRecvError;

struct Rig {
    plant: SimulatedPlant,
    coordinator: Coordinator,
    controller: MotionController,
    interpreter: CommandInterpreter,
}

fn rig(start_mm: f64, ramp_rate: f64) -> Rig {
    let calibration = Calibration::linear(0.0, 5000.0, 0.0, 146.0).unwrap();
    let control = ControlConfig { ramp_rate, ..ControlConfig::default() };
    let plant = SimulatedPlant::new(
        calibration.clone(),
        SimulationConfig::default(),
        1000,
        control.tick_period(),
        start_mm,
    );
    let coordinator = Coordinator::new(
        SafetyClamp::new(0.0, 146.0, 0.0, 1000),
        start_mm,
        500.0,
        control.default_feedrate,
        control.ramp_rate,
    );
    let controller = MotionController::new(
        coordinator.clone(),
        Box::new(plant.clone()),
        Box::new(plant.clone()),
        calibration,
        PositionPid::new(control.kp, control.ki, control.kd, control.integral_limit),
        LoopSettings::from_config(&control, true),
    )
    .unwrap();
    let interpreter = CommandInterpreter::new(coordinator.clone(), controller.status(), Protocol::Both);
    Rig { plant, coordinator, controller, interpreter }
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

#[test]
fn test_cancel_holds_position_and_move_resumes() {
    let mut rig = rig(67.0, 1000.0);
    rig.interpreter.handle_line("100").unwrap();

    let status = rig.controller.tick().unwrap();
    assert_eq!(status.state, RunState::Extending);
    assert_eq!(rig.plant.last_command(), (Direction::Extend, 500));

    let reply = rig.interpreter.handle_line("cancel").unwrap();
    assert!(reply.text.starts_with("[move] Cancelled at 67."));

    // Takes effect on the very next tick.
    let status = rig.controller.tick().unwrap();
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.target, 100.0);
    assert!(status.speed_limit.is_zero());
    let held = rig.plant.position();
    for _ in 0..20 {
        assert_eq!(rig.controller.tick().unwrap().state, RunState::Stopped);
    }
    assert_eq!(rig.plant.position(), held);

    let reply = rig.interpreter.handle_line("50").unwrap();
    assert_eq!(reply.text, "[move] Target: 50.0 mm (resumed, limit (-500, 500))");
    let status = rig.controller.tick().unwrap();
    assert_eq!(status.state, RunState::Retracting);
    assert_eq!(rig.plant.last_command().0, Direction::Retract);
}

#[test]
fn test_zero_speed_stops_despite_error() {
    let mut rig = rig(10.0, 0.0);
    rig.interpreter.handle_line("speed 0").unwrap();
    rig.interpreter.handle_line("120").unwrap();
    for _ in 0..5 {
        let status = rig.controller.tick().unwrap();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.output, 0.0);
    }
    assert_eq!(rig.plant.position(), 10.0);
}

#[test]
fn test_reaches_target_and_settles() {
    let mut rig = rig(20.0, 1000.0);
    rig.interpreter.handle_line("speed 1000").unwrap();
    rig.interpreter.handle_line("G0 X30").unwrap();
    let mut state = RunState::Extending;
    for _ in 0..1000 {
        state = rig.controller.tick().unwrap().state;
    }
    assert_eq!(state, RunState::Stopped);
    // Settles just inside the output deadband.
    assert!((rig.plant.position() - 30.0).abs() <= 0.6);
}

#[test]
fn test_limit_decrease_ramps_down() {
    let mut rig = rig(0.0, 1000.0);
    rig.interpreter.handle_line("140").unwrap();
    let reply = rig.interpreter.handle_line("speed 400").unwrap();
    assert_eq!(reply.text, "[speed] Limit ramping down to 400");

    // 1000 units/s over a 10 ms period: 10 per tick.
    let status = rig.controller.tick().unwrap();
    assert_eq!(status.speed_limit.magnitude(), 490.0);
    assert_eq!(rig.plant.last_command(), (Direction::Extend, 490));
    for _ in 0..20 {
        rig.controller.tick().unwrap();
    }
    assert_eq!(rig.coordinator.snapshot().unwrap().speed_limit.magnitude(), 400.0);
    assert_eq!(rig.plant.last_command(), (Direction::Extend, 400));

    // Increases are immediate.
    rig.interpreter.handle_line("speed 900").unwrap();
    rig.controller.tick().unwrap();
    assert_eq!(rig.plant.last_command(), (Direction::Extend, 900));
}

#[test]
fn test_cancel_mid_ramp_restores_requested_limit() {
    let mut rig = rig(0.0, 1000.0);
    rig.interpreter.handle_line("140").unwrap();
    rig.interpreter.handle_line("speed 100").unwrap();
    rig.controller.tick().unwrap();
    rig.interpreter.handle_line("cancel").unwrap();
    let reply = rig.interpreter.handle_line("140").unwrap();
    assert!(reply.text.ends_with("(resumed, limit (-100, 100))"));
    rig.controller.tick().unwrap();
    assert_eq!(rig.plant.last_command(), (Direction::Extend, 100));
}

#[test]
fn test_sensor_failures_stop_drive_and_report() {
    let mut rig = rig(40.0, 1000.0);
    let mut events = rig.controller.subscribe();

    rig.interpreter.handle_line("80").unwrap();
    assert_eq!(rig.controller.tick().unwrap().state, RunState::Extending);

    rig.plant.fail_next_reads(5);
    for _ in 0..5 {
        let status = rig.controller.tick().unwrap();
        assert!(!status.sensor_ok);
        // Last good reading is still reported.
        assert!(status.position.is_some());
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(rig.plant.last_command(), (Direction::Stop, 0));
    }
    let status = rig.controller.tick().unwrap();
    assert!(status.sensor_ok);
    assert_eq!(status.state, RunState::Extending);

    let events = drain(&mut events);
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            ControllerEvent::Transition(t) if t.state == RunState::Extending => "extending",
            ControllerEvent::Transition(t) if t.state == RunState::Stopped => "stopped",
            ControllerEvent::Transition(_) => "retracting",
            ControllerEvent::SensorDegraded { .. } => "degraded",
            ControllerEvent::SensorRecovered { .. } => "recovered",
            ControllerEvent::DriveFault { .. } => "drive-fault",
            ControllerEvent::DriveRecovered => "drive-recovered",
        })
        .collect();
    assert_eq!(kinds, vec!["extending", "stopped", "degraded", "recovered", "extending"]);
    assert!(matches!(events[2], ControllerEvent::SensorDegraded { consecutive_failures: 5, .. }));
}

#[test]
fn test_verbose_transitions_carry_raw_and_output() {
    let mut rig = rig(0.0, 1000.0);
    let mut events = rig.controller.subscribe();
    rig.interpreter.handle_line("100").unwrap();
    rig.controller.tick().unwrap();
    match drain(&mut events).as_slice() {
        [ControllerEvent::Transition(t)] => {
            assert_eq!(t.state, RunState::Extending);
            assert_eq!(t.raw, Some(0.0));
            assert_eq!(t.output, Some(500.0));
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn test_drive_fault_reported_once() {
    let mut rig = rig(10.0, 1000.0);
    let mut events = rig.controller.subscribe();
    rig.plant.set_drive_fault(true);
    for _ in 0..3 {
        rig.controller.tick().unwrap();
    }
    let faults = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ControllerEvent::DriveFault { .. }))
        .count();
    assert_eq!(faults, 1);

    rig.plant.set_drive_fault(false);
    rig.controller.tick().unwrap();
    assert!(matches!(drain(&mut events).as_slice(), [ControllerEvent::DriveRecovered]));
}

#[tokio::test]
async fn test_run_stops_actuator_on_shutdown() {
    let rig = rig(0.0, 1000.0);
    rig.interpreter.handle_line("120").unwrap();
    let plant = rig.plant.clone();
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let task = tokio::spawn(rig.controller.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(plant.last_command().0, Direction::Extend);

    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    tokio_test::assert_ok!(result);
    assert_eq!(plant.last_command(), (Direction::Stop, 0));
    assert!(plant.position() > 0.0);
}
