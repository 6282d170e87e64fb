// src/motion/pid.rs - Position loop PID (mm error -> signed duty)

/// PID with a clamped integrator. The derivative acts on the measurement
/// rather than the error, so a setpoint step does not kick the output.
#[derive(Debug, Clone)]
pub struct PositionPid {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    integral_limit: f64,
    previous_position: Option<f64>,
}

impl PositionPid {
    pub fn new(kp: f64, ki: f64, kd: f64, integral_limit: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            integral_limit: integral_limit.abs(),
            previous_position: None,
        }
    }

    /// Compute the raw (unclamped, un-deadbanded) output for one period.
    pub fn update(&mut self, target: f64, position: f64, dt: f64) -> f64 {
        let error = target - position;
        if dt <= 0.0 {
            return self.kp * error + self.integral;
        }

        self.integral = (self.integral + self.ki * error * dt).clamp(-self.integral_limit, self.integral_limit);

        let derivative = match self.previous_position {
            Some(previous) => -(position - previous) / dt,
            None => 0.0,
        };
        self.previous_position = Some(position);

        self.kp * error + self.integral + self.kd * derivative
    }

    /// Drop integrator and derivative history.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_position = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_only() {
        let mut pid = PositionPid::new(20.0, 0.0, 0.0, 100.0);
        assert_eq!(pid.update(100.0, 67.0, 0.01), 660.0);
        assert_eq!(pid.update(50.0, 67.0, 0.01), -340.0);
    }

    #[test]
    fn test_derivative_opposes_motion() {
        let mut pid = PositionPid::new(0.0, 0.0, 0.5, 100.0);
        assert_eq!(pid.update(100.0, 10.0, 0.1), 0.0);
        // Moved +1 mm in 0.1 s toward the target: derivative brakes.
        let out = pid.update(100.0, 11.0, 0.1);
        assert!((out + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_integral_is_clamped() {
        let mut pid = PositionPid::new(0.0, 10.0, 0.0, 50.0);
        for _ in 0..1000 {
            pid.update(100.0, 0.0, 0.1);
        }
        assert_eq!(pid.update(100.0, 0.0, 0.1), 50.0);
        pid.reset();
        assert!((pid.update(100.0, 0.0, 0.01) - 10.0).abs() < 1e-9);
    }
}
