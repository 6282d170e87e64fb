//! Travel and output bounds applied at every entry point that can move the setpoint.

/// Result of a clamping operation, remembering what was asked for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clamped {
    pub value: f64,
    pub requested: f64,
}

impl Clamped {
    pub fn was_clamped(&self) -> bool {
        self.value != self.requested
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyClamp {
    min_travel: f64,
    max_travel: f64,
    rated_output: f64,
}

impl SafetyClamp {
    /// `margin` keeps the setpoint that far inside both mechanical ends.
    pub fn new(min_travel: f64, max_travel: f64, margin: f64, rated_output: u16) -> Self {
        Self {
            min_travel: min_travel + margin,
            max_travel: max_travel - margin,
            rated_output: f64::from(rated_output),
        }
    }

    pub fn min_travel(&self) -> f64 {
        self.min_travel
    }

    pub fn max_travel(&self) -> f64 {
        self.max_travel
    }

    pub fn rated_output(&self) -> f64 {
        self.rated_output
    }

    /// Bound a target to `[min_travel, max_travel]`. NaN maps to `min_travel`.
    pub fn clamp_target(&self, position: f64) -> Clamped {
        let value = if position.is_nan() {
            self.min_travel
        } else {
            position.clamp(self.min_travel, self.max_travel)
        };
        Clamped { value, requested: position }
    }

    /// Bound a speed limit magnitude to `[0, rated_output]`. NaN maps to 0.
    pub fn clamp_limit(&self, limit: f64) -> Clamped {
        let value = if limit.is_nan() { 0.0 } else { limit.clamp(0.0, self.rated_output) };
        Clamped { value, requested: limit }
    }
}
