//! Sensor calibration: maps raw potentiometer readings (mV) to stroke position (mm).
//!
//! The table is piecewise linear. Lookups outside the calibrated span are
//! clamped to the end points before interpolation, so a noisy or saturated
//! reading can never yield a position beyond the calibrated travel.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// A raw sensor value as produced by the position source, in millivolts.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct RawReading(pub f64);

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration table needs at least two points, got {0}")]
    TooFewPoints(usize),
    #[error("calibration columns differ in length ({analogs} analogs, {positions} positions)")]
    LengthMismatch { analogs: usize, positions: usize },
    #[error("calibration column '{0}' is not strictly monotonic")]
    NotMonotonic(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk layout of a calibration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct CalibrationFile {
    analogs_mv: Vec<f64>,
    positions_mm: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    analogs_mv: Vec<f64>,
    positions_mm: Vec<f64>,
}

impl Calibration {
    /// Build a table from matching columns. Rows are sorted by analog value;
    /// both columns must then be strictly monotonic (the position column may
    /// run in either direction, for reversed potentiometer wiring).
    pub fn new(analogs_mv: Vec<f64>, positions_mm: Vec<f64>) -> Result<Self, CalibrationError> {
        if analogs_mv.len() != positions_mm.len() {
            return Err(CalibrationError::LengthMismatch {
                analogs: analogs_mv.len(),
                positions: positions_mm.len(),
            });
        }
        if analogs_mv.len() < 2 {
            return Err(CalibrationError::TooFewPoints(analogs_mv.len()));
        }

        let mut rows: Vec<(f64, f64)> = analogs_mv.into_iter().zip(positions_mm).collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (analogs_mv, positions_mm): (Vec<f64>, Vec<f64>) = rows.into_iter().unzip();

        if !strictly_monotonic(&analogs_mv) {
            return Err(CalibrationError::NotMonotonic("analogs_mv"));
        }
        if !strictly_monotonic(&positions_mm) {
            return Err(CalibrationError::NotMonotonic("positions_mm"));
        }

        Ok(Self { analogs_mv, positions_mm })
    }

    /// Two-point table.
    pub fn linear(raw_lo: f64, raw_hi: f64, pos_lo: f64, pos_hi: f64) -> Result<Self, CalibrationError> {
        Self::new(vec![raw_lo, raw_hi], vec![pos_lo, pos_hi])
    }

    /// Load a JSON table of the form `{"analogs_mv": [...], "positions_mm": [...]}`.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path)?;
        let file: CalibrationFile = serde_json::from_str(&contents)?;
        Self::new(file.analogs_mv, file.positions_mm)
    }

    pub fn len(&self) -> usize {
        self.analogs_mv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analogs_mv.is_empty()
    }

    /// Calibrated position span as `(min, max)`.
    pub fn position_range(&self) -> (f64, f64) {
        let first = self.positions_mm[0];
        let last = self.positions_mm[self.positions_mm.len() - 1];
        (first.min(last), first.max(last))
    }

    pub fn raw_to_position(&self, raw: RawReading) -> f64 {
        interpolate(raw.0, &self.analogs_mv, &self.positions_mm)
    }

    pub fn position_to_raw(&self, position_mm: f64) -> RawReading {
        if self.positions_mm[0] <= self.positions_mm[self.positions_mm.len() - 1] {
            RawReading(interpolate(position_mm, &self.positions_mm, &self.analogs_mv))
        } else {
            // Descending position column: walk it in ascending order.
            let xs: Vec<f64> = self.positions_mm.iter().rev().copied().collect();
            let ys: Vec<f64> = self.analogs_mv.iter().rev().copied().collect();
            RawReading(interpolate(position_mm, &xs, &ys))
        }
    }
}

fn strictly_monotonic(values: &[f64]) -> bool {
    let rising = values.windows(2).all(|w| w[1] > w[0]);
    let falling = values.windows(2).all(|w| w[1] < w[0]);
    rising || falling
}

/// Linear interpolation over ascending `xs`, clamping `x` to the table ends.
/// NaN maps to the first point.
fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let last = xs.len() - 1;
    if x.is_nan() || x <= xs[0] {
        return ys[0];
    }
    if x >= xs[last] {
        return ys[last];
    }
    let upper = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}
