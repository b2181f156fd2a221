//! Calibration between target and control signals.
//!
//! Every output (and optionally input) distinguishes two signals:
//!
//! - **target**: the physical quantity the operator asks for (volts, mA, ...)
//! - **control**: the low-level value the hardware understands (a 0–1 DAC
//!   fraction, a raw setpoint, ...)
//!
//! A [`Calibration`] converts between the two in both directions. Two variants
//! are provided:
//!
//! - [`LinearCalibration`]: `target = control * factor`
//! - [`InterpolCalibration`]: piecewise-linear interpolation over a measured table
//!
//! # Usage
//!
//! ```
//! use lab_sweep::calibration::{Calibration, InterpolCalibration, Units};
//!
//! let cal = InterpolCalibration::new(
//!     vec![(0.0, 0.0), (100.0, 0.5), (300.0, 1.0)],
//!     false,
//!     Units::default(),
//! )
//! .unwrap();
//! assert_eq!(cal.to_control(200.0).unwrap(), 0.75);
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, LabError};

/// Optional unit names for both sides of a calibration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Units {
    /// Unit of the control signal (e.g. "V" at the DAC pin)
    #[serde(default)]
    pub control: Option<String>,
    /// Unit of the target signal (e.g. "kV" at the electrode)
    #[serde(default)]
    pub target: Option<String>,
}

impl Units {
    /// The same unit on both sides.
    pub fn same(unit: impl Into<String>) -> Self {
        let unit = unit.into();
        Self {
            control: Some(unit.clone()),
            target: Some(unit),
        }
    }
}

/// Relation between the target signal and the control signal of a device.
pub trait Calibration: Send + Sync + fmt::Debug {
    /// Convert a target value to the control value needed to produce it.
    fn to_control(&self, target: f64) -> AppResult<f64>;

    /// Convert a control value back to the target it produces.
    fn to_target(&self, control: f64) -> AppResult<f64>;

    /// Units of both signals.
    fn units(&self) -> &Units;
}

/// Linear relation `target = control * factor`.
#[derive(Debug, Clone)]
pub struct LinearCalibration {
    factor: f64,
    units: Units,
}

impl LinearCalibration {
    /// Create a linear calibration. `factor` must be finite and non-zero.
    pub fn new(factor: f64, units: Units) -> AppResult<Self> {
        if !factor.is_finite() || factor == 0.0 {
            return Err(LabError::Calibration(format!(
                "linear factor must be finite and non-zero, got {}",
                factor
            )));
        }
        Ok(Self { factor, units })
    }

    /// Identity calibration (control == target).
    pub fn standard(unit: Option<&str>) -> Self {
        Self {
            factor: 1.0,
            units: unit.map(Units::same).unwrap_or_default(),
        }
    }
}

impl Calibration for LinearCalibration {
    fn to_control(&self, target: f64) -> AppResult<f64> {
        Ok(target / self.factor)
    }

    fn to_target(&self, control: f64) -> AppResult<f64> {
        Ok(control * self.factor)
    }

    fn units(&self) -> &Units {
        &self.units
    }
}

/// Piecewise-linear calibration through measured `(target, control)` points.
///
/// The table must describe a strictly increasing function. Outside the table,
/// values are rejected unless `extrapolate` is set, in which case the outermost
/// segment is extended.
#[derive(Debug, Clone)]
pub struct InterpolCalibration {
    points: Vec<(f64, f64)>,
    extrapolate: bool,
    units: Units,
}

impl InterpolCalibration {
    /// Build a calibration from `(target, control)` points (any order).
    pub fn new(mut points: Vec<(f64, f64)>, extrapolate: bool, units: Units) -> AppResult<Self> {
        if points.len() < 2 {
            return Err(LabError::Calibration(
                "calibration requires at least 2 points".to_string(),
            ));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        for pair in points.windows(2) {
            let (t0, c0) = pair[0];
            let (t1, c1) = pair[1];
            if t0 == t1 || c0 >= c1 {
                return Err(LabError::Calibration(
                    "points must form a strictly increasing function".to_string(),
                ));
            }
        }

        Ok(Self {
            points,
            extrapolate,
            units,
        })
    }

    /// Load a two-column `target,control` CSV file without header.
    pub fn from_file(path: &Path, extrapolate: bool, units: Units) -> AppResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut points = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let parse = |idx: usize| -> AppResult<f64> {
                record
                    .get(idx)
                    .and_then(|field| field.parse::<f64>().ok())
                    .ok_or_else(|| {
                        LabError::Calibration(format!(
                            "{}: line {} is not a 'target,control' pair",
                            path.display(),
                            line + 1
                        ))
                    })
            };
            points.push((parse(0)?, parse(1)?));
        }

        Self::new(points, extrapolate, units)
    }

    /// The calibration table, sorted by target.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    fn interpolate(&self, x: f64, inverse: bool) -> AppResult<f64> {
        let xy = |i: usize| -> (f64, f64) {
            let (t, c) = self.points[i];
            if inverse {
                (c, t)
            } else {
                (t, c)
            }
        };
        let line = |(x0, y0): (f64, f64), (x1, y1): (f64, f64)| (x - x0) / (x1 - x0) * (y1 - y0) + y0;
        let out_of_domain = || {
            LabError::Calibration(format!(
                "value {} is outside the calibration domain; enable extrapolation to continue",
                x
            ))
        };

        let last = self.points.len() - 1;
        for i in 0..=last {
            if x < xy(i).0 {
                if i > 0 {
                    return Ok(line(xy(i - 1), xy(i)));
                }
                if !self.extrapolate {
                    return Err(out_of_domain());
                }
                return Ok(line(xy(0), xy(1)));
            }
        }

        if !self.extrapolate && x != xy(last).0 {
            return Err(out_of_domain());
        }
        Ok(line(xy(last - 1), xy(last)))
    }
}

impl Calibration for InterpolCalibration {
    fn to_control(&self, target: f64) -> AppResult<f64> {
        self.interpolate(target, false)
    }

    fn to_target(&self, control: f64) -> AppResult<f64> {
        self.interpolate(control, true)
    }

    fn units(&self) -> &Units {
        &self.units
    }
}
