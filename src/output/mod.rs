//! Validated single-value outputs.
//!
//! An [`Output`] wraps an [`OutputDriver`] with a [`Calibration`] and two sets
//! of [`Limits`]: one on the target signal (the physical quantity) and one on
//! the control signal (what the driver is sent). Requests outside the limits
//! are clamped, never rejected; every clamp notifies the registered
//! invalid-output handlers so the UI can flag it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::calibration::{Calibration, Units};
use crate::error::{AppResult, LabError};
use crate::instrument::OutputDriver;

/// Slack allowed when re-checking a back-converted target against its limits.
const LIMIT_TOLERANCE: f64 = 1e-9;

/// Optional inclusive bounds on a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Lowest allowed value
    #[serde(default)]
    pub min: Option<f64>,
    /// Highest allowed value
    #[serde(default)]
    pub max: Option<f64>,
}

impl Limits {
    /// Bounds on both sides.
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// Clamp `value` into the bounds. Returns the value and whether it was inside.
    pub fn correct(&self, value: f64) -> (f64, bool) {
        match (self.min, self.max) {
            (Some(min), _) if value < min => (min, false),
            (_, Some(max)) if value > max => (max, false),
            _ => (value, true),
        }
    }

    /// Whether `value` lies inside the bounds, allowing `tolerance`.
    pub fn contains(&self, value: f64, tolerance: f64) -> bool {
        self.min.map_or(true, |min| value >= min - tolerance)
            && self.max.map_or(true, |max| value <= max + tolerance)
    }

    /// Tightest bounds satisfying both `self` and `other`.
    pub fn intersect(&self, other: &Limits) -> Limits {
        let pick = |a: Option<f64>, b: Option<f64>, f: fn(f64, f64) -> f64| match (a, b) {
            (Some(a), Some(b)) => Some(f(a, b)),
            (a, b) => a.or(b),
        };
        Limits {
            min: pick(self.min, other.min, f64::max),
            max: pick(self.max, other.max, f64::min),
        }
    }
}

/// Target and control limits of an output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputLimits {
    /// Bounds on the target signal; the minimum defaults to 0
    pub target: Limits,
    /// Bounds on the control signal
    pub control: Limits,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            target: Limits::new(Some(0.0), None),
            control: Limits::default(),
        }
    }
}

impl OutputLimits {
    /// Default limits with a maximum target.
    pub fn with_target_max(max: Option<f64>) -> Self {
        let mut limits = Self::default();
        limits.target.max = max;
        limits
    }
}

/// Notification that a requested target could not be applied as is.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidOutput {
    /// Label of the output
    pub output: String,
    /// Target that was asked for
    pub requested: f64,
    /// Target that was actually applied
    pub applied: f64,
}

impl fmt::Display for InvalidOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: requested {} but applied {}",
            self.output, self.requested, self.applied
        )
    }
}

type InvalidOutputHandler = Box<dyn Fn(&InvalidOutput) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct Applied {
    target: Option<f64>,
    control: Option<f64>,
}

/// A calibrated, limit-checked output device.
pub struct Output {
    label: String,
    calibration: Arc<dyn Calibration>,
    limits: OutputLimits,
    has_feedback: bool,
    applied: Mutex<Applied>,
    handlers: Mutex<Vec<InvalidOutputHandler>>,
    driver: tokio::sync::Mutex<Box<dyn OutputDriver>>,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("label", &self.label)
            .field("limits", &self.limits)
            .field("applied", &*self.applied.lock())
            .finish_non_exhaustive()
    }
}

impl Output {
    /// Wrap `driver`. The driver's own control range is merged into `limits`.
    pub fn new(
        label: impl Into<String>,
        driver: Box<dyn OutputDriver>,
        calibration: Arc<dyn Calibration>,
        mut limits: OutputLimits,
    ) -> Self {
        if let Some((min, max)) = driver.control_range() {
            limits.control = limits.control.intersect(&Limits::new(Some(min), Some(max)));
        }
        Self {
            label: label.into(),
            has_feedback: driver.has_feedback(),
            calibration,
            limits,
            applied: Mutex::new(Applied::default()),
            handlers: Mutex::new(Vec::new()),
            driver: tokio::sync::Mutex::new(driver),
        }
    }

    /// Display label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Effective limits, including the driver's control range.
    pub fn limits(&self) -> &OutputLimits {
        &self.limits
    }

    /// Units of the calibration.
    pub fn units(&self) -> &Units {
        self.calibration.units()
    }

    /// Last applied target, `None` before the first write.
    pub fn target(&self) -> Option<f64> {
        self.applied.lock().target
    }

    /// Last applied control value, `None` before the first write.
    pub fn control(&self) -> Option<f64> {
        self.applied.lock().control
    }

    /// Whether the device reports the value it really applied.
    pub fn has_feedback(&self) -> bool {
        self.has_feedback
    }

    /// Call `handler` whenever a request has to be clamped.
    pub fn add_invalid_output_handler(&self, handler: impl Fn(&InvalidOutput) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    /// Work out the `(target, control)` pair that will be applied for `requested`.
    ///
    /// Returns `NoValidOutput` when clamping the control signal produces a
    /// target outside the target limits.
    pub fn resolve(&self, requested: f64) -> AppResult<(f64, f64, bool)> {
        if !requested.is_finite() {
            return Err(LabError::NoValidOutput(self.label.clone()));
        }
        let (mut target, target_ok) = self.limits.target.correct(requested);
        let (control, control_ok) = self
            .limits
            .control
            .correct(self.calibration.to_control(target)?);
        if !control_ok {
            target = self.calibration.to_target(control)?;
            if !self.limits.target.contains(target, LIMIT_TOLERANCE) {
                return Err(LabError::NoValidOutput(self.label.clone()));
            }
            target = self.limits.target.correct(target).0;
        }
        Ok((target, control, target_ok && control_ok))
    }

    /// Set the target signal and write the matching control value.
    ///
    /// Returns the target that was actually applied, which differs from
    /// `requested` when it had to be clamped.
    pub async fn set_target(&self, requested: f64) -> AppResult<f64> {
        let (target, control, valid) = self.resolve(requested)?;

        {
            let mut driver = self.driver.lock().await;
            driver.write(control).await?;
        }
        *self.applied.lock() = Applied {
            target: Some(target),
            control: Some(control),
        };
        debug!(output = %self.label, target, control, "output set");

        if !valid {
            let event = InvalidOutput {
                output: self.label.clone(),
                requested,
                applied: target,
            };
            warn!(output = %self.label, requested, applied = target, "output value clamped");
            for handler in self.handlers.lock().iter() {
                handler(&event);
            }
        }
        Ok(target)
    }

    /// Put the device in its safe state.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.driver.lock().await.shutdown().await
    }
}
