//! N-dimensional grid search.
//!
//! Every combination of the device values is measured once. The first device
//! is the outermost loop. Axes are walked boustrophedon-style: an axis that
//! ended its last pass at a non-zero index walks back in reverse, so between
//! two consecutive measurements exactly one device moves by one step.
//!
//! ```text
//! devices: a = [0, 10, 20], b = [0, 5]
//! visits:  (0,0) (0,5) (10,5) (10,0) (20,0) (20,5)
//! ```
//!
//! A device marked one-way (`bidirectional = false`) is instead driven back to
//! its first value after every pass, for hardware that must always approach
//! its values from the same side.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use ndarray::{ArrayD, Ix2, IxDyn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::measurement::{measure, set_output, ValueUpdate};
use super::ui::UiSurface;
use super::{Routine, RoutineContext};
use crate::data::heatmap::{display_order, Heatmap, HeatmapSettings};
use crate::data::results::{FileSettings, ResultsWriter};
use crate::error::{AppResult, LabError};
use crate::input::Input;
use crate::output::Output;

/// One sweep axis.
#[derive(Debug, Clone)]
pub struct Device {
    /// Output driven along this axis
    pub output: Arc<Output>,
    /// Target values, visited in this order on forward passes
    pub values: Vec<f64>,
    /// Time to wait after changing this output before measuring
    pub settle: Duration,
    /// Walk back in reverse after a forward pass (instead of resetting to the first value)
    pub bidirectional: bool,
}

impl Device {
    /// Bidirectional axis over `values`.
    pub fn new(output: Arc<Output>, values: Vec<f64>, settle: Duration) -> Self {
        Self {
            output,
            values,
            settle,
            bidirectional: true,
        }
    }

    /// Choose between boustrophedon (`true`) and one-way (`false`) passes.
    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    /// Label of the output.
    pub fn label(&self) -> &str {
        self.output.label()
    }
}

fn default_samples_per_point() -> usize {
    1
}

fn default_check_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_plot_every() -> usize {
    1
}

/// Measurement and display settings of a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Minimum number of samples averaged per grid point
    #[serde(default = "default_samples_per_point")]
    pub samples_per_point: usize,
    /// Time between buffer drains while waiting for samples
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
    /// Move the output knobs along with the sweep
    #[serde(default = "default_true")]
    pub update_graphics: bool,
    /// Redraw the live heatmap every this many measurements; 0 disables live redraw
    #[serde(default = "default_plot_every")]
    pub plot_every: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            samples_per_point: default_samples_per_point(),
            check_interval: default_check_interval(),
            update_graphics: true,
            plot_every: default_plot_every(),
        }
    }
}

/// Lifecycle of a [`GridSearch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    /// Never run
    Idle,
    /// Opening the results file and moving to the start position
    Initializing,
    /// Measuring
    Sweeping,
    /// Every grid point was measured
    Completed,
    /// Stopped early by cancellation
    Cancelled,
    /// Stopped by an error
    Failed,
}

/// Result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutcome {
    /// Whether every grid point was measured
    pub completed: bool,
    /// Number of measurements taken
    pub measurements: usize,
    /// Measurements indexed by axis position; unvisited cells are 0
    pub results: ArrayD<f64>,
    /// Results file, if one was written
    pub results_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum ResultsDestination {
    Generated(FileSettings),
    Exact(PathBuf),
}

struct SweepState {
    results: ArrayD<f64>,
    indices: Vec<usize>,
    counter: usize,
    writer: Option<ResultsWriter>,
    live_plot: bool,
    update: ValueUpdate,
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::SeqCst)).then_some(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sweep of one or more outputs over a grid, measuring a buffered input at every point.
pub struct GridSearch {
    name: String,
    devices: Vec<Device>,
    input: Arc<dyn Input>,
    settings: SweepSettings,
    results_file: Option<ResultsDestination>,
    heatmap: Option<HeatmapSettings>,
    running: AtomicBool,
    phase: Mutex<SweepPhase>,
    last_outcome: Mutex<Option<SweepOutcome>>,
}

impl GridSearch {
    /// Sweep `devices` (outermost first), measuring `input`.
    ///
    /// Fails if there are no devices, a device has no values, or `input` is
    /// not buffered.
    pub fn new(devices: Vec<Device>, input: Arc<dyn Input>, settings: SweepSettings) -> AppResult<Self> {
        let search = Self {
            name: "Grid search".to_string(),
            devices,
            input,
            settings,
            results_file: None,
            heatmap: None,
            running: AtomicBool::new(false),
            phase: Mutex::new(SweepPhase::Idle),
            last_outcome: Mutex::new(None),
        };
        search.validate()?;
        Ok(search)
    }

    /// Rename the routine.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Write every measurement to a fresh file named by `settings`.
    pub fn with_results(mut self, settings: FileSettings) -> Self {
        self.results_file = Some(ResultsDestination::Generated(settings));
        self
    }

    /// Write every measurement to `path`, which must not exist yet.
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_file = Some(ResultsDestination::Exact(path.into()));
        self
    }

    /// Show a heatmap of the results. Ignored unless there are exactly two devices.
    pub fn with_heatmap(mut self, settings: HeatmapSettings) -> Self {
        self.heatmap = Some(settings);
        self
    }

    /// The sweep axes, outermost first.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Measurement settings.
    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// Number of grid points.
    pub fn total_points(&self) -> usize {
        self.devices.iter().map(|d| d.values.len()).product()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SweepPhase {
        *self.phase.lock()
    }

    /// Snapshot of the last finished (completed or cancelled) run.
    pub fn last_outcome(&self) -> Option<SweepOutcome> {
        self.last_outcome.lock().clone()
    }

    fn set_phase(&self, phase: SweepPhase) {
        debug!(routine = %self.name, ?phase, "phase change");
        *self.phase.lock() = phase;
    }

    fn validate(&self) -> AppResult<()> {
        if self.devices.is_empty() {
            return Err(LabError::Configuration(
                "a grid search needs at least one device".to_string(),
            ));
        }
        if let Some(device) = self.devices.iter().find(|d| d.values.is_empty()) {
            return Err(LabError::EmptyAxis(device.label().to_string()));
        }
        if self.input.as_buffered().is_none() {
            return Err(LabError::Configuration(format!(
                "input '{}' is not buffered and cannot be measured",
                self.input.label()
            )));
        }
        Ok(())
    }

    /// Run the sweep to completion or cancellation.
    ///
    /// Device values are checked and the results file is created before any
    /// output is written. A cancelled sweep is not an error: it returns an
    /// outcome with `completed == false` and the partial results.
    pub async fn execute(&self, ctx: &RoutineContext) -> AppResult<SweepOutcome> {
        let _guard = RunGuard::acquire(&self.running).ok_or_else(|| LabError::RoutineBusy(self.name.clone()))?;
        self.set_phase(SweepPhase::Initializing);

        match self.sweep(ctx).await {
            Ok(outcome) => {
                self.set_phase(if outcome.completed {
                    SweepPhase::Completed
                } else {
                    SweepPhase::Cancelled
                });
                *self.last_outcome.lock() = Some(outcome.clone());
                Ok(outcome)
            }
            Err(e) => {
                self.set_phase(SweepPhase::Failed);
                Err(e)
            }
        }
    }

    async fn sweep(&self, ctx: &RoutineContext) -> AppResult<SweepOutcome> {
        self.validate()?;
        let buffered = self
            .input
            .as_buffered()
            .ok_or_else(|| LabError::Configuration(format!("input '{}' is not buffered", self.input.label())))?;

        let writer = match &self.results_file {
            Some(destination) => {
                let path = match destination {
                    ResultsDestination::Generated(settings) => settings.generate_path()?,
                    ResultsDestination::Exact(path) => path.clone(),
                };
                let labels: Vec<&str> = self.devices.iter().map(Device::label).collect();
                Some(ResultsWriter::create_new(&path, &labels, self.input.label())?)
            }
            None => None,
        };

        let shape: Vec<usize> = self.devices.iter().map(|d| d.values.len()).collect();
        let heatmap = self.new_heatmap();
        let mut state = SweepState {
            results: ArrayD::zeros(IxDyn(&shape)),
            indices: vec![0; self.devices.len()],
            counter: 0,
            writer,
            live_plot: heatmap.is_some() && self.settings.plot_every > 0,
            update: ValueUpdate::from_update_graphics(self.settings.update_graphics),
        };
        info!(routine = %self.name, points = self.total_points(), ?shape, "grid search started");

        if let (true, Some(mut heatmap)) = (state.live_plot, heatmap.clone()) {
            heatmap.plot(self.heatmap_data(&state.results)?);
            self.post(ctx, move |surface| surface.show_heatmap(heatmap));
        }

        let mut max_settle = Duration::ZERO;
        for device in &self.devices {
            set_output(ctx, &device.output, device.values[0], state.update, false).await?;
            max_settle = max_settle.max(device.settle);
        }
        tokio::time::sleep(max_settle).await;

        self.set_phase(SweepPhase::Sweeping);
        let traversal: AppResult<bool> = async {
            if !self.measure_point(ctx, &mut state).await? {
                return Ok(false);
            }
            self.sweep_axis(ctx, 0, &mut state).await
        }
        .await;
        buffered.clear_buffer(true).await;
        let completed = traversal?;

        let results_path = state.writer.take().map(ResultsWriter::finish).transpose()?;

        if let Some(mut heatmap) = heatmap {
            let data = self.heatmap_data(&state.results)?;
            if state.live_plot {
                self.post(ctx, move |surface| surface.update_heatmap(data));
            } else {
                heatmap.plot(data);
                self.post(ctx, move |surface| surface.show_heatmap(heatmap));
            }
        }

        if completed {
            info!(routine = %self.name, measurements = state.counter, "grid search completed");
        } else {
            info!(routine = %self.name, measurements = state.counter, "grid search cancelled");
        }
        Ok(SweepOutcome {
            completed,
            measurements: state.counter,
            results: state.results,
            results_path,
        })
    }

    /// Walk axis `depth` and everything below it. Returns `false` if cancelled.
    fn sweep_axis<'a>(
        &'a self,
        ctx: &'a RoutineContext,
        depth: usize,
        state: &'a mut SweepState,
    ) -> BoxFuture<'a, AppResult<bool>> {
        async move {
            let device = &self.devices[depth];
            let count = device.values.len();
            let inverted = state.indices[depth] > 0;
            let order: Vec<usize> = if inverted {
                (0..count).rev().collect()
            } else {
                (0..count).collect()
            };

            for (step, &index) in order.iter().enumerate() {
                if ctx.is_cancelled() {
                    return Ok(false);
                }
                // The first position is where the axis already is.
                if step > 0 {
                    state.indices[depth] = index;
                    set_output(ctx, &device.output, device.values[index], state.update, false).await?;
                    tokio::time::sleep(device.settle).await;
                    if !self.measure_point(ctx, state).await? {
                        return Ok(false);
                    }
                }
                if depth + 1 < self.devices.len() && !self.sweep_axis(ctx, depth + 1, state).await? {
                    return Ok(false);
                }
            }

            if !device.bidirectional && state.indices[depth] != 0 {
                if ctx.is_cancelled() {
                    return Ok(false);
                }
                state.indices[depth] = 0;
                set_output(ctx, &device.output, device.values[0], state.update, false).await?;
                tokio::time::sleep(device.settle).await;
            }
            Ok(true)
        }
        .boxed()
    }

    /// Measure at the current indices and record the result. Returns `false` if cancelled.
    async fn measure_point(&self, ctx: &RoutineContext, state: &mut SweepState) -> AppResult<bool> {
        let Some(value) = measure(
            ctx,
            self.input.as_ref(),
            self.settings.samples_per_point,
            self.settings.check_interval,
        )
        .await?
        else {
            return Ok(false);
        };

        state.results[IxDyn(&state.indices)] = value;
        state.counter += 1;
        debug!(indices = ?state.indices, value, counter = state.counter, "grid point measured");

        if state.live_plot && state.counter % self.settings.plot_every == 0 {
            let data = self.heatmap_data(&state.results)?;
            self.post(ctx, move |surface| surface.update_heatmap(data));
        }

        if let Some(writer) = state.writer.as_mut() {
            let row: Vec<f64> = self
                .devices
                .iter()
                .zip(&state.indices)
                .map(|(device, &index)| device.output.target().unwrap_or(device.values[index]))
                .collect();
            writer.append(&row, value)?;
        }
        Ok(true)
    }

    fn new_heatmap(&self) -> Option<Heatmap> {
        let settings = self.heatmap.clone()?;
        let [rows, cols] = self.devices.as_slice() else {
            return None;
        };
        Some(Heatmap::new(
            settings,
            rows.label(),
            rows.values.clone(),
            cols.label(),
            cols.values.clone(),
        ))
    }

    fn heatmap_data(&self, results: &ArrayD<f64>) -> AppResult<ndarray::Array2<f64>> {
        let matrix = results
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| LabError::Configuration(format!("heatmap needs a 2-D sweep: {}", e)))?;
        Ok(display_order(matrix))
    }

    fn post(&self, ctx: &RoutineContext, job: impl FnOnce(&mut dyn UiSurface) + Send + 'static) {
        if let Err(e) = ctx.ui().post(Box::new(job)) {
            warn!(routine = %self.name, error = %e, "could not post heatmap update");
        }
    }
}

#[async_trait]
impl Routine for GridSearch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: RoutineContext) -> AppResult<()> {
        let outcome = self.execute(&ctx).await?;
        if let Some(path) = &outcome.results_path {
            info!(routine = %self.name, path = %path.display(), "results saved");
        }
        Ok(())
    }
}
