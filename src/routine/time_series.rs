//! Time series: step the outputs through a list of settings and record the
//! raw input trace while each setting holds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::measurement::{set_output, ValueUpdate};
use super::{Routine, RoutineContext};
use crate::data::results::{FileSettings, ResultsWriter};
use crate::error::{AppResult, LabError};
use crate::input::Input;
use crate::output::Output;

fn default_step_duration() -> Duration {
    Duration::from_secs(2)
}

/// Steps and timing of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSettings {
    /// How long each step is held while samples are collected
    #[serde(default = "default_step_duration", with = "humantime_serde")]
    pub step_duration: Duration,
    /// One target per output for every step
    pub steps: Vec<Vec<f64>>,
}

/// Samples collected by one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesTrace {
    /// Every sample, in arrival order
    pub samples: Vec<f64>,
    /// Index into `samples` at which each step began
    pub step_starts: Vec<usize>,
    /// Whether every step ran
    pub completed: bool,
    /// File the trace was written to
    pub path: Option<PathBuf>,
}

/// Routine stepping outputs through fixed settings while recording an input.
pub struct TimeSeries {
    name: String,
    outputs: Vec<Arc<Output>>,
    input: Arc<dyn Input>,
    settings: TimeSeriesSettings,
    results: Option<FileSettings>,
    last_trace: Mutex<Option<TimeSeriesTrace>>,
}

impl TimeSeries {
    /// Step `outputs` as described by `settings`, recording `input`.
    pub fn new(outputs: Vec<Arc<Output>>, input: Arc<dyn Input>, settings: TimeSeriesSettings) -> AppResult<Self> {
        if input.as_buffered().is_none() {
            return Err(LabError::Configuration(format!(
                "time series input '{}' must be buffered",
                input.label()
            )));
        }
        if let Some(step) = settings.steps.iter().find(|s| s.len() != outputs.len()) {
            return Err(LabError::Configuration(format!(
                "time series step {:?} has {} values for {} outputs",
                step,
                step.len(),
                outputs.len()
            )));
        }
        Ok(Self {
            name: "Time series".to_string(),
            outputs,
            input,
            settings,
            results: None,
            last_trace: Mutex::new(None),
        })
    }

    /// Write the trace to a fresh file named by `settings`.
    pub fn with_results(mut self, settings: FileSettings) -> Self {
        self.results = Some(settings);
        self
    }

    /// Trace of the last run.
    pub fn last_trace(&self) -> Option<TimeSeriesTrace> {
        self.last_trace.lock().clone()
    }

    /// Run every step, or until cancelled.
    pub async fn execute(&self, ctx: &RoutineContext) -> AppResult<TimeSeriesTrace> {
        let buffered = self
            .input
            .as_buffered()
            .ok_or_else(|| LabError::Configuration(format!("input '{}' is not buffered", self.input.label())))?;

        let mut samples = Vec::new();
        let mut step_starts = Vec::with_capacity(self.settings.steps.len());
        let mut completed = true;

        for (step, values) in self.settings.steps.iter().enumerate() {
            if ctx.is_cancelled() {
                completed = false;
                break;
            }
            step_starts.push(samples.len());
            for (output, &value) in self.outputs.iter().zip(values) {
                set_output(ctx, output, value, ValueUpdate::MoveKnobs, false).await?;
            }
            buffered.restart_buffer().await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.step_duration) => {}
                _ = ctx.cancelled() => {}
            }
            let collected = buffered.get_buffer(false).await;
            info!(routine = %self.name, step, samples = collected.len(), "time series step done");
            samples.extend(collected);
        }
        buffered.clear_buffer(true).await;

        {
            let samples = samples.clone();
            let step_starts = step_starts.clone();
            let posted = ctx.ui().post(Box::new(move |surface: &mut dyn super::ui::UiSurface| {
                surface.show_time_series(samples, step_starts)
            }));
            if let Err(e) = posted {
                warn!(routine = %self.name, error = %e, "could not show time series");
            }
        }

        let path = match &self.results {
            Some(settings) => Some(self.write_trace(settings, &samples, &step_starts)?),
            None => None,
        };

        let trace = TimeSeriesTrace {
            samples,
            step_starts,
            completed,
            path,
        };
        *self.last_trace.lock() = Some(trace.clone());
        Ok(trace)
    }

    fn write_trace(&self, settings: &FileSettings, samples: &[f64], step_starts: &[usize]) -> AppResult<PathBuf> {
        let path = settings.generate_path()?;
        let mut writer = ResultsWriter::create_new(&path, &["sample", "step"], "value")?;
        let mut step = 0usize;
        for (index, &value) in samples.iter().enumerate() {
            while step + 1 < step_starts.len() && step_starts[step + 1] <= index {
                step += 1;
            }
            writer.append(&[index as f64, step as f64], value)?;
        }
        writer.finish()
    }
}

#[async_trait]
impl Routine for TimeSeries {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: RoutineContext) -> AppResult<()> {
        let trace = self.execute(&ctx).await?;
        info!(
            routine = %self.name,
            samples = trace.samples.len(),
            completed = trace.completed,
            "time series finished"
        );
        Ok(())
    }
}
