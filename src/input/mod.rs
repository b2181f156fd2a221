//! Inputs: single-value reads and buffered sample streams.
//!
//! A [`BufferedInput`] decouples the rate at which a device produces samples
//! from the rate at which consumers look at them. A background pull task
//! drains the [`SampleSource`] `pull_rate` times per second into an internal
//! buffer; consumers take the accumulated samples with
//! [`BufferedInput::clear_buffer`] whenever they like. Without a pull task the
//! device is read on demand.
//!
//! Buffering can be switched off (`clear_buffer(true)`); the input then only
//! tracks the latest sample.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{AppResult, LabError};
use crate::instrument::SampleSource;

/// Anything that can be read as a single value.
#[async_trait]
pub trait Input: Send + Sync {
    /// Display label, also used as the results-file column name.
    fn label(&self) -> &str;

    /// Buffered view of this input, if it has one.
    fn as_buffered(&self) -> Option<&BufferedInput> {
        None
    }

    /// Most recent value.
    async fn read(&self) -> AppResult<f64>;
}

#[derive(Debug, Default)]
struct BufferState {
    buffer: Option<Vec<f64>>,
    latest: f64,
}

/// Sample source with a drainable buffer and an optional background pull task.
pub struct BufferedInput {
    label: String,
    source: tokio::sync::Mutex<Box<dyn SampleSource>>,
    state: Mutex<BufferState>,
    pull_on_buffer_read: bool,
    pull_task: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedInput {
    /// Wrap `source`. `buffering` selects whether samples are kept from the start.
    pub fn new(
        label: impl Into<String>,
        source: Box<dyn SampleSource>,
        buffering: bool,
        pull_on_buffer_read: bool,
    ) -> Self {
        Self {
            label: label.into(),
            source: tokio::sync::Mutex::new(source),
            state: Mutex::new(BufferState {
                buffer: buffering.then(Vec::new),
                latest: 0.0,
            }),
            pull_on_buffer_read,
            pull_task: Mutex::new(None),
        }
    }

    /// Start the device and, with `pull_rate` (Hz), the background pull task.
    pub async fn open(self: &Arc<Self>, pull_rate: Option<f64>) -> AppResult<()> {
        self.source.lock().await.start().await?;

        if let Some(rate) = pull_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(LabError::Configuration(format!(
                    "pull rate of '{}' must be positive, got {}",
                    self.label, rate
                )));
            }
            let period = Duration::from_secs_f64(1.0 / rate);
            let handle = tokio::spawn(pull_loop(Arc::downgrade(self), period));
            if let Some(previous) = self.pull_task.lock().replace(handle) {
                previous.abort();
            }
        }
        info!(input = %self.label, ?pull_rate, "input opened");
        Ok(())
    }

    /// Stop the pull task and the device.
    pub async fn close(&self) -> AppResult<()> {
        if let Some(task) = self.pull_task.lock().take() {
            task.abort();
        }
        self.source.lock().await.stop().await?;
        info!(input = %self.label, "input closed");
        Ok(())
    }

    /// Whether samples are currently being kept.
    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffer.is_some()
    }

    /// Most recent sample, or 0 before any arrived.
    pub fn latest(&self) -> f64 {
        self.state.lock().latest
    }

    /// Start keeping samples. No-op when already buffering.
    pub fn start_buffer(&self) {
        let mut state = self.state.lock();
        if state.buffer.is_none() {
            state.buffer = Some(Vec::new());
        }
    }

    /// Discard everything buffered so far and keep buffering from now on.
    pub async fn restart_buffer(&self) {
        let discarded = self.clear_buffer(false).await;
        debug!(input = %self.label, discarded = discarded.len(), "buffer restarted");
        self.start_buffer();
    }

    /// Copy of the buffer. Reads the device first when `force_poll` is set or
    /// the input pulls on every buffer read.
    pub async fn get_buffer(&self, force_poll: bool) -> Vec<f64> {
        if force_poll || self.pull_on_buffer_read {
            self.update_buffer().await;
        }
        self.state.lock().buffer.clone().unwrap_or_default()
    }

    /// Take the buffer, leaving it empty (or switched off when `stop` is set).
    pub async fn clear_buffer(&self, stop: bool) -> Vec<f64> {
        if self.pull_on_buffer_read {
            self.update_buffer().await;
        }
        let mut state = self.state.lock();
        let replacement = match (&state.buffer, stop) {
            (Some(_), false) => Some(Vec::new()),
            _ => None,
        };
        std::mem::replace(&mut state.buffer, replacement).unwrap_or_default()
    }

    /// Pull whatever the device has produced into the buffer.
    ///
    /// Device errors are logged and treated as an empty read.
    pub async fn update_buffer(&self) {
        let samples = {
            let mut source = self.source.lock().await;
            match source.read_samples().await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(input = %self.label, error = %e, "failed to read samples");
                    Vec::new()
                }
            }
        };
        if samples.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(&last) = samples.last() {
            state.latest = last;
        }
        if let Some(buffer) = state.buffer.as_mut() {
            buffer.extend(samples);
        }
    }

    fn has_pull_task(&self) -> bool {
        self.pull_task.lock().is_some()
    }
}

async fn pull_loop(input: Weak<BufferedInput>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(input) = input.upgrade() else {
            break;
        };
        input.update_buffer().await;
    }
}

impl Drop for BufferedInput {
    fn drop(&mut self) {
        if let Some(task) = self.pull_task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Input for BufferedInput {
    fn label(&self) -> &str {
        &self.label
    }

    fn as_buffered(&self) -> Option<&BufferedInput> {
        Some(self)
    }

    async fn read(&self) -> AppResult<f64> {
        if !self.has_pull_task() {
            self.update_buffer().await;
        }
        Ok(self.latest())
    }
}

/// Input read on demand, without a buffer.
pub struct PolledInput {
    label: String,
    source: tokio::sync::Mutex<Box<dyn SampleSource>>,
    latest: Mutex<f64>,
}

impl PolledInput {
    /// Wrap `source`.
    pub fn new(label: impl Into<String>, source: Box<dyn SampleSource>) -> Self {
        Self {
            label: label.into(),
            source: tokio::sync::Mutex::new(source),
            latest: Mutex::new(0.0),
        }
    }

    /// Start the device.
    pub async fn open(&self) -> AppResult<()> {
        self.source.lock().await.start().await
    }

    /// Stop the device.
    pub async fn close(&self) -> AppResult<()> {
        self.source.lock().await.stop().await
    }
}

#[async_trait]
impl Input for PolledInput {
    fn label(&self) -> &str {
        &self.label
    }

    async fn read(&self) -> AppResult<f64> {
        let samples = self.source.lock().await.read_samples().await?;
        let mut latest = self.latest.lock();
        if let Some(&last) = samples.last() {
            *latest = last;
        }
        Ok(*latest)
    }
}
