//! Mock devices
//!
//! Simulated drivers for running sweeps without hardware. Both use tokio's
//! clock, so tests with paused time see deterministic sample counts.
//!
//! - `MockOutputDriver` - records every control value it is asked to write
//! - `MockSampleSource` - produces samples at a fixed rate from a generator

use super::{OutputDriver, SampleSource};
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Output driver that remembers what was written to it.
#[derive(Clone, Default)]
pub struct MockOutputDriver {
    name: String,
    control_range: Option<(f64, f64)>,
    writes: Arc<Mutex<Vec<f64>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl MockOutputDriver {
    /// Create an unlimited mock output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Limit the accepted control values, like a DAC would.
    pub fn with_control_range(mut self, min: f64, max: f64) -> Self {
        self.control_range = Some((min, max));
        self
    }

    /// Shared handle to the list of written control values.
    pub fn writes(&self) -> Arc<Mutex<Vec<f64>>> {
        Arc::clone(&self.writes)
    }

    /// Shared count of `shutdown` calls.
    pub fn shutdowns(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.shutdowns)
    }
}

#[async_trait]
impl OutputDriver for MockOutputDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn control_range(&self) -> Option<(f64, f64)> {
        self.control_range
    }

    async fn write(&mut self, control: f64) -> AppResult<()> {
        if let Some((min, max)) = self.control_range {
            if control < min || control > max {
                return Err(LabError::Instrument(format!(
                    "{}: control value {} outside [{}, {}]",
                    self.name, control, min, max
                )));
            }
        }
        self.writes.lock().push(control);
        Ok(())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Generator = Box<dyn FnMut(u64) -> f64 + Send>;

/// Sample source producing `rate` samples per second.
///
/// The `n`th sample since start is `generator(n)`. The default generator is
/// a ramp `n % modulus`.
pub struct MockSampleSource {
    name: String,
    rate: f64,
    generator: Generator,
    started_at: Option<Instant>,
    next_index: u64,
}

impl MockSampleSource {
    /// Ramp source: sample `n` is `n % modulus`.
    pub fn ramp(rate: f64, modulus: u64) -> Self {
        let modulus = modulus.max(1);
        Self::from_fn(rate, move |n| (n % modulus) as f64)
    }

    /// Source whose `n`th sample is computed by `generator`.
    pub fn from_fn(rate: f64, generator: impl FnMut(u64) -> f64 + Send + 'static) -> Self {
        Self {
            name: "mock input".to_string(),
            rate,
            generator: Box::new(generator),
            started_at: None,
            next_index: 0,
        }
    }

    /// Rename the source.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl SampleSource for MockSampleSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> AppResult<()> {
        self.started_at = Some(Instant::now());
        self.next_index = 0;
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.started_at = None;
        Ok(())
    }

    async fn read_samples(&mut self) -> AppResult<Vec<f64>> {
        let Some(started_at) = self.started_at else {
            return Ok(Vec::new());
        };
        let due = (started_at.elapsed().as_secs_f64() * self.rate + 1e-9).floor() as u64;
        let samples = (self.next_index..due).map(|n| (self.generator)(n)).collect();
        self.next_index = self.next_index.max(due);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn output_driver_records_writes_and_enforces_range() {
        let mut driver = MockOutputDriver::new("dac").with_control_range(0.0, 1.0);
        let writes = driver.writes();
        driver.write(0.25).await.unwrap();
        assert!(driver.write(1.5).await.is_err());
        assert_eq!(*writes.lock(), vec![0.25]);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_produces_samples_at_rate() {
        let mut source = MockSampleSource::ramp(10.0, 3);
        assert!(source.read_samples().await.unwrap().is_empty());

        source.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(source.read_samples().await.unwrap(), vec![0.0, 1.0, 2.0, 0.0, 1.0]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.read_samples().await.unwrap(), vec![2.0, 0.0]);

        source.stop().await.unwrap();
        assert!(source.read_samples().await.unwrap().is_empty());
    }
}
