//! RBD Instruments 9103 USB picoammeter.
//!
//! Streaming is started with `&I<ms>` (sample interval, four digits) and stopped
//! with `&I0000`. While streaming, every sample arrives as
//!
//! ```text
//! &S,<range>,<value>,<unit>A
//! ```
//!
//! where `<unit>` is `n`, `u` or `m`. Samples are rescaled to the configured
//! [`CurrentUnit`].

use super::SampleSource;
use crate::adapters::Adapter;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Baud rate of the 9103 USB interface.
pub const BAUD_RATE: u32 = 57_600;

/// Longest sample line the device sends, in bytes.
pub const MAX_RESPONSE_SIZE: f64 = 25.0;

/// Size of the USB driver receive buffer, in bytes.
pub const BUFFER_CAPACITY: f64 = 1020.0;

/// Unit samples are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentUnit {
    /// Nanoampere
    #[default]
    Nano,
    /// Microampere
    Micro,
    /// Milliampere
    Milli,
}

impl CurrentUnit {
    fn exponent(self) -> i32 {
        match self {
            CurrentUnit::Nano => 9,
            CurrentUnit::Micro => 6,
            CurrentUnit::Milli => 3,
        }
    }
}

/// Streaming picoammeter.
pub struct Rbd9103 {
    name: String,
    sample_rate: f64,
    unit: CurrentUnit,
    adapter: Box<dyn Adapter>,
}

impl Rbd9103 {
    /// Create a driver sampling at `sample_rate` Hz (at most 1 kHz).
    pub fn new(
        name: impl Into<String>,
        sample_rate: f64,
        unit: CurrentUnit,
        adapter: Box<dyn Adapter>,
    ) -> AppResult<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(LabError::Configuration(format!(
                "picoammeter sample rate must be positive, got {}",
                sample_rate
            )));
        }
        Ok(Self {
            name: name.into(),
            sample_rate,
            unit,
            adapter,
        })
    }

    /// Warn when `pull_rate` is too slow to keep the USB buffer from overflowing.
    pub fn check_pull_rate(&self, pull_rate: f64) {
        if MAX_RESPONSE_SIZE * self.sample_rate / pull_rate > BUFFER_CAPACITY {
            warn!(
                driver = %self.name,
                sample_rate = self.sample_rate,
                pull_rate,
                "USB buffer risks overflowing; increase the pull rate"
            );
        }
    }

    /// Interval command for the configured sample rate.
    pub fn interval_command(&self) -> String {
        let interval_ms = ((1000.0 / self.sample_rate).round() as u32).clamp(1, 9999);
        format!("&I{:04}", interval_ms)
    }

    /// Decode one sample line to the configured unit.
    pub fn parse_sample(&self, line: &str) -> Option<f64> {
        let start = line.find('&')?;
        let message = line[start..].trim();
        if !message.ends_with('A') {
            return None;
        }
        let fields: Vec<&str> = message.split(',').collect();
        let [_, _, value, unit] = fields.as_slice() else {
            return None;
        };
        let value: f64 = value.trim().parse().ok()?;
        let scale = match unit.chars().next()? {
            'n' => -9,
            'm' => -3,
            _ => -6,
        };
        Some(value * 10f64.powi(self.unit.exponent() + scale))
    }
}

#[async_trait]
impl SampleSource for Rbd9103 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> AppResult<()> {
        let command = self.interval_command();
        debug!(driver = %self.name, %command, "starting picoammeter stream");
        self.adapter.write_line(&command).await
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.adapter.write_line("&I0000").await
    }

    async fn read_samples(&mut self) -> AppResult<Vec<f64>> {
        let lines = self.adapter.read_lines().await?;
        Ok(lines
            .iter()
            .filter_map(|line| {
                let sample = self.parse_sample(line);
                if sample.is_none() {
                    warn!(driver = %self.name, %line, "dropping malformed picoammeter line");
                }
                sample
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn meter(unit: CurrentUnit, adapter: &MockAdapter) -> Rbd9103 {
        Rbd9103::new("pA", 100.0, unit, Box::new(adapter.clone())).unwrap()
    }

    #[tokio::test]
    async fn start_and_stop_send_interval_commands() {
        let adapter = MockAdapter::new();
        let mut rbd = meter(CurrentUnit::Nano, &adapter);
        rbd.start().await.unwrap();
        rbd.stop().await.unwrap();
        assert_eq!(adapter.written(), vec!["&I0010", "&I0000"]);
    }

    #[test]
    fn samples_are_rescaled_to_configured_unit() {
        let adapter = MockAdapter::new();
        let nano = meter(CurrentUnit::Nano, &adapter);
        assert_eq!(nano.parse_sample("&S,Range=2nA,1.5,nA"), Some(1.5));
        assert_eq!(nano.parse_sample("&S,Range=2uA,2,uA"), Some(2000.0));

        let milli = meter(CurrentUnit::Milli, &adapter);
        assert_eq!(milli.parse_sample("&S,Range=2mA,0.25,mA"), Some(0.25));
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped() {
        let adapter = MockAdapter::new();
        adapter.push_line("&S,Range=2nA,1.0,nA");
        adapter.push_line("&S,Range=2nA,oops,nA");
        adapter.push_line("noise");
        adapter.push_line("&S,Range=2nA,3.0,nA");
        let mut rbd = meter(CurrentUnit::Nano, &adapter);
        assert_eq!(rbd.read_samples().await.unwrap(), vec![1.0, 3.0]);
    }

    #[test]
    fn very_high_rates_use_shortest_interval() {
        let rbd = Rbd9103::new("pA", 5000.0, CurrentUnit::Nano, Box::new(MockAdapter::new())).unwrap();
        assert_eq!(rbd.interval_command(), "&I0001");
    }
}
