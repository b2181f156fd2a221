//! Raspberry Pi Pico running a DAC firmware.
//!
//! The control signal is the DAC fraction in `0..=1`. It is discretised to the
//! DAC resolution and sent as a decimal integer code, one per line.

use super::OutputDriver;
use crate::adapters::Adapter;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use tracing::debug;

/// Baud rate of the Pico USB CDC interface.
pub const BAUD_RATE: u32 = 115_200;

/// DAC output behind a Pico.
pub struct PicoDac {
    name: String,
    bits: u32,
    adapter: Box<dyn Adapter>,
}

impl PicoDac {
    /// Create a driver for a `bits`-bit DAC (1..=32).
    pub fn new(name: impl Into<String>, bits: u32, adapter: Box<dyn Adapter>) -> AppResult<Self> {
        if !(1..=32).contains(&bits) {
            return Err(LabError::Configuration(format!(
                "DAC resolution must be 1-32 bits, got {}",
                bits
            )));
        }
        Ok(Self {
            name: name.into(),
            bits,
            adapter,
        })
    }

    /// Integer code for a control fraction.
    pub fn code(&self, control: f64) -> u64 {
        let full_scale = ((1u64 << self.bits) - 1) as f64;
        (control.clamp(0.0, 1.0) * full_scale).round() as u64
    }
}

#[async_trait]
impl OutputDriver for PicoDac {
    fn name(&self) -> &str {
        &self.name
    }

    fn control_range(&self) -> Option<(f64, f64)> {
        Some((0.0, 1.0))
    }

    async fn write(&mut self, control: f64) -> AppResult<()> {
        let code = self.code(control);
        debug!(driver = %self.name, control, code, "writing DAC code");
        self.adapter.write_line(&code.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[tokio::test]
    async fn writes_discretised_code() {
        let adapter = MockAdapter::new();
        let mut dac = PicoDac::new("dac", 12, Box::new(adapter.clone())).unwrap();
        dac.write(0.0).await.unwrap();
        dac.write(0.5).await.unwrap();
        dac.write(1.0).await.unwrap();
        assert_eq!(adapter.written(), vec!["0", "2048", "4095"]);
    }

    #[test]
    fn rejects_silly_resolutions() {
        assert!(PicoDac::new("dac", 0, Box::new(MockAdapter::new())).is_err());
        assert!(PicoDac::new("dac", 33, Box::new(MockAdapter::new())).is_err());
    }
}
