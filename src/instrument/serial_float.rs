use super::SampleSource;
use crate::adapters::Adapter;
use crate::error::AppResult;
use async_trait::async_trait;
use tracing::warn;

/// Source that streams one decimal number per line, such as the Pico ADC firmware.
///
/// A batch with any unparseable line is discarded whole.
pub struct SerialFloatSource {
    name: String,
    adapter: Box<dyn Adapter>,
}

impl SerialFloatSource {
    /// Read samples from `adapter`.
    pub fn new(name: impl Into<String>, adapter: Box<dyn Adapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
        }
    }
}

#[async_trait]
impl SampleSource for SerialFloatSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_samples(&mut self) -> AppResult<Vec<f64>> {
        let lines = self.adapter.read_lines().await?;
        let parsed: Result<Vec<f64>, _> = lines.iter().map(|line| line.parse::<f64>()).collect();
        match parsed {
            Ok(samples) => Ok(samples),
            Err(_) => {
                warn!(source = %self.name, points = lines.len(), "discarding corrupted batch");
                Ok(Vec::new())
            }
        }
    }
}
