//! RS PRO RS3005P bench power supply.
//!
//! Control and target are both the channel voltage. The supply accepts
//! setpoints with two decimals: `VSET1:05.00`.

use super::OutputDriver;
use crate::adapters::Adapter;
use crate::error::AppResult;
use async_trait::async_trait;
use tracing::debug;

/// Highest voltage the supply can produce.
pub const MAX_VOLTAGE: f64 = 30.0;

/// Baud rate of the RS3005P USB interface.
pub const BAUD_RATE: u32 = 9600;

/// Voltage-controlled RS3005P channel.
pub struct Rs3005p {
    name: String,
    channel: u8,
    adapter: Box<dyn Adapter>,
}

impl Rs3005p {
    /// Drive `channel` (1 on the single-channel model) through `adapter`.
    pub fn new(name: impl Into<String>, channel: u8, adapter: Box<dyn Adapter>) -> Self {
        Self {
            name: name.into(),
            channel,
            adapter,
        }
    }

    /// Clamp a configured voltage limit to what the supply supports.
    pub fn clamp_limit(limit: Option<f64>) -> f64 {
        match limit {
            Some(limit) if limit <= MAX_VOLTAGE => limit,
            _ => MAX_VOLTAGE,
        }
    }

    fn command(&self, volts: f64) -> String {
        format!("VSET{}:{:05.2}", self.channel, volts)
    }
}

#[async_trait]
impl OutputDriver for Rs3005p {
    fn name(&self) -> &str {
        &self.name
    }

    fn control_range(&self) -> Option<(f64, f64)> {
        Some((0.0, MAX_VOLTAGE))
    }

    async fn write(&mut self, control: f64) -> AppResult<()> {
        let command = self.command(control);
        debug!(driver = %self.name, %command, "setting voltage");
        self.adapter.write_line(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[tokio::test]
    async fn writes_vset_with_two_decimals() {
        let adapter = MockAdapter::new();
        let mut psu = Rs3005p::new("psu", 1, Box::new(adapter.clone()));
        psu.write(5.0).await.unwrap();
        psu.write(12.346).await.unwrap();
        assert_eq!(adapter.written(), vec!["VSET1:05.00", "VSET1:12.35"]);
    }

    #[test]
    fn limit_never_exceeds_supply_maximum() {
        assert_eq!(Rs3005p::clamp_limit(None), 30.0);
        assert_eq!(Rs3005p::clamp_limit(Some(45.0)), 30.0);
        assert_eq!(Rs3005p::clamp_limit(Some(12.0)), 12.0);
    }
}
