//! Device driver traits and the concrete drivers for the lab's hardware.
//!
//! Drivers are deliberately dumb: an [`OutputDriver`] writes one control value,
//! a [`SampleSource`] hands back whatever samples arrived since the last call.
//! Clamping, calibration and buffering live one level up in
//! [`crate::output::Output`] and [`crate::input::BufferedInput`].

pub mod caen_r1419;
pub mod mock;
pub mod pico_dac;
pub mod rbd_9103;
pub mod rs3005p;
pub mod serial_float;

pub use caen_r1419::CaenR1419;
pub use mock::{MockOutputDriver, MockSampleSource};
pub use pico_dac::PicoDac;
pub use rbd_9103::{CurrentUnit, Rbd9103};
pub use rs3005p::Rs3005p;
pub use serial_float::SerialFloatSource;

use crate::error::AppResult;
use async_trait::async_trait;

/// A device that accepts a single control value.
#[async_trait]
pub trait OutputDriver: Send {
    /// Human-readable driver name used in logs.
    fn name(&self) -> &str;

    /// Inclusive range of control values the hardware accepts, if limited.
    fn control_range(&self) -> Option<(f64, f64)> {
        None
    }

    /// Whether the device can report back the value it actually applied.
    fn has_feedback(&self) -> bool {
        false
    }

    /// Send `control` to the hardware. Returns once the command is written.
    async fn write(&mut self, control: f64) -> AppResult<()>;

    /// Put the device in a safe state before disconnecting.
    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// A device that produces a stream of samples.
#[async_trait]
pub trait SampleSource: Send {
    /// Human-readable source name used in logs.
    fn name(&self) -> &str;

    /// Begin producing samples.
    async fn start(&mut self) -> AppResult<()>;

    /// Stop producing samples.
    async fn stop(&mut self) -> AppResult<()>;

    /// All samples produced since the previous call. May be empty.
    async fn read_samples(&mut self) -> AppResult<Vec<f64>>;
}
