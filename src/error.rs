//! Custom error types for the application.
//!
//! This module defines the primary error type, `LabError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the errors that can occur, from configuration and I/O problems to instrument and
//! sweep precondition failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction errors and semantic
//!   validation errors found after parsing (unknown output keys, bad ranges).
//! - **`Io`** / **`Csv`**: file and serial I/O, results-file reading and writing.
//! - **`Calibration`**: invalid calibration tables or values outside the calibrated domain.
//! - **`Instrument`**: anything reported by a device driver or its transport.
//! - **`EmptyAxis`** / **`ResultsFileExists`**: sweep preconditions. Both are raised before
//!   any hardware write happens.
//! - **`RoutineBusy`**: a second start of a routine that is still running.
//!
//! Clamped outputs and cancelled sweeps are deliberately *not* errors; see
//! [`crate::output::InvalidOutput`] and [`crate::routine::grid_search::SweepOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("No valid output could be set for '{0}' with the current limits and calibration")]
    NoValidOutput(String),

    #[error("Sweep axis '{0}' has no values")]
    EmptyAxis(String),

    #[error("Results file already exists: {}", .0.display())]
    ResultsFileExists(PathBuf),

    #[error("Malformed results file: {0}")]
    ResultsFormat(String),

    #[error("Routine '{0}' is already running")]
    RoutineBusy(String),

    #[error("UI thread is no longer receiving jobs")]
    UiDisconnected,
}

impl From<figment::Error> for LabError {
    fn from(err: figment::Error) -> Self {
        LabError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::Instrument("picoammeter timed out".to_string());
        assert_eq!(err.to_string(), "Instrument error: picoammeter timed out");
    }

    #[test]
    fn test_results_file_exists_names_path() {
        let err = LabError::ResultsFileExists(PathBuf::from("results/grid.csv"));
        assert!(err.to_string().contains("results/grid.csv"));
    }
}
