//! Configuration loading using Figment
//!
//! Settings are layered, highest precedence last:
//! 1. Built-in defaults (a mock output and a mock input)
//! 2. The TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `LABSWEEP_`, `__` separating sections
//!
//! ```text
//! LABSWEEP_APPLICATION__LOG_LEVEL=debug
//! LABSWEEP_SWEEP__PLOT_EVERY=5
//! LABSWEEP_INPUT__PULL_RATE=20
//! ```
//!
//! Outputs are keyed by name; sweep axes and time-series columns refer to
//! those keys.
//!
//! ```toml
//! [outputs.hv]
//! label = "Extraction HV"
//! target_limit = 2000.0
//! driver = { kind = "caen_r1419", port = "auto", channel = 1 }
//! calibration = { kind = "linear", factor = 1.0 }
//!
//! [[axes]]
//! output = "hv"
//! values = { start = 0.0, stop = 1000.0, step = 250.0 }
//! settle = "500ms"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::calibration::Units;
use crate::data::heatmap::HeatmapSettings;
use crate::data::results::FileSettings;
use crate::error::{AppResult, LabError};
use crate::instrument::rbd_9103::CurrentUnit;
use crate::routine::grid_search::SweepSettings;
use crate::routine::time_series::TimeSeriesSettings;

/// Configuration file used when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "LABSWEEP_";

/// Port value that asks for USB discovery.
pub const AUTO_PORT: &str = "auto";

/// Most points a range axis may expand to.
pub const MAX_RANGE_POINTS: usize = 100_000;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Output devices by key
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSettings>,
    /// The measured input
    #[serde(default)]
    pub input: InputSettings,
    /// Grid-search measurement settings
    #[serde(default)]
    pub sweep: SweepSettings,
    /// Sweep axes, outermost first
    #[serde(default)]
    pub axes: Vec<AxisSettings>,
    /// Live heatmap of two-axis sweeps
    #[serde(default)]
    pub heatmap: Option<HeatmapSettings>,
    /// Where grid-search results are written
    #[serde(default)]
    pub results: Option<FileSettings>,
    /// Time-series routine
    #[serde(default)]
    pub time_series: Option<TimeSeriesConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Window title and log name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// One output device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Display label and results column name; the key when absent
    #[serde(default)]
    pub label: Option<String>,
    /// Hardware behind the output
    pub driver: DriverSettings,
    /// Target-to-control conversion
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Highest target that may be requested
    #[serde(default)]
    pub target_limit: Option<f64>,
}

/// Output hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverSettings {
    /// Simulated output
    Mock {
        /// Control range the mock pretends to accept
        #[serde(default)]
        control_range: Option<(f64, f64)>,
    },
    /// RS 3005P bench supply
    Rs3005p {
        /// Serial port, or "auto"
        #[serde(default = "default_auto_port")]
        port: String,
        /// Supply channel
        #[serde(default = "default_channel")]
        channel: u8,
    },
    /// DAC behind a Raspberry Pi Pico
    PicoDac {
        /// Serial port, or "auto"
        #[serde(default = "default_auto_port")]
        port: String,
        /// DAC resolution
        #[serde(default = "default_dac_bits")]
        bits: u32,
    },
    /// CAEN R1419ET HV supply
    CaenR1419 {
        /// Serial port, or "auto"
        #[serde(default = "default_auto_port")]
        port: String,
        /// Supply channel (0-3)
        #[serde(default)]
        channel: u8,
    },
}

impl DriverSettings {
    /// USB discovery key of the hardware, if it sits on a serial port.
    pub fn device_key(&self) -> Option<&'static str> {
        match self {
            DriverSettings::Mock { .. } => None,
            DriverSettings::Rs3005p { .. } => Some("rs"),
            DriverSettings::PicoDac { .. } => Some("pico"),
            DriverSettings::CaenR1419 { .. } => Some("caen"),
        }
    }
}

/// Target-to-control conversion of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationSettings {
    /// `target = control * factor`
    Linear {
        /// Conversion factor
        #[serde(default = "default_factor")]
        factor: f64,
        /// Unit names
        #[serde(default)]
        units: Units,
    },
    /// Piecewise-linear table read from a two-column CSV
    Interpolated {
        /// Calibration table (`target,control` rows)
        file: PathBuf,
        /// Extend the outermost segments past the table
        #[serde(default)]
        extrapolate: bool,
        /// Unit names
        #[serde(default)]
        units: Units,
    },
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings::Linear {
            factor: default_factor(),
            units: Units::default(),
        }
    }
}

/// The measured input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSettings {
    /// Display label and results column name
    #[serde(default = "default_input_label")]
    pub label: String,
    /// Keep samples from the moment the input opens
    #[serde(default)]
    pub buffering: bool,
    /// Background pull rate in Hz; `None` reads the device on demand
    #[serde(default = "default_pull_rate")]
    pub pull_rate: Option<f64>,
    /// Read the device on every buffer access
    #[serde(default)]
    pub pull_on_buffer_read: bool,
    /// Hardware behind the input
    #[serde(default)]
    pub source: SourceSettings,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            label: default_input_label(),
            buffering: false,
            pull_rate: default_pull_rate(),
            pull_on_buffer_read: false,
            source: SourceSettings::default(),
        }
    }
}

/// Input hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    /// Simulated ramp
    Mock {
        /// Samples per second
        #[serde(default = "default_mock_rate")]
        rate: f64,
        /// Ramp wraps around at this value
        #[serde(default = "default_mock_modulus")]
        modulus: u64,
    },
    /// RBD 9103 picoammeter
    Rbd9103 {
        /// Serial port, or "auto"
        #[serde(default = "default_auto_port")]
        port: String,
        /// Samples per second
        #[serde(default = "default_rbd_rate")]
        sample_rate: f64,
        /// Unit samples are reported in
        #[serde(default)]
        unit: CurrentUnit,
    },
    /// Any device printing one number per line
    SerialFloat {
        /// Serial port
        port: String,
        /// Baud rate
        #[serde(default = "default_float_baud")]
        baud_rate: u32,
    },
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings::Mock {
            rate: default_mock_rate(),
            modulus: default_mock_modulus(),
        }
    }
}

/// One grid-search axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Key of the output in `[outputs]`
    pub output: String,
    /// Target values
    pub values: AxisValues,
    /// Wait after changing this output
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Walk back in reverse instead of resetting after a pass
    #[serde(default = "default_true")]
    pub bidirectional: bool,
}

/// Values of an axis, explicit or as an inclusive range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValues {
    /// Exactly these values, in order
    List(Vec<f64>),
    /// `start`, `start + step`, ... up to and including `stop`
    Range {
        /// First value
        start: f64,
        /// Last value (included when reached)
        stop: f64,
        /// Increment, negative for descending ranges
        step: f64,
    },
}

impl AxisValues {
    /// The concrete value list.
    pub fn expand(&self) -> AppResult<Vec<f64>> {
        match *self {
            AxisValues::List(ref values) => Ok(values.clone()),
            AxisValues::Range { start, stop, step } => {
                let span = stop - start;
                let well_formed = [start, stop, step].iter().all(|v| v.is_finite())
                    && step != 0.0
                    && (span == 0.0 || span.signum() == step.signum());
                if !well_formed {
                    return Err(LabError::Configuration(format!(
                        "range from {} to {} in steps of {} is not well-formed",
                        start, stop, step
                    )));
                }
                let steps = (span / step + 1e-9).floor();
                if steps >= MAX_RANGE_POINTS as f64 {
                    return Err(LabError::Configuration(format!(
                        "range from {} to {} in steps of {} has more than {} points",
                        start, stop, step, MAX_RANGE_POINTS
                    )));
                }
                let count = steps as usize + 1;
                Ok((0..count).map(|i| start + i as f64 * step).collect())
            }
        }
    }
}

/// Time-series routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    /// Keys of the outputs set by every step
    pub outputs: Vec<String>,
    /// How long each step is held
    #[serde(default = "default_step_duration", with = "humantime_serde")]
    pub step_duration: Duration,
    /// One value per output for every step
    pub steps: Vec<Vec<f64>>,
    /// Where the trace is written
    #[serde(default)]
    pub results: Option<FileSettings>,
}

impl TimeSeriesConfig {
    /// Routine settings.
    pub fn routine_settings(&self) -> TimeSeriesSettings {
        TimeSeriesSettings {
            step_duration: self.step_duration,
            steps: self.steps.clone(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "Lab Sweep".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auto_port() -> String {
    AUTO_PORT.to_string()
}

fn default_channel() -> u8 {
    1
}

fn default_dac_bits() -> u32 {
    16
}

fn default_factor() -> f64 {
    1.0
}

fn default_input_label() -> String {
    "input".to_string()
}

fn default_pull_rate() -> Option<f64> {
    Some(10.0)
}

fn default_mock_rate() -> f64 {
    10.0
}

fn default_mock_modulus() -> u64 {
    1000
}

fn default_rbd_rate() -> f64 {
    10.0
}

fn default_float_baud() -> u32 {
    115_200
}

fn default_settle() -> Duration {
    Duration::from_millis(200)
}

fn default_step_duration() -> Duration {
    Duration::from_secs(2)
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "mock".to_string(),
            OutputSettings {
                label: Some("Mock output".to_string()),
                driver: DriverSettings::Mock { control_range: None },
                calibration: CalibrationSettings::default(),
                target_limit: Some(100.0),
            },
        );
        Self {
            application: ApplicationSettings::default(),
            outputs,
            input: InputSettings::default(),
            sweep: SweepSettings::default(),
            axes: Vec::new(),
            heatmap: None,
            results: None,
            time_series: None,
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Load defaults, the TOML file at `path` (or [`DEFAULT_CONFIG_PATH`]) and
    /// environment overrides, then validate.
    ///
    /// An explicitly given file must exist; a missing default file is skipped.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = match path {
            Some(path) if !path.exists() => {
                return Err(LabError::Configuration(format!(
                    "configuration file '{}' does not exist",
                    path.display()
                )))
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };
        let figment = Self::defaults()
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Defaults overlaid with a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::extract(Self::defaults().merge(Toml::string(toml)))
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Every axis and time-series column names a configured output
    /// - Axis ranges are well-formed
    /// - Time-series steps have one value per output
    /// - Rates and limits are positive
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(LabError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (key, output) in &self.outputs {
            if let Some(limit) = output.target_limit {
                if !limit.is_finite() || limit < 0.0 {
                    return Err(LabError::Configuration(format!(
                        "output '{}': target_limit must be non-negative, got {}",
                        key, limit
                    )));
                }
            }
        }

        if let Some(rate) = self.input.pull_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(LabError::Configuration(format!(
                    "input pull_rate must be positive, got {}",
                    rate
                )));
            }
        }

        for axis in &self.axes {
            self.require_output(&axis.output, "axis")?;
            axis.values.expand()?;
        }

        if let Some(series) = &self.time_series {
            for key in &series.outputs {
                self.require_output(key, "time series")?;
            }
            if let Some(step) = series.steps.iter().find(|s| s.len() != series.outputs.len()) {
                return Err(LabError::Configuration(format!(
                    "time series step {:?} needs {} values",
                    step,
                    series.outputs.len()
                )));
            }
        }
        Ok(())
    }

    fn require_output(&self, key: &str, user: &str) -> AppResult<()> {
        if self.outputs.contains_key(key) {
            Ok(())
        } else {
            Err(LabError::Configuration(format!(
                "{} refers to unknown output '{}'",
                user, key
            )))
        }
    }

    /// Display label of the output stored under `key`.
    pub fn output_label<'a>(&'a self, key: &'a str) -> &'a str {
        self.outputs
            .get(key)
            .and_then(|o| o.label.as_deref())
            .unwrap_or(key)
    }
}
