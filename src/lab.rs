//! The connected lab: every configured output and the input, opened and
//! ready to be driven by routines or the control panel.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::adapters::{ports, Adapter, SerialAdapter};
use crate::calibration::{Calibration, InterpolCalibration, LinearCalibration};
use crate::config::{
    CalibrationSettings, DriverSettings, InputSettings, OutputSettings, Settings, SourceSettings, AUTO_PORT,
};
use crate::error::{AppResult, LabError};
use crate::input::{BufferedInput, Input};
use crate::instrument::{
    caen_r1419, pico_dac, rbd_9103, rs3005p, CaenR1419, MockOutputDriver, MockSampleSource, OutputDriver, PicoDac,
    Rbd9103, Rs3005p, SampleSource, SerialFloatSource,
};
use crate::output::{Output, OutputLimits};
use crate::routine::grid_search::{Device, GridSearch};
use crate::routine::time_series::TimeSeries;

/// Open hardware plus the settings it was built from.
pub struct Lab {
    settings: Settings,
    outputs: BTreeMap<String, Arc<Output>>,
    input: Arc<BufferedInput>,
}

impl Lab {
    /// Build and open every device in `settings`.
    ///
    /// A port of `"auto"` is looked up among the connected USB devices.
    pub async fn connect(settings: &Settings) -> AppResult<Self> {
        let mut outputs = BTreeMap::new();
        for (key, output) in &settings.outputs {
            let label = settings.output_label(key).to_string();
            match build_output(&label, output).await {
                Ok(built) => {
                    info!(output = %key, %label, "output connected");
                    outputs.insert(key.clone(), Arc::new(built));
                }
                Err(e) => {
                    warn!(output = %key, error = %e, "output failed to connect");
                    shutdown_outputs(&outputs).await;
                    return Err(e);
                }
            }
        }
        let input = match open_input(&settings.input).await {
            Ok(input) => input,
            Err(e) => {
                warn!(input = %settings.input.label, error = %e, "input failed to open");
                shutdown_outputs(&outputs).await;
                return Err(e);
            }
        };

        Ok(Self {
            settings: settings.clone(),
            outputs,
            input,
        })
    }

    /// Settings the lab was built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Output stored under `key`.
    pub fn output(&self, key: &str) -> Option<&Arc<Output>> {
        self.outputs.get(key)
    }

    /// All outputs, by key.
    pub fn outputs(&self) -> &BTreeMap<String, Arc<Output>> {
        &self.outputs
    }

    /// The measured input.
    pub fn input(&self) -> &Arc<BufferedInput> {
        &self.input
    }

    fn require_output(&self, key: &str) -> AppResult<Arc<Output>> {
        self.outputs
            .get(key)
            .cloned()
            .ok_or_else(|| LabError::Configuration(format!("unknown output '{}'", key)))
    }

    /// Grid search over the configured axes.
    pub fn grid_search(&self) -> AppResult<GridSearch> {
        let devices = self
            .settings
            .axes
            .iter()
            .map(|axis| {
                Ok(Device::new(self.require_output(&axis.output)?, axis.values.expand()?, axis.settle)
                    .with_bidirectional(axis.bidirectional))
            })
            .collect::<AppResult<Vec<_>>>()?;

        let input: Arc<dyn Input> = self.input.clone();
        let mut search = GridSearch::new(devices, input, self.settings.sweep.clone())?;
        if let Some(results) = &self.settings.results {
            search = search.with_results(results.clone());
        }
        if let Some(heatmap) = &self.settings.heatmap {
            search = search.with_heatmap(heatmap.clone());
        }
        Ok(search)
    }

    /// The configured time series, if any.
    pub fn time_series(&self) -> AppResult<Option<TimeSeries>> {
        let Some(config) = &self.settings.time_series else {
            return Ok(None);
        };
        let outputs = config
            .outputs
            .iter()
            .map(|key| self.require_output(key))
            .collect::<AppResult<Vec<_>>>()?;
        let input: Arc<dyn Input> = self.input.clone();
        let mut series = TimeSeries::new(outputs, input, config.routine_settings())?;
        if let Some(results) = &config.results {
            series = series.with_results(results.clone());
        }
        Ok(Some(series))
    }

    /// Put every output in its safe state and stop the input.
    ///
    /// Failures are logged and do not stop the remaining devices from shutting down.
    pub async fn shutdown(&self) {
        shutdown_outputs(&self.outputs).await;
        if let Err(e) = self.input.close().await {
            error!(input = %self.input.label(), error = %e, "input shutdown failed");
        }
        info!("lab disconnected");
    }
}

/// Put every output in its safe state, logging failures.
async fn shutdown_outputs(outputs: &BTreeMap<String, Arc<Output>>) {
    for (key, output) in outputs {
        if let Err(e) = output.shutdown().await {
            error!(output = %key, error = %e, "output shutdown failed");
        }
    }
}

fn resolve_port(port: &str, device_key: &str) -> AppResult<String> {
    if port.eq_ignore_ascii_case(AUTO_PORT) {
        let found = ports::port_of(device_key)?;
        info!(device = device_key, port = %found, "port discovered");
        Ok(found)
    } else {
        Ok(port.to_string())
    }
}

fn open_serial(port: &str, device_key: &str, baud_rate: u32, terminator: &str, xon_xoff: bool) -> AppResult<Box<dyn Adapter>> {
    let port = resolve_port(port, device_key)?;
    let mut adapter = SerialAdapter::new(port, baud_rate)
        .with_line_terminator(terminator)
        .with_xon_xoff(xon_xoff);
    adapter.open()?;
    Ok(Box::new(adapter))
}

fn build_calibration(settings: &CalibrationSettings) -> AppResult<Arc<dyn Calibration>> {
    Ok(match settings {
        CalibrationSettings::Linear { factor, units } => Arc::new(LinearCalibration::new(*factor, units.clone())?),
        CalibrationSettings::Interpolated {
            file,
            extrapolate,
            units,
        } => Arc::new(InterpolCalibration::from_file(file, *extrapolate, units.clone())?),
    })
}

async fn build_output(label: &str, settings: &OutputSettings) -> AppResult<Output> {
    let calibration = build_calibration(&settings.calibration)?;
    let mut target_limit = settings.target_limit;

    let driver: Box<dyn OutputDriver> = match &settings.driver {
        DriverSettings::Mock { control_range } => {
            let driver = MockOutputDriver::new(label);
            Box::new(match control_range {
                Some((min, max)) => driver.with_control_range(*min, *max),
                None => driver,
            })
        }
        DriverSettings::Rs3005p { port, channel } => {
            target_limit = Some(Rs3005p::clamp_limit(target_limit));
            let adapter = open_serial(port, "rs", rs3005p::BAUD_RATE, "\n", false)?;
            Box::new(Rs3005p::new(label, *channel, adapter))
        }
        DriverSettings::PicoDac { port, bits } => {
            let adapter = open_serial(port, "pico", pico_dac::BAUD_RATE, "\n", false)?;
            Box::new(PicoDac::new(label, *bits, adapter)?)
        }
        DriverSettings::CaenR1419 { port, channel } => {
            let adapter = open_serial(port, "caen", caen_r1419::BAUD_RATE, "\r\n", true)?;
            let mut caen = CaenR1419::new(label, *channel, adapter)?;
            caen.identify().await?;
            Box::new(caen)
        }
    };

    let output = Output::new(label, driver, calibration, OutputLimits::with_target_max(target_limit));
    output.add_invalid_output_handler(|event| warn!(%event, "invalid output"));
    Ok(output)
}

async fn open_input(settings: &InputSettings) -> AppResult<Arc<BufferedInput>> {
    let source: Box<dyn SampleSource> = match &settings.source {
        SourceSettings::Mock { rate, modulus } => {
            Box::new(MockSampleSource::ramp(*rate, *modulus).with_name(settings.label.clone()))
        }
        SourceSettings::Rbd9103 { port, sample_rate, unit } => {
            let adapter = open_serial(port, "rbd", rbd_9103::BAUD_RATE, "\r\n", false)?;
            let rbd = Rbd9103::new(settings.label.clone(), *sample_rate, *unit, adapter)?;
            if let Some(pull_rate) = settings.pull_rate {
                rbd.check_pull_rate(pull_rate);
            }
            Box::new(rbd)
        }
        SourceSettings::SerialFloat { port, baud_rate } => {
            let adapter = open_serial(port, "pico", *baud_rate, "\n", false)?;
            Box::new(SerialFloatSource::new(settings.label.clone(), adapter))
        }
    };

    let input = Arc::new(BufferedInput::new(
        settings.label.clone(),
        source,
        settings.buffering,
        settings.pull_on_buffer_read,
    ));
    input.open(settings.pull_rate).await?;
    Ok(input)
}
