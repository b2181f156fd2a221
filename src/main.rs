//! lab_sweep - instrument control panel and measurement routines
//!
//! # Usage
//!
//! ```bash
//! # Control panel (default)
//! lab_sweep --config config/default.toml
//!
//! # Headless grid search over the configured axes; Ctrl-C cancels
//! lab_sweep run
//!
//! # Headless time series
//! lab_sweep time-series
//!
//! # Inspect a results file, optionally as a heatmap
//! lab_sweep load results/240307T1205_grid.csv --view
//!
//! # Show connected USB serial devices
//! lab_sweep ports --device caen
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::Array2;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lab_sweep::adapters::ports;
use lab_sweep::config::Settings;
use lab_sweep::data::heatmap::Heatmap;
use lab_sweep::data::results;
use lab_sweep::lab::Lab;
use lab_sweep::routine::handler::RoutineHandler;
use lab_sweep::routine::ui::{UiDispatcher, UiSurface};
use lab_sweep::routine::Routine;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: config/default.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the control panel
    Gui,

    /// Run the configured grid search without a window
    Run,

    /// Run the configured time series without a window
    TimeSeries,

    /// Print a results file
    Load {
        /// Results CSV written by a grid search
        file: PathBuf,

        /// Show the results as a heatmap
        #[arg(long)]
        view: bool,
    },

    /// List USB serial ports
    Ports {
        /// Only ports of this device (pico, rs, rbd, caen)
        #[arg(short, long)]
        device: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_logging(cli.log_level.as_deref().unwrap_or(&settings.application.log_level));

    match cli.command.unwrap_or(Commands::Gui) {
        Commands::Gui => run_gui(settings),
        Commands::Run => runtime()?.block_on(run_grid_search(settings)),
        Commands::TimeSeries => runtime()?.block_on(run_time_series(settings)),
        Commands::Load { file, view } => load_results(&file, view, &settings),
        Commands::Ports { device } => list_ports(device.as_deref()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn runtime() -> Result<Runtime> {
    Runtime::new().context("failed to start the tokio runtime")
}

#[cfg(feature = "gui")]
fn run_gui(settings: Settings) -> Result<()> {
    let runtime = runtime()?;
    let lab = Arc::new(
        runtime
            .block_on(Lab::connect(&settings))
            .context("failed to connect the lab")?,
    );
    info!(outputs = lab.outputs().len(), "starting control panel");

    let result = lab_sweep::gui::run(runtime.handle().clone(), Arc::clone(&lab));
    runtime.block_on(lab.shutdown());
    result.map_err(|e| anyhow!("control panel failed: {}", e))
}

#[cfg(not(feature = "gui"))]
fn run_gui(_settings: Settings) -> Result<()> {
    Err(anyhow!("built without the `gui` feature; use `run` or `time-series`"))
}

async fn run_grid_search(settings: Settings) -> Result<()> {
    let lab = Lab::connect(&settings).await.context("failed to connect the lab")?;
    let search = match lab.grid_search() {
        Ok(search) => Arc::new(search),
        Err(e) => {
            lab.shutdown().await;
            return Err(e).context("failed to set up the grid search");
        }
    };

    run_headless(search.clone()).await;

    match search.last_outcome() {
        Some(outcome) => {
            println!(
                "{} after {} of {} points",
                if outcome.completed { "Completed" } else { "Cancelled" },
                outcome.measurements,
                search.total_points()
            );
            if let Some(path) = outcome.results_path {
                println!("Results written to {}", path.display());
            }
        }
        None => println!("Grid search failed, see the log"),
    }
    lab.shutdown().await;
    Ok(())
}

async fn run_time_series(settings: Settings) -> Result<()> {
    let lab = Lab::connect(&settings).await.context("failed to connect the lab")?;
    let series = match lab.time_series() {
        Ok(Some(series)) => Arc::new(series),
        Ok(None) => {
            lab.shutdown().await;
            return Err(anyhow!("no [time_series] section in the configuration"));
        }
        Err(e) => {
            lab.shutdown().await;
            return Err(e).context("failed to set up the time series");
        }
    };

    run_headless(series.clone()).await;

    match series.last_trace() {
        Some(trace) => {
            println!("{} samples in {} steps", trace.samples.len(), trace.step_starts.len());
            if let Some(path) = trace.path {
                println!("Trace written to {}", path.display());
            }
        }
        None => println!("Time series failed, see the log"),
    }
    lab.shutdown().await;
    Ok(())
}

/// UI jobs of a headless run end up in the log.
struct Console;

impl UiSurface for Console {
    fn output_changed(&mut self, label: &str, target: f64, _move_knob: bool) {
        debug!(output = label, target, "output set");
    }

    fn show_heatmap(&mut self, heatmap: Heatmap) {
        debug!(rows = %heatmap.y_label(), columns = %heatmap.x_label(), "heatmap created");
    }

    fn update_heatmap(&mut self, data: Array2<f64>) {
        debug!(shape = ?data.dim(), "heatmap updated");
    }

    fn show_time_series(&mut self, samples: Vec<f64>, step_starts: Vec<usize>) {
        info!(samples = samples.len(), steps = step_starts.len(), "time series collected");
    }

    fn routine_started(&mut self, name: &str) {
        info!(routine = name, "started; press Ctrl-C to cancel");
    }

    fn routine_finished(&mut self, name: &str) {
        info!(routine = name, "finished");
    }
}

/// Run `routine` on this runtime, serving its UI jobs until it has finished.
async fn run_headless(routine: Arc<dyn Routine>) {
    let (ui, mut queue) = UiDispatcher::channel();
    let handler = RoutineHandler::new(routine, Handle::current(), ui);
    let mut console = Console;

    handler.start();
    while handler.is_running() {
        tokio::select! {
            more = queue.process_next(&mut console) => {
                if !more {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "could not listen for Ctrl-C");
                }
                handler.cancel_and_wait().await;
            }
        }
    }
    queue.drain(&mut console);
}

fn load_results(file: &Path, view: bool, settings: &Settings) -> Result<()> {
    let loaded = results::load(file).with_context(|| format!("failed to load {}", file.display()))?;

    println!("{}", file.display());
    println!("  measured: {}", loaded.input_label);
    for (label, values) in loaded.axis_labels.iter().zip(&loaded.axis_values) {
        println!("  {}: {} values {:?}", label, values.len(), values);
    }
    println!("  rows: {}", loaded.rows);
    println!("{}", loaded.data);

    if view {
        let heatmap = Heatmap::from_results(&loaded, settings.heatmap.clone().unwrap_or_default())
            .context("cannot show these results as a heatmap")?;
        show_heatmap(file, heatmap)?;
    }
    Ok(())
}

#[cfg(feature = "gui")]
fn show_heatmap(file: &Path, heatmap: Heatmap) -> Result<()> {
    let title = file
        .file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());
    lab_sweep::gui::heatmap_view::HeatmapViewer::new(title, heatmap)
        .run()
        .map_err(|e| anyhow!("heatmap viewer failed: {}", e))
}

#[cfg(not(feature = "gui"))]
fn show_heatmap(_file: &Path, _heatmap: Heatmap) -> Result<()> {
    Err(anyhow!("built without the `gui` feature; cannot open a window"))
}

fn list_ports(device: Option<&str>) -> Result<()> {
    let found = ports::list_ports(device).context("failed to list serial ports")?;
    if found.is_empty() {
        println!("No matching USB serial ports");
    }
    for port in found {
        println!("{}", port);
    }
    Ok(())
}
