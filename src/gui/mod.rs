//! The eframe/egui control panel.
//!
//! ## Layout
//!
//! - `TopBottomPanel` (Top): start and cancel buttons for the grid search and
//!   the time series, plus the status of the last routine.
//! - `SidePanel` (Left): one group per output with a slider "knob", a Set
//!   button, the last applied value and a marker shown after a clamped request.
//! - `CentralPanel`: a scrolling plot of the input and, below it, the heatmap
//!   of the running grid search or the trace of the last time series.
//!
//! ## Data flow
//!
//! Routines and Set-button tasks run on the tokio runtime and never touch the
//! panel directly. They post jobs through a [`UiDispatcher`]; every frame the
//! panel drains its [`UiQueue`] and runs the jobs against [`PanelState`],
//! which implements [`UiSurface`]. Posting a job requests a repaint.

pub mod heatmap_view;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eframe::egui;
use egui_plot::{Line, Plot, PlotPoints, VLine};
use ndarray::Array2;
use tokio::runtime::Handle;
use tracing::{error, warn};

use crate::data::heatmap::Heatmap;
use crate::input::Input;
use crate::lab::Lab;
use crate::output::Output;
use crate::routine::handler::RoutineHandler;
use crate::routine::ui::{UiDispatcher, UiQueue, UiSurface};
use crate::routine::Routine;

const PLOT_DATA_CAPACITY: usize = 1000;
const PLOT_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_KNOB_MAX: f64 = 100.0;

/// Controls and displays of one output.
struct OutputPanel {
    output: Arc<Output>,
    knob: f64,
    knob_max: f64,
    last_set: Option<f64>,
    invalid: Arc<AtomicBool>,
}

impl OutputPanel {
    fn new(output: Arc<Output>) -> Self {
        let invalid = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invalid);
        output.add_invalid_output_handler(move |_| flag.store(true, Ordering::SeqCst));
        let knob_max = output.limits().target.max.unwrap_or(DEFAULT_KNOB_MAX);
        Self {
            output,
            knob: 0.0,
            knob_max,
            last_set: None,
            invalid,
        }
    }
}

/// Everything routines can change, drained from the UI queue every frame.
pub struct PanelState {
    outputs: Vec<OutputPanel>,
    heatmap: Option<Heatmap>,
    series: Option<(Vec<f64>, Vec<usize>)>,
    status: String,
}

impl UiSurface for PanelState {
    fn output_changed(&mut self, label: &str, target: f64, move_knob: bool) {
        if let Some(panel) = self.outputs.iter_mut().find(|p| p.output.label() == label) {
            panel.last_set = Some(target);
            if move_knob {
                panel.knob = target;
            }
        }
    }

    fn show_heatmap(&mut self, heatmap: Heatmap) {
        self.series = None;
        self.heatmap = Some(heatmap);
    }

    fn update_heatmap(&mut self, data: Array2<f64>) {
        if let Some(heatmap) = self.heatmap.as_mut() {
            heatmap.update(data);
        }
    }

    fn show_time_series(&mut self, samples: Vec<f64>, step_starts: Vec<usize>) {
        self.heatmap = None;
        self.series = Some((samples, step_starts));
    }

    fn routine_started(&mut self, name: &str) {
        self.status = format!("{} running", name);
    }

    fn routine_finished(&mut self, name: &str) {
        self.status = format!("{} finished", name);
    }
}

/// The main window.
pub struct ControlPanel {
    title: String,
    runtime: Handle,
    lab: Arc<Lab>,
    ui: UiDispatcher,
    queue: UiQueue,
    state: PanelState,
    grid_search: Option<RoutineHandler>,
    time_series: Option<RoutineHandler>,
    trace: VecDeque<[f64; 2]>,
    started: Instant,
    last_sample: Option<Instant>,
}

impl ControlPanel {
    /// Creates the panel and the handlers of every configured routine.
    pub fn new(cc: &eframe::CreationContext<'_>, runtime: Handle, lab: Arc<Lab>) -> Self {
        let repaint_ctx = cc.egui_ctx.clone();
        let (ui, queue) = UiDispatcher::channel();
        let ui = ui.with_repaint(move || repaint_ctx.request_repaint());

        let mut status = "Idle".to_string();
        let grid_search = match lab.grid_search() {
            Ok(search) => Some(RoutineHandler::new(Arc::new(search), runtime.clone(), ui.clone())),
            Err(e) => {
                warn!(error = %e, "grid search unavailable");
                status = format!("Grid search unavailable: {}", e);
                None
            }
        };
        let time_series = match lab.time_series() {
            Ok(series) => series.map(|s| {
                let routine: Arc<dyn Routine> = Arc::new(s);
                RoutineHandler::new(routine, runtime.clone(), ui.clone())
            }),
            Err(e) => {
                warn!(error = %e, "time series unavailable");
                None
            }
        };

        let outputs = lab.outputs().values().cloned().map(OutputPanel::new).collect();

        Self {
            title: lab.settings().application.name.clone(),
            runtime,
            lab,
            ui,
            queue,
            state: PanelState {
                outputs,
                heatmap: None,
                series: None,
                status,
            },
            grid_search,
            time_series,
            trace: VecDeque::with_capacity(PLOT_DATA_CAPACITY),
            started: Instant::now(),
            last_sample: None,
        }
    }

    fn sample_input(&mut self) {
        let now = Instant::now();
        if self.last_sample.is_some_and(|t| now.duration_since(t) < PLOT_INTERVAL) {
            return;
        }
        self.last_sample = Some(now);
        if self.trace.len() >= PLOT_DATA_CAPACITY {
            self.trace.pop_front();
        }
        let elapsed = now.duration_since(self.started).as_secs_f64();
        self.trace.push_back([elapsed, self.lab.input().latest()]);
    }

    fn set_output(&self, panel: &OutputPanel) {
        panel.invalid.store(false, Ordering::SeqCst);
        let output = Arc::clone(&panel.output);
        let ui = self.ui.clone();
        let value = panel.knob;
        self.runtime.spawn(async move {
            match output.set_target(value).await {
                Ok(applied) => {
                    let label = output.label().to_string();
                    let job = move |surface: &mut dyn UiSurface| surface.output_changed(&label, applied, false);
                    if let Err(e) = ui.post(Box::new(job)) {
                        warn!(output = %output.label(), error = %e, "could not report applied value");
                    }
                }
                Err(e) => error!(output = %output.label(), error = %e, "failed to set output"),
            }
        });
    }

    fn render_outputs(&mut self, ui: &mut egui::Ui) {
        ui.heading("Outputs");
        let mut to_set = Vec::new();
        egui::ScrollArea::vertical().show(ui, |ui| {
            for (index, panel) in self.state.outputs.iter_mut().enumerate() {
                egui::Frame::group(ui.style()).show(ui, |ui| {
                    ui.horizontal(|ui| {
                        ui.strong(panel.output.label());
                        if panel.invalid.load(Ordering::SeqCst) {
                            ui.colored_label(egui::Color32::RED, "⚠ clamped")
                                .on_hover_text("The last request was outside the output limits");
                        }
                    });
                    let unit = panel.output.units().target.clone().unwrap_or_default();
                    ui.add(egui::Slider::new(&mut panel.knob, 0.0..=panel.knob_max).suffix(format!(" {}", unit)));
                    ui.horizontal(|ui| {
                        if ui.button("Set").clicked() {
                            to_set.push(index);
                        }
                        let lcd = panel.last_set.map_or("--".to_string(), |v| format!("{:.2} {}", v, unit));
                        ui.monospace(lcd);
                    });
                });
            }
        });
        for index in to_set {
            self.set_output(&self.state.outputs[index]);
        }
    }

    fn render_routines(&self, ui: &mut egui::Ui) {
        for handler in [&self.grid_search, &self.time_series].into_iter().flatten() {
            ui.separator();
            ui.label(handler.name());
            let running = handler.is_running();
            if ui.add_enabled(!running, egui::Button::new("Start")).clicked() {
                handler.start();
            }
            if ui.add_enabled(running, egui::Button::new("Cancel")).clicked() {
                handler.cancel();
            }
        }
    }

    fn render_results(&self, ui: &mut egui::Ui) {
        if let Some(heatmap) = &self.state.heatmap {
            heatmap_view::show(ui, heatmap);
        } else if let Some((samples, step_starts)) = &self.state.series {
            let points: PlotPoints = samples
                .iter()
                .enumerate()
                .map(|(i, v)| [i as f64, *v])
                .collect();
            Plot::new("time_series").show(ui, |plot_ui| {
                plot_ui.line(Line::new(points).name("samples"));
                for start in step_starts {
                    plot_ui.vline(VLine::new(*start as f64));
                }
            });
        }
    }
}

impl eframe::App for ControlPanel {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.queue.drain(&mut self.state);
        self.sample_input();

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading(&self.title);
                self.render_routines(ui);
                ui.separator();
                ui.label(&self.state.status);
            });
        });

        egui::SidePanel::left("outputs_panel")
            .resizable(true)
            .min_width(220.0)
            .show(ctx, |ui| self.render_outputs(ui));

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.label(self.lab.input().label());
            let trace: PlotPoints = self.trace.iter().copied().collect();
            Plot::new("input_plot")
                .height(220.0)
                .show(ui, |plot_ui| plot_ui.line(Line::new(trace)));
            ui.separator();
            self.render_results(ui);
        });

        ctx.request_repaint_after(PLOT_INTERVAL);
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        for handler in [&self.grid_search, &self.time_series].into_iter().flatten() {
            handler.cancel();
        }
    }
}

/// Open the control panel for `lab` and block until the window is closed.
pub fn run(runtime: Handle, lab: Arc<Lab>) -> eframe::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1100.0, 700.0]),
        ..Default::default()
    };
    let title = lab.settings().application.name.clone();
    eframe::run_native(
        &title,
        options,
        Box::new(move |cc| Ok(Box::new(ControlPanel::new(cc, runtime, lab)))),
    )
}
