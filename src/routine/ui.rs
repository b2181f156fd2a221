//! UI marshalling.
//!
//! Worker code never holds a reference to UI state. Instead it sends boxed
//! closures through a [`UiDispatcher`]; the thread that owns the UI drains the
//! matching [`UiQueue`] once per frame (or in a loop when headless) and runs
//! every job against its [`UiSurface`].

use std::fmt;
use std::sync::Arc;

use ndarray::Array2;
use tokio::sync::{mpsc, oneshot};

use crate::data::heatmap::Heatmap;
use crate::error::{AppResult, LabError};

/// The UI-side state routines can act on. Every method has a no-op default.
pub trait UiSurface {
    /// An output was set programmatically. `move_knob` asks the control to follow.
    fn output_changed(&mut self, _label: &str, _target: f64, _move_knob: bool) {}

    /// Show a new heatmap, replacing any previous one.
    fn show_heatmap(&mut self, _heatmap: Heatmap) {}

    /// New data for the heatmap currently shown.
    fn update_heatmap(&mut self, _data: Array2<f64>) {}

    /// Show a finished time series and the sample index at which each step began.
    fn show_time_series(&mut self, _samples: Vec<f64>, _step_starts: Vec<usize>) {}

    /// A routine was started.
    fn routine_started(&mut self, _name: &str) {}

    /// A routine has finished and its handler is idle again.
    fn routine_finished(&mut self, _name: &str) {}
}

/// A unit of work for the UI thread.
pub type UiJob = Box<dyn FnOnce(&mut dyn UiSurface) + Send>;

type RepaintFn = Arc<dyn Fn() + Send + Sync>;

/// Sending half of the UI job channel.
#[derive(Clone)]
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<UiJob>,
    repaint: Option<RepaintFn>,
}

impl fmt::Debug for UiDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiDispatcher")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl UiDispatcher {
    /// Create a connected dispatcher/queue pair.
    pub fn channel() -> (UiDispatcher, UiQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UiDispatcher { tx, repaint: None }, UiQueue { rx })
    }

    /// Call `repaint` after every post so an idle UI wakes up.
    pub fn with_repaint(mut self, repaint: impl Fn() + Send + Sync + 'static) -> Self {
        self.repaint = Some(Arc::new(repaint));
        self
    }

    /// Queue `job` without waiting for it.
    pub fn post(&self, job: UiJob) -> AppResult<()> {
        self.tx.send(job).map_err(|_| LabError::UiDisconnected)?;
        if let Some(repaint) = &self.repaint {
            repaint();
        }
        Ok(())
    }

    /// Queue `f` and wait until the UI thread has run it.
    pub async fn run_blocking<F, R>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut dyn UiSurface) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.post(Box::new(move |surface: &mut dyn UiSurface| {
            let _ = done_tx.send(f(surface));
        }))?;
        done_rx.await.map_err(|_| LabError::UiDisconnected)
    }
}

/// Receiving half of the UI job channel, owned by the UI thread.
pub struct UiQueue {
    rx: mpsc::UnboundedReceiver<UiJob>,
}

impl UiQueue {
    /// Run every job queued so far. Returns how many ran.
    pub fn drain(&mut self, surface: &mut dyn UiSurface) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job(surface);
            ran += 1;
        }
        ran
    }

    /// Wait for the next job and run it. Returns `false` once every dispatcher is gone.
    pub async fn process_next(&mut self, surface: &mut dyn UiSurface) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job(surface);
                true
            }
            None => false,
        }
    }
}
