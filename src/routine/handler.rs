//! Starting and cancelling routines from the UI thread.
//!
//! A [`RoutineHandler`] owns one routine. `start` spawns it on the tokio
//! runtime; when the task ends (normally, cancelled, with an error or a panic)
//! the handler posts a reset job to the UI thread that clears the busy flag
//! and runs the `on_reset` hook. `cancel` sets the routine's [`CancelToken`]
//! and joins the task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ui::{UiDispatcher, UiSurface};
use super::{CancelToken, Routine, RoutineContext};

/// Hook run on the UI thread when a routine starts or is reset.
pub type UiHook = Arc<dyn Fn(&mut dyn UiSurface) + Send + Sync>;

#[derive(Default)]
struct Shared {
    busy: AtomicBool,
    run_id: AtomicU64,
}

struct ActiveRun {
    cancel: CancelToken,
    task: JoinHandle<()>,
}

/// Runs one routine at a time on a background task.
pub struct RoutineHandler {
    routine: Arc<dyn Routine>,
    runtime: Handle,
    ui: UiDispatcher,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveRun>>,
    on_start: Option<UiHook>,
    on_reset: Option<UiHook>,
}

impl RoutineHandler {
    /// Handler spawning `routine` on `runtime` and posting UI jobs to `ui`.
    pub fn new(routine: Arc<dyn Routine>, runtime: Handle, ui: UiDispatcher) -> Self {
        Self {
            routine,
            runtime,
            ui,
            shared: Arc::new(Shared::default()),
            active: Mutex::new(None),
            on_start: None,
            on_reset: None,
        }
    }

    /// Run `hook` on the UI thread whenever the routine starts.
    pub fn on_start(mut self, hook: impl Fn(&mut dyn UiSurface) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Run `hook` on the UI thread once the routine has finished.
    pub fn on_reset(mut self, hook: impl Fn(&mut dyn UiSurface) + Send + Sync + 'static) -> Self {
        self.on_reset = Some(Arc::new(hook));
        self
    }

    /// Name of the routine.
    pub fn name(&self) -> &str {
        self.routine.name()
    }

    /// Whether a run is in progress (until its reset job has run, or it was cancelled).
    pub fn is_running(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Start the routine. Returns `false` without doing anything if it is already running.
    pub fn start(&self) -> bool {
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            debug!(routine = %self.name(), "start ignored; routine is busy");
            return false;
        }
        let run_id = self.shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = self.name().to_string();

        let started = {
            let name = name.clone();
            let hook = self.on_start.clone();
            move |surface: &mut dyn UiSurface| {
                surface.routine_started(&name);
                if let Some(hook) = hook {
                    hook(surface);
                }
            }
        };
        if let Err(e) = self.ui.post(Box::new(started)) {
            warn!(routine = %name, error = %e, "could not post start notification");
        }

        let cancel = CancelToken::new();
        let ctx = RoutineContext::new(cancel.clone(), self.ui.clone());
        let routine = Arc::clone(&self.routine);
        let ui = self.ui.clone();
        let shared = Arc::clone(&self.shared);
        let on_reset = self.on_reset.clone();

        info!(routine = %name, run_id, "starting routine");
        let task = self.runtime.spawn(async move {
            match AssertUnwindSafe(routine.run(ctx)).catch_unwind().await {
                Ok(Ok(())) => info!(routine = %name, run_id, "routine finished"),
                Ok(Err(e)) => error!(routine = %name, run_id, error = %e, "routine failed"),
                Err(panic) => error!(
                    routine = %name,
                    run_id,
                    panic = %panic_message(panic.as_ref()),
                    "routine panicked"
                ),
            }
            post_reset(&ui, shared, run_id, name, on_reset);
        });

        *self.active.lock() = Some(ActiveRun { cancel, task });
        true
    }

    /// Cancel the running routine and block until its task has ended.
    ///
    /// Meant for the UI thread. Must not be called from inside the tokio
    /// runtime; use [`cancel_and_wait`](Self::cancel_and_wait) there.
    pub fn cancel(&self) {
        let Some(run) = self.take_active() else {
            return;
        };
        run.cancel.cancel();
        if let Err(e) = futures::executor::block_on(run.task) {
            warn!(routine = %self.name(), error = %e, "routine task did not end cleanly");
        }
        self.shared.busy.store(false, Ordering::SeqCst);
    }

    /// Cancel the running routine and wait for its task to end.
    pub async fn cancel_and_wait(&self) {
        let Some(run) = self.take_active() else {
            return;
        };
        run.cancel.cancel();
        if let Err(e) = run.task.await {
            warn!(routine = %self.name(), error = %e, "routine task did not end cleanly");
        }
        self.shared.busy.store(false, Ordering::SeqCst);
    }

    fn take_active(&self) -> Option<ActiveRun> {
        if !self.is_running() {
            return None;
        }
        let run = self.active.lock().take();
        if run.is_some() {
            info!(routine = %self.name(), "cancelling routine");
        }
        run
    }
}

fn post_reset(ui: &UiDispatcher, shared: Arc<Shared>, run_id: u64, name: String, on_reset: Option<UiHook>) {
    let flag = Arc::clone(&shared);
    let reset = move |surface: &mut dyn UiSurface| {
        if flag.run_id.load(Ordering::SeqCst) != run_id {
            debug!(routine = %name, run_id, "ignoring reset from a stale run");
            return;
        }
        flag.busy.store(false, Ordering::SeqCst);
        surface.routine_finished(&name);
        if let Some(hook) = on_reset {
            hook(surface);
        }
    };
    if ui.post(Box::new(reset)).is_err() {
        // Nobody will run the reset job; free the handler here.
        if shared.run_id.load(Ordering::SeqCst) == run_id {
            shared.busy.store(false, Ordering::SeqCst);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppResult, LabError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Waits;

    #[async_trait]
    impl Routine for Waits {
        fn name(&self) -> &str {
            "waits"
        }

        async fn run(&self, ctx: RoutineContext) -> AppResult<()> {
            ctx.cancelled().await;
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl Routine for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        async fn run(&self, _ctx: RoutineContext) -> AppResult<()> {
            Err(LabError::Instrument("boom".to_string()))
        }
    }

    #[derive(Default)]
    struct Surface {
        finished: Vec<String>,
    }

    impl UiSurface for Surface {
        fn routine_finished(&mut self, name: &str) {
            self.finished.push(name.to_string());
        }
    }

    #[tokio::test]
    async fn second_start_is_ignored_while_busy() {
        let (ui, _queue) = UiDispatcher::channel();
        let handler = RoutineHandler::new(Arc::new(Waits), Handle::current(), ui);
        assert!(handler.start());
        assert!(!handler.start());
        handler.cancel_and_wait().await;
        assert!(!handler.is_running());
        assert!(handler.start());
        handler.cancel_and_wait().await;
    }

    #[tokio::test]
    async fn failing_routine_still_resets() {
        let (ui, mut queue) = UiDispatcher::channel();
        let handler = RoutineHandler::new(Arc::new(Fails), Handle::current(), ui);
        assert!(handler.start());

        let mut surface = Surface::default();
        tokio::time::timeout(Duration::from_secs(1), async {
            while surface.finished.is_empty() {
                queue.process_next(&mut surface).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(surface.finished, vec!["fails"]);
        assert!(!handler.is_running());
    }
}
