//! Routine handler lifecycle: hooks, failures, panics and cancellation.

use async_trait::async_trait;
use lab_sweep::{
    calibration::LinearCalibration,
    error::AppResult,
    input::{BufferedInput, Input},
    instrument::{MockOutputDriver, MockSampleSource},
    output::{Output, OutputLimits},
    routine::{
        grid_search::{Device, GridSearch, SweepPhase, SweepSettings},
        handler::RoutineHandler,
        ui::{UiDispatcher, UiQueue, UiSurface},
        Routine, RoutineContext,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Default)]
struct Journal(Vec<String>);

impl UiSurface for Journal {
    fn output_changed(&mut self, label: &str, _target: f64, _move_knob: bool) {
        self.0.push(format!("set {}", label));
    }

    fn routine_started(&mut self, name: &str) {
        self.0.push(format!("started {}", name));
    }

    fn routine_finished(&mut self, name: &str) {
        self.0.push(format!("finished {}", name));
    }
}

impl Journal {
    fn count(&self, entry: &str) -> usize {
        self.0.iter().filter(|e| *e == entry).count()
    }
}

/// Serve UI jobs until the journal has `entry`.
async fn serve_until(queue: &mut UiQueue, journal: &mut Journal, entry: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while journal.count(entry) == 0 {
            assert!(queue.process_next(journal).await, "UI channel closed");
        }
    })
    .await
    .expect("UI job never arrived");
}

struct WaitForCancel;

#[async_trait]
impl Routine for WaitForCancel {
    fn name(&self) -> &str {
        "wait"
    }

    async fn run(&self, ctx: RoutineContext) -> AppResult<()> {
        ctx.cancelled().await;
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl Routine for Panics {
    fn name(&self) -> &str {
        "panics"
    }

    async fn run(&self, _ctx: RoutineContext) -> AppResult<()> {
        panic!("sensor crashed");
    }
}

#[tokio::test]
async fn hooks_run_on_the_ui_side() {
    let (ui, mut queue) = UiDispatcher::channel();
    let handler = RoutineHandler::new(Arc::new(WaitForCancel), Handle::current(), ui)
        .on_start(|surface| surface.output_changed("start hook", 0.0, false))
        .on_reset(|surface| surface.output_changed("reset hook", 0.0, false));

    assert!(handler.start());
    let mut journal = Journal::default();
    serve_until(&mut queue, &mut journal, "set start hook").await;
    assert_eq!(journal.0, vec!["started wait", "set start hook"]);

    handler.cancel_and_wait().await;
    serve_until(&mut queue, &mut journal, "set reset hook").await;
    assert_eq!(journal.0[2..], ["finished wait", "set reset hook"]);
}

#[tokio::test]
async fn panicking_routine_frees_the_handler() {
    let (ui, mut queue) = UiDispatcher::channel();
    let handler = RoutineHandler::new(Arc::new(Panics), Handle::current(), ui);
    assert!(handler.start());

    let mut journal = Journal::default();
    serve_until(&mut queue, &mut journal, "finished panics").await;
    assert!(!handler.is_running());
    assert!(handler.start(), "handler can run again after a panic");
}

#[tokio::test]
async fn reset_from_a_cancelled_run_does_not_free_the_next_one() {
    let (ui, mut queue) = UiDispatcher::channel();
    let handler = RoutineHandler::new(Arc::new(WaitForCancel), Handle::current(), ui);

    assert!(handler.start());
    handler.cancel_and_wait().await;
    assert!(handler.start());

    // started(1), reset(1), started(2)
    let mut journal = Journal::default();
    assert_eq!(queue.drain(&mut journal), 3);
    assert_eq!(journal.count("finished wait"), 0);
    assert!(handler.is_running());

    handler.cancel_and_wait().await;
    assert!(!handler.is_running());
}

#[test]
fn blocking_cancel_from_outside_the_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (ui, _queue) = UiDispatcher::channel();
    let handler = RoutineHandler::new(Arc::new(WaitForCancel), runtime.handle().clone(), ui);

    assert!(handler.start());
    assert!(handler.is_running());
    handler.cancel();
    assert!(!handler.is_running());
}

#[tokio::test(start_paused = true)]
async fn grid_search_can_be_cancelled_through_its_handler() {
    let output = |label: &str| {
        Arc::new(Output::new(
            label,
            Box::new(MockOutputDriver::new(label)),
            Arc::new(LinearCalibration::standard(Some("V"))),
            OutputLimits::default(),
        ))
    };
    let input = Arc::new(BufferedInput::new(
        "current",
        Box::new(MockSampleSource::ramp(20.0, 1000)),
        false,
        true,
    ));
    input.open(None).await.unwrap();
    let input: Arc<dyn Input> = input;

    let values: Vec<f64> = (0..10).map(f64::from).collect();
    let search = Arc::new(
        GridSearch::new(
            vec![
                Device::new(output("a"), values.clone(), Duration::from_millis(500)),
                Device::new(output("b"), values, Duration::from_millis(500)),
            ],
            input,
            SweepSettings::default(),
        )
        .unwrap(),
    );

    let (ui, mut queue) = UiDispatcher::channel();
    let handler = RoutineHandler::new(search.clone(), Handle::current(), ui);
    assert!(handler.start());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(search.phase(), SweepPhase::Sweeping);

    handler.cancel_and_wait().await;
    assert!(!handler.is_running());
    assert_eq!(search.phase(), SweepPhase::Cancelled);

    let outcome = search.last_outcome().unwrap();
    assert!(!outcome.completed);
    assert!(outcome.measurements > 0);
    assert!(outcome.measurements < search.total_points());

    let mut journal = Journal::default();
    queue.drain(&mut journal);
    assert_eq!(journal.count("started Grid search"), 1);
    assert_eq!(journal.count("finished Grid search"), 1);
    // Both outputs are set before the first point, then one per further point
    let sets = journal.0.iter().filter(|e| e.starts_with("set ")).count();
    assert!(sets >= outcome.measurements + 1);
}
