//! End-to-end grid searches against recording mock hardware.

use async_trait::async_trait;
use lab_sweep::{
    calibration::LinearCalibration,
    data::{
        heatmap::{display_order, Heatmap, HeatmapSettings},
        results,
    },
    error::{AppResult, LabError},
    input::{BufferedInput, Input},
    instrument::{MockOutputDriver, MockSampleSource, OutputDriver},
    output::{Output, OutputLimits},
    routine::{
        grid_search::{Device, GridSearch, SweepPhase, SweepSettings},
        ui::{UiDispatcher, UiQueue, UiSurface},
        CancelToken, RoutineContext,
    },
};
use ndarray::{Array2, Ix2};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Event {
    Write { axis: usize, value: f64, at: Instant },
    Sample { at: Instant },
}

type Log = Arc<Mutex<Vec<Event>>>;

/// Driver that logs every write and can cancel a run on a given write.
struct RecordingDriver {
    axis: usize,
    current: Arc<Mutex<f64>>,
    log: Log,
    cancel_on_write: Option<(usize, CancelToken)>,
}

#[async_trait]
impl OutputDriver for RecordingDriver {
    fn name(&self) -> &str {
        "recording"
    }

    async fn write(&mut self, control: f64) -> AppResult<()> {
        *self.current.lock() = control;
        let mut log = self.log.lock();
        log.push(Event::Write {
            axis: self.axis,
            value: control,
            at: Instant::now(),
        });
        if let Some((nth, token)) = &self.cancel_on_write {
            let writes = log.iter().filter(|e| matches!(e, Event::Write { .. })).count();
            if writes == *nth {
                token.cancel();
            }
        }
        Ok(())
    }
}

struct Rig {
    log: Log,
    cancel: CancelToken,
    x: Arc<Output>,
    y: Arc<Output>,
    input: Arc<BufferedInput>,
}

impl Rig {
    /// Two outputs; the input reads `x + y + 1` at the moment it is sampled.
    async fn new(cancel_on_write: Option<usize>) -> Rig {
        let log: Log = Arc::default();
        let cancel = CancelToken::new();
        let x_now = Arc::new(Mutex::new(0.0));
        let y_now = Arc::new(Mutex::new(0.0));

        let output = |label: &str, axis: usize, current: &Arc<Mutex<f64>>| {
            let driver = RecordingDriver {
                axis,
                current: Arc::clone(current),
                log: Arc::clone(&log),
                cancel_on_write: cancel_on_write.map(|n| (n, cancel.clone())),
            };
            Arc::new(Output::new(
                label,
                Box::new(driver),
                Arc::new(LinearCalibration::standard(None)),
                OutputLimits::default(),
            ))
        };
        let x = output("x", 0, &x_now);
        let y = output("y", 1, &y_now);

        let sample_log = Arc::clone(&log);
        let source = MockSampleSource::from_fn(100.0, move |_| {
            sample_log.lock().push(Event::Sample { at: Instant::now() });
            *x_now.lock() + *y_now.lock() + 1.0
        });
        let input = Arc::new(BufferedInput::new("signal", Box::new(source), false, true));
        input.open(None).await.unwrap();

        Rig {
            log,
            cancel,
            x,
            y,
            input,
        }
    }

    fn context(&self) -> (RoutineContext, UiQueue) {
        let (ui, queue) = UiDispatcher::channel();
        (RoutineContext::new(self.cancel.clone(), ui), queue)
    }

    fn input(&self) -> Arc<dyn Input> {
        self.input.clone()
    }

    fn writes(&self, axis: usize) -> Vec<f64> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| match *e {
                Event::Write { axis: a, value, .. } if a == axis => Some(value),
                _ => None,
            })
            .collect()
    }
}

fn settings() -> SweepSettings {
    SweepSettings {
        samples_per_point: 2,
        check_interval: Duration::from_millis(50),
        update_graphics: true,
        plot_every: 1,
    }
}

/// Rows of a results file, without the header.
fn rows(path: &std::path::Path) -> Vec<Vec<f64>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| line.split(',').map(|f| f.parse().unwrap()).collect())
        .collect()
}

#[derive(Default)]
struct Recorder {
    heatmap: Option<Heatmap>,
    updates: usize,
}

impl UiSurface for Recorder {
    fn show_heatmap(&mut self, heatmap: Heatmap) {
        self.heatmap = Some(heatmap);
    }

    fn update_heatmap(&mut self, data: Array2<f64>) {
        self.updates += 1;
        if let Some(heatmap) = self.heatmap.as_mut() {
            heatmap.update(data);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn three_by_two_sweep_visits_in_boustrophedon_order() {
    let rig = Rig::new(None).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");

    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 10.0, 20.0], Duration::from_millis(300)),
            Device::new(rig.y.clone(), vec![0.0, 5.0], Duration::from_millis(100)),
        ],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_results_path(&path)
    .with_heatmap(HeatmapSettings::default());

    let (ctx, mut queue) = rig.context();
    let outcome = search.execute(&ctx).await.unwrap();

    assert!(outcome.completed);
    assert_eq!(search.phase(), SweepPhase::Completed);
    assert_eq!(outcome.measurements, 6);
    assert_eq!(search.last_outcome(), Some(outcome.clone()));

    // Visit order and the value measured at each point
    let expected = vec![
        vec![0.0, 0.0, 1.0],
        vec![0.0, 5.0, 6.0],
        vec![10.0, 5.0, 16.0],
        vec![10.0, 0.0, 11.0],
        vec![20.0, 0.0, 21.0],
        vec![20.0, 5.0, 26.0],
    ];
    assert_eq!(rows(&path), expected);
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("x,y,signal\n"));

    // Every cell holds x + y + 1
    let matrix = outcome.results.clone().into_dimensionality::<Ix2>().unwrap();
    for (i, x) in [0.0, 10.0, 20.0].iter().enumerate() {
        for (j, y) in [0.0, 5.0].iter().enumerate() {
            assert_eq!(matrix[[i, j]], x + y + 1.0);
        }
    }

    // Outputs are written only when they change
    assert_eq!(rig.writes(0), vec![0.0, 10.0, 20.0]);
    assert_eq!(rig.writes(1), vec![0.0, 5.0, 0.0, 5.0]);

    // One live update per measurement plus the final redraw
    let mut recorder = Recorder::default();
    queue.drain(&mut recorder);
    assert_eq!(recorder.updates, 7);
    let heatmap = recorder.heatmap.unwrap();
    assert_eq!(heatmap.data(), Some(&display_order(matrix.view())));
    assert_eq!(heatmap.data().unwrap()[[0, 0]], 21.0);
}

#[tokio::test(start_paused = true)]
async fn every_cell_is_measured_once_along_adjacent_steps() {
    let rig = Rig::new(None).await;
    let x_values = vec![0.0, 1.0, 2.0, 3.0];
    let y_values = vec![0.0, 10.0, 20.0];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");

    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), x_values.clone(), Duration::from_millis(20)),
            Device::new(rig.y.clone(), y_values.clone(), Duration::from_millis(20)),
        ],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_results_path(&path);

    let (ctx, _queue) = rig.context();
    let outcome = search.execute(&ctx).await.unwrap();
    assert_eq!(outcome.measurements, x_values.len() * y_values.len());

    let visited: Vec<(usize, usize)> = rows(&path)
        .iter()
        .map(|row| {
            let i = x_values.iter().position(|v| *v == row[0]).unwrap();
            let j = y_values.iter().position(|v| *v == row[1]).unwrap();
            (i, j)
        })
        .collect();

    let mut unique = visited.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), visited.len());

    for pair in visited.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let di = a.0.abs_diff(b.0);
        let dj = a.1.abs_diff(b.1);
        assert_eq!(di + dj, 1, "{:?} -> {:?} is not a single step", a, b);
    }
}

#[tokio::test(start_paused = true)]
async fn samples_are_taken_only_after_settling() {
    let rig = Rig::new(None).await;
    let settle = [Duration::from_millis(300), Duration::from_millis(120)];
    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 1.0, 2.0], settle[0]),
            Device::new(rig.y.clone(), vec![0.0, 1.0, 2.0], settle[1]),
        ],
        rig.input(),
        settings(),
    )
    .unwrap();

    let (ctx, _queue) = rig.context();
    search.execute(&ctx).await.unwrap();

    let mut last_write: [Option<Instant>; 2] = [None, None];
    let mut samples = 0;
    for event in rig.log.lock().iter() {
        match *event {
            Event::Write { axis, at, .. } => last_write[axis] = Some(at),
            Event::Sample { at } => {
                samples += 1;
                for (axis, written) in last_write.iter().enumerate() {
                    let written = written.expect("sample before the first write");
                    assert!(at.duration_since(written) >= settle[axis]);
                }
            }
        }
    }
    assert!(samples >= 9 * 2);
}

#[tokio::test(start_paused = true)]
async fn one_way_axis_returns_to_its_first_value() {
    let rig = Rig::new(None).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");

    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 10.0], Duration::from_millis(50)),
            Device::new(rig.y.clone(), vec![0.0, 5.0, 10.0], Duration::from_millis(50)).with_bidirectional(false),
        ],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_results_path(&path);

    let (ctx, _queue) = rig.context();
    let outcome = search.execute(&ctx).await.unwrap();
    assert!(outcome.completed);

    assert_eq!(rig.writes(1), vec![0.0, 5.0, 10.0, 0.0, 5.0, 10.0, 0.0]);
    let order: Vec<(f64, f64)> = rows(&path).iter().map(|r| (r[0], r[1])).collect();
    assert_eq!(
        order,
        vec![(0.0, 0.0), (0.0, 5.0), (0.0, 10.0), (10.0, 0.0), (10.0, 5.0), (10.0, 10.0)]
    );
}

#[tokio::test(start_paused = true)]
async fn results_file_loads_back_into_the_sweep_matrix() {
    let rig = Rig::new(None).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");

    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 10.0, 20.0], Duration::from_millis(10)),
            Device::new(rig.y.clone(), vec![0.0, 5.0], Duration::from_millis(10)),
        ],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_results_path(&path);

    let (ctx, _queue) = rig.context();
    let outcome = search.execute(&ctx).await.unwrap();
    assert_eq!(outcome.results_path.as_deref(), Some(path.as_path()));

    let loaded = results::load(&path).unwrap();
    assert_eq!(loaded.axis_labels, vec!["x", "y"]);
    assert_eq!(loaded.input_label, "signal");
    assert_eq!(loaded.axis_values, vec![vec![0.0, 10.0, 20.0], vec![0.0, 5.0]]);
    assert_eq!(loaded.data, outcome.results);

    let heatmap = Heatmap::from_results(&loaded, HeatmapSettings::default()).unwrap();
    assert_eq!(heatmap.y_ticks(), ["20", "10", "0"]);
    assert_eq!(heatmap.x_ticks(), ["0", "5"]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_sweep_keeps_partial_results() {
    // Write 4 is x moving to 10: the measurement there is abandoned.
    let rig = Rig::new(Some(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");

    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 10.0, 20.0], Duration::from_millis(10)),
            Device::new(rig.y.clone(), vec![0.0, 5.0], Duration::from_millis(10)),
        ],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_results_path(&path);

    let (ctx, _queue) = rig.context();
    let outcome = search.execute(&ctx).await.unwrap();

    assert!(!outcome.completed);
    assert_eq!(search.phase(), SweepPhase::Cancelled);
    assert_eq!(outcome.measurements, 2);
    assert_eq!(rows(&path).len(), 2);
    assert_eq!(outcome.results.iter().filter(|v| **v != 0.0).count(), 2);
    assert!(!rig.input.is_buffering());

    // Outputs are left where they were
    assert_eq!(rig.x.target(), Some(10.0));
    assert_eq!(rig.writes(0).len() + rig.writes(1).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn empty_axis_fails_before_any_write() {
    let rig = Rig::new(None).await;
    let result = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 1.0], Duration::ZERO),
            Device::new(rig.y.clone(), Vec::new(), Duration::ZERO),
        ],
        rig.input(),
        settings(),
    );
    assert!(matches!(result, Err(LabError::EmptyAxis(label)) if label == "y"));
    assert!(rig.log.lock().iter().all(|e| !matches!(e, Event::Write { .. })));
}

#[tokio::test(start_paused = true)]
async fn existing_results_file_fails_before_any_write() {
    let rig = Rig::new(None).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.csv");
    std::fs::write(&path, "do not touch\n").unwrap();

    let search = GridSearch::new(
        vec![Device::new(rig.x.clone(), vec![0.0, 1.0], Duration::ZERO)],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_results_path(&path);

    let (ctx, _queue) = rig.context();
    let result = search.execute(&ctx).await;

    assert!(matches!(result, Err(LabError::ResultsFileExists(p)) if p == path));
    assert_eq!(search.phase(), SweepPhase::Failed);
    assert!(rig.writes(0).is_empty());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "do not touch\n");
}

#[tokio::test(start_paused = true)]
async fn single_axis_sweep_has_no_heatmap() {
    let rig = Rig::new(None).await;
    let search = GridSearch::new(
        vec![Device::new(rig.x.clone(), vec![0.0, 1.0, 2.0], Duration::from_millis(10))],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_heatmap(HeatmapSettings::default());

    let (ctx, mut queue) = rig.context();
    let outcome = search.execute(&ctx).await.unwrap();
    assert_eq!(outcome.measurements, 3);
    assert!(outcome.results_path.is_none());

    let mut recorder = Recorder::default();
    queue.drain(&mut recorder);
    assert!(recorder.heatmap.is_none());
    assert_eq!(recorder.updates, 0);
}

/// Sweep three mock outputs whose values equal their indices. Returns the
/// visited index triples (from the results file), the middle axis writes
/// and the number of measurements.
async fn three_axis_sweep(counts: [usize; 3], middle_bidirectional: bool) -> (Vec<[usize; 3]>, Vec<f64>, usize) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.csv");

    let mut middle_writes = None;
    let devices: Vec<Device> = counts
        .iter()
        .enumerate()
        .map(|(axis, &count)| {
            let driver = MockOutputDriver::new(format!("axis {}", axis));
            if axis == 1 {
                middle_writes = Some(driver.writes());
            }
            let output = Arc::new(Output::new(
                format!("d{}", axis),
                Box::new(driver),
                Arc::new(LinearCalibration::standard(None)),
                OutputLimits::default(),
            ));
            let values = (0..count).map(|i| i as f64).collect();
            let device = Device::new(output, values, Duration::from_millis(10));
            if axis == 1 {
                device.with_bidirectional(middle_bidirectional)
            } else {
                device
            }
        })
        .collect();

    let input = Arc::new(BufferedInput::new("ramp", Box::new(MockSampleSource::ramp(100.0, 1000)), false, true));
    input.open(None).await.unwrap();
    let search = GridSearch::new(devices, input, settings()).unwrap().with_results_path(&path);

    let (ui, _queue) = UiDispatcher::channel();
    let ctx = RoutineContext::new(CancelToken::new(), ui);
    let outcome = search.execute(&ctx).await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.results.shape(), &counts[..]);

    let visits = rows(&path)
        .iter()
        .map(|row| [row[0] as usize, row[1] as usize, row[2] as usize])
        .collect();
    let writes = middle_writes.unwrap().lock().clone();
    (visits, writes, outcome.measurements)
}

fn assert_each_cell_once(visits: &[[usize; 3]], counts: [usize; 3]) {
    assert_eq!(visits.len(), counts.iter().product::<usize>());
    let mut unique = visits.to_vec();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), visits.len(), "a cell was measured twice");
    assert!(visits.iter().all(|v| v.iter().zip(&counts).all(|(i, n)| i < n)));
}

fn single_axis_step(a: [usize; 3], b: [usize; 3]) -> bool {
    let distance: usize = a.iter().zip(&b).map(|(x, y)| x.abs_diff(*y)).sum();
    distance == 1
}

#[tokio::test(start_paused = true)]
async fn three_axis_sweep_snakes_through_every_cell() {
    let counts = [3, 3, 2];
    let (visits, _, measurements) = three_axis_sweep(counts, true).await;

    assert_eq!(measurements, 18);
    assert_each_cell_once(&visits, counts);
    for pair in visits.windows(2) {
        assert!(single_axis_step(pair[0], pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
    }

    // The inner axis follows the middle one when that runs in reverse
    assert_eq!(visits[0], [0, 0, 0]);
    assert_eq!(&visits[5..10], &[[0, 2, 1], [1, 2, 1], [1, 2, 0], [1, 1, 0], [1, 1, 1]]);
    assert_eq!(visits[17], [2, 2, 1]);
}

#[tokio::test(start_paused = true)]
async fn one_way_middle_axis_resets_between_outer_steps() {
    let counts = [2, 3, 2];
    let (visits, middle_writes, measurements) = three_axis_sweep(counts, false).await;

    assert_eq!(measurements, 12);
    assert_each_cell_once(&visits, counts);
    assert_eq!(
        visits,
        vec![
            [0, 0, 0],
            [0, 0, 1],
            [0, 1, 1],
            [0, 1, 0],
            [0, 2, 0],
            [0, 2, 1],
            [1, 0, 1],
            [1, 0, 0],
            [1, 1, 0],
            [1, 1, 1],
            [1, 2, 1],
            [1, 2, 0],
        ]
    );
    assert_eq!(middle_writes, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0]);

    // Only the reset of the middle axis breaks single steps
    for pair in visits.windows(2) {
        let reset = pair[0][1] == 2 && pair[1][1] == 0;
        assert_eq!(single_axis_step(pair[0], pair[1]), !reset, "{:?} -> {:?}", pair[0], pair[1]);
    }
}

#[tokio::test(start_paused = true)]
async fn sweep_finishes_when_the_ui_has_gone() {
    let rig = Rig::new(None).await;
    let search = GridSearch::new(
        vec![
            Device::new(rig.x.clone(), vec![0.0, 10.0], Duration::from_millis(10)),
            Device::new(rig.y.clone(), vec![0.0, 5.0], Duration::from_millis(10)),
        ],
        rig.input(),
        settings(),
    )
    .unwrap()
    .with_heatmap(HeatmapSettings::default());

    let (ctx, queue) = rig.context();
    drop(queue);
    let outcome = search.execute(&ctx).await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.measurements, 4);
}
