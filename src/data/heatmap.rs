//! Render model for two-axis sweep results.
//!
//! A [`Heatmap`] holds everything needed to draw a 2-D result: the colour
//! normalisation, the (thinned-out) tick labels and the matrix in display
//! order. It is toolkit-agnostic; the GUI paints it cell by cell.
//!
//! Rows correspond to the first sweep axis and columns to the second. Matrices
//! are stored top row first, so the first axis is flipped relative to the
//! sweep's index order and its smallest value ends up at the bottom.

use ndarray::{s, Array2, ArrayView2, Ix2};
use serde::{Deserialize, Serialize};

use super::results::LoadedResults;
use crate::error::{AppResult, LabError};

/// Colour scale and labelling of a heatmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapSettings {
    /// Value mapped to the bottom of the colour scale
    #[serde(default = "default_color_min")]
    pub color_min: f64,
    /// Value mapped to the top of the colour scale
    #[serde(default = "default_color_max")]
    pub color_max: f64,
    /// `None` for a linear scale, otherwise the symlog linear threshold (0 = `color_min`)
    #[serde(default = "default_log_threshold")]
    pub log_threshold: Option<f64>,
    /// Most tick labels shown per axis
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,
}

fn default_color_min() -> f64 {
    1.0
}

fn default_color_max() -> f64 {
    1000.0
}

fn default_log_threshold() -> Option<f64> {
    Some(0.0)
}

fn default_max_labels() -> usize {
    20
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            color_min: default_color_min(),
            color_max: default_color_max(),
            log_threshold: default_log_threshold(),
            max_labels: default_max_labels(),
        }
    }
}

/// Mapping from data values to the `[0, 1]` colour scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorNorm {
    /// Straight line from `min` to `max`
    Linear {
        /// Value at 0
        min: f64,
        /// Value at 1
        max: f64,
    },
    /// Linear within `±threshold`, logarithmic outside
    SymLog {
        /// Value at 0
        min: f64,
        /// Value at 1
        max: f64,
        /// Half-width of the linear region
        threshold: f64,
    },
}

impl ColorNorm {
    /// Norm described by `settings`.
    pub fn from_settings(settings: &HeatmapSettings) -> Self {
        let (min, max) = (settings.color_min, settings.color_max);
        let threshold = match settings.log_threshold {
            None => return ColorNorm::Linear { min, max },
            Some(t) if t == 0.0 => min,
            Some(t) => t,
        };
        if threshold > 0.0 && threshold.is_finite() {
            ColorNorm::SymLog { min, max, threshold }
        } else {
            ColorNorm::Linear { min, max }
        }
    }

    /// Position of `value` on the colour scale, clamped to `[0, 1]`. `None` for NaN.
    pub fn normalize(&self, value: f64) -> Option<f64> {
        if value.is_nan() {
            return None;
        }
        let (lo, hi, v) = match *self {
            ColorNorm::Linear { min, max } => (min, max, value),
            ColorNorm::SymLog { min, max, threshold } => (
                symlog(min, threshold),
                symlog(max, threshold),
                symlog(value, threshold),
            ),
        };
        if hi == lo {
            return Some(0.0);
        }
        Some(((v - lo) / (hi - lo)).clamp(0.0, 1.0))
    }
}

fn symlog(x: f64, threshold: f64) -> f64 {
    if x.abs() <= threshold {
        x / threshold
    } else {
        x.signum() * (1.0 + (x.abs() / threshold).log10())
    }
}

const PALETTE: [[f64; 3]; 5] = [
    [165.0, 205.0, 144.0],
    [96.0, 175.0, 139.0],
    [48.0, 136.0, 140.0],
    [42.0, 92.0, 136.0],
    [44.0, 49.0, 114.0],
];

/// Colour of a normalised value, light green at 0 through to dark blue at 1.
pub fn colormap(t: f64) -> [u8; 3] {
    let t = t.clamp(0.0, 1.0) * (PALETTE.len() - 1) as f64;
    let i = (t.floor() as usize).min(PALETTE.len() - 2);
    let frac = t - i as f64;
    let mut rgb = [0u8; 3];
    for (channel, out) in rgb.iter_mut().enumerate() {
        let a = PALETTE[i][channel];
        let b = PALETTE[i + 1][channel];
        *out = (a + (b - a) * frac).round() as u8;
    }
    rgb
}

/// Blank every other visible label until at most `max_labels` remain visible.
pub fn collapse_labels(mut labels: Vec<String>, max_labels: usize) -> Vec<String> {
    let limit = max_labels.max(1);
    loop {
        let visible: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| !label.is_empty())
            .map(|(i, _)| i)
            .collect();
        if visible.len() <= limit {
            return labels;
        }
        for i in visible.into_iter().skip(1).step_by(2) {
            labels[i].clear();
        }
    }
}

/// Rows of `raw` (indexed by sweep position) reversed into display order.
pub fn display_order(raw: ArrayView2<'_, f64>) -> Array2<f64> {
    raw.slice(s![..;-1, ..]).to_owned()
}

fn format_tick(value: f64) -> String {
    format!("{}", value)
}

#[derive(Debug, Clone, PartialEq)]
struct Axes {
    norm: ColorNorm,
    x_ticks: Vec<String>,
    y_ticks: Vec<String>,
}

/// A two-axis heatmap ready to be drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    settings: HeatmapSettings,
    y_label: String,
    x_label: String,
    y_values: Vec<f64>,
    x_values: Vec<f64>,
    axes: Option<Axes>,
    data: Option<Array2<f64>>,
}

impl Heatmap {
    /// Heatmap with rows from the `y` axis and columns from the `x` axis.
    ///
    /// Axis values are given in sweep order; nothing is drawn until
    /// [`plot`](Self::plot) or [`update`](Self::update) provides data.
    pub fn new(
        settings: HeatmapSettings,
        y_label: impl Into<String>,
        y_values: Vec<f64>,
        x_label: impl Into<String>,
        x_values: Vec<f64>,
    ) -> Self {
        Self {
            settings,
            y_label: y_label.into(),
            x_label: x_label.into(),
            y_values,
            x_values,
            axes: None,
            data: None,
        }
    }

    /// Heatmap of a loaded two-axis results file.
    pub fn from_results(results: &LoadedResults, settings: HeatmapSettings) -> AppResult<Self> {
        let matrix = results
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| {
                LabError::ResultsFormat(format!(
                    "a heatmap needs exactly 2 axes, the file has {}",
                    results.axis_labels.len()
                ))
            })?;
        let mut heatmap = Self::new(
            settings,
            results.axis_labels[0].clone(),
            results.axis_values[0].clone(),
            results.axis_labels[1].clone(),
            results.axis_values[1].clone(),
        );
        heatmap.plot(display_order(matrix));
        Ok(heatmap)
    }

    /// Build the colour norm and tick labels, then show `data`.
    pub fn plot(&mut self, data: Array2<f64>) {
        let norm = ColorNorm::from_settings(&self.settings);
        let x_ticks = collapse_labels(
            self.x_values.iter().copied().map(format_tick).collect(),
            self.settings.max_labels,
        );
        let y_ticks = collapse_labels(
            self.y_values.iter().rev().copied().map(format_tick).collect(),
            self.settings.max_labels,
        );
        self.axes = Some(Axes {
            norm,
            x_ticks,
            y_ticks,
        });
        self.update(data);
    }

    /// Replace the shown data (display order). Plots first if never plotted.
    pub fn update(&mut self, data: Array2<f64>) {
        if self.axes.is_none() {
            self.plot(data);
            return;
        }
        self.data = Some(data);
    }

    /// Whether [`plot`](Self::plot) has run.
    pub fn is_plotted(&self) -> bool {
        self.axes.is_some()
    }

    /// Data in display order.
    pub fn data(&self) -> Option<&Array2<f64>> {
        self.data.as_ref()
    }

    /// Colour norm, once plotted.
    pub fn norm(&self) -> Option<ColorNorm> {
        self.axes.as_ref().map(|a| a.norm)
    }

    /// Column labels, left to right. Blank labels are hidden.
    pub fn x_ticks(&self) -> &[String] {
        self.axes.as_ref().map_or(&[][..], |a| a.x_ticks.as_slice())
    }

    /// Row labels, top to bottom. Blank labels are hidden.
    pub fn y_ticks(&self) -> &[String] {
        self.axes.as_ref().map_or(&[][..], |a| a.y_ticks.as_slice())
    }

    /// Name of the row axis.
    pub fn y_label(&self) -> &str {
        &self.y_label
    }

    /// Name of the column axis.
    pub fn x_label(&self) -> &str {
        &self.x_label
    }

    /// Colour of the cell at display position `(row, col)`.
    pub fn cell_color(&self, row: usize, col: usize) -> Option<[u8; 3]> {
        let value = *self.data.as_ref()?.get((row, col))?;
        let t = self.norm()?.normalize(value)?;
        Some(colormap(t))
    }

    /// Settings the heatmap was built with.
    pub fn settings(&self) -> &HeatmapSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn collapse_halves_until_under_limit() {
        let ticks: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let collapsed = collapse_labels(ticks, 3);
        assert_eq!(collapsed, labels(&["0", "", "", "", "4", "", "", "", "8", ""]));

        let short = labels(&["a", "b"]);
        assert_eq!(collapse_labels(short.clone(), 20), short);
    }

    #[test]
    fn zero_threshold_uses_color_min() {
        let settings = HeatmapSettings::default();
        assert_eq!(
            ColorNorm::from_settings(&settings),
            ColorNorm::SymLog {
                min: 1.0,
                max: 1000.0,
                threshold: 1.0
            }
        );

        let nonpositive = HeatmapSettings {
            color_min: 0.0,
            ..HeatmapSettings::default()
        };
        assert_eq!(
            ColorNorm::from_settings(&nonpositive),
            ColorNorm::Linear {
                min: 0.0,
                max: 1000.0
            }
        );
    }

    #[test]
    fn symlog_is_logarithmic_above_threshold() {
        let norm = ColorNorm::SymLog {
            min: 1.0,
            max: 1000.0,
            threshold: 1.0,
        };
        assert_eq!(norm.normalize(1.0), Some(0.0));
        assert_eq!(norm.normalize(1000.0), Some(1.0));
        let mid = norm.normalize(31.622776601683793).unwrap();
        assert!((mid - 0.5).abs() < 1e-9);
        assert_eq!(norm.normalize(5000.0), Some(1.0));
        assert_eq!(norm.normalize(f64::NAN), None);
    }

    #[test]
    fn colormap_spans_palette() {
        assert_eq!(colormap(0.0), [165, 205, 144]);
        assert_eq!(colormap(1.0), [44, 49, 114]);
        assert_eq!(colormap(-3.0), colormap(0.0));
    }

    #[test]
    fn update_plots_first_when_needed() {
        let mut heatmap = Heatmap::new(
            HeatmapSettings::default(),
            "y",
            vec![0.0, 10.0, 20.0],
            "x",
            vec![0.0, 5.0],
        );
        assert!(!heatmap.is_plotted());
        heatmap.update(Array2::zeros((3, 2)));
        assert!(heatmap.is_plotted());
        assert_eq!(heatmap.y_ticks(), labels(&["20", "10", "0"]).as_slice());
        assert_eq!(heatmap.x_ticks(), labels(&["0", "5"]).as_slice());
    }

    #[test]
    fn from_results_flips_rows() {
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let results = LoadedResults {
            axis_labels: vec!["a".to_string(), "b".to_string()],
            input_label: "m".to_string(),
            axis_values: vec![vec![0.0, 1.0], vec![0.0, 1.0]],
            data,
            rows: 4,
        };
        let heatmap = Heatmap::from_results(&results, HeatmapSettings::default()).unwrap();
        assert_eq!(heatmap.data().unwrap(), &array![[3.0, 4.0], [1.0, 2.0]]);
        assert!(heatmap.cell_color(0, 0).is_some());
        assert!(heatmap.cell_color(2, 0).is_none());
    }

    #[test]
    fn from_results_needs_two_axes() {
        let results = LoadedResults {
            axis_labels: vec!["a".to_string()],
            input_label: "m".to_string(),
            axis_values: vec![vec![0.0, 1.0]],
            data: ArrayD::zeros(IxDyn(&[2])),
            rows: 2,
        };
        assert!(Heatmap::from_results(&results, HeatmapSettings::default()).is_err());
    }
}
