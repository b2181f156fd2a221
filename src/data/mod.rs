//! Results storage and the heatmap render model.

pub mod heatmap;
pub mod results;

pub use heatmap::{Heatmap, HeatmapSettings};
pub use results::{load, FileSettings, LoadedResults, ResultsWriter};
