//! Grid-search results files.
//!
//! A results file is a CSV with one header row naming the sweep axes and the
//! measured input, followed by one row per measurement in the order they were
//! taken:
//!
//! ```text
//! psu,hv,beam current
//! 0,0,0.12
//! 0,5,0.31
//! 10,5,0.58
//! ```
//!
//! Files are never overwritten: [`ResultsWriter::create_new`] fails if the file
//! exists, and [`FileSettings::generate_path`] picks a unique name.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppResult, LabError};

/// Where and under which name to store results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSettings {
    /// Base file name, without extension
    pub name: String,
    /// Directory, created if missing
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// File extension
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Prefix the name with `<yymmdd>T<HHMM>_`
    #[serde(default = "default_timestamp")]
    pub timestamp: bool,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_extension() -> String {
    "csv".to_string()
}

fn default_timestamp() -> bool {
    true
}

impl FileSettings {
    /// Settings for `name` in the current directory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: default_dir(),
            extension: default_extension(),
            timestamp: default_timestamp(),
        }
    }

    /// Store files in `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// A fresh path for a results file, using the current local time.
    pub fn generate_path(&self) -> AppResult<PathBuf> {
        self.generate_path_at(Local::now().naive_local())
    }

    /// A fresh path for a results file stamped with `now`.
    ///
    /// Creates the directory when missing. When the name is taken, `(1)`,
    /// `(2)`, ... is appended until it is not.
    pub fn generate_path_at(&self, now: NaiveDateTime) -> AppResult<PathBuf> {
        let stem = if self.timestamp {
            format!("{}_{}", now.format("%y%m%dT%H%M"), self.name)
        } else {
            self.name.clone()
        };

        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            debug!(dir = %self.dir.display(), "created results directory");
        }

        let mut path = self.dir.join(format!("{}.{}", stem, self.extension));
        let mut counter = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{}({}).{}", stem, counter, self.extension));
            counter += 1;
        }
        Ok(path)
    }
}

/// Append-only writer for one results file.
///
/// Every row is flushed as it is written so partial results survive a crash.
/// The file is closed when the writer is dropped.
pub struct ResultsWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl ResultsWriter {
    /// Create `path` (which must not exist) and write the header.
    pub fn create_new<S: AsRef<str>>(path: &Path, axis_labels: &[S], input_label: &str) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => LabError::ResultsFileExists(path.to_path_buf()),
                _ => LabError::Io(e),
            })?;

        let mut writer = csv::Writer::from_writer(file);
        let header: Vec<&str> = axis_labels
            .iter()
            .map(AsRef::as_ref)
            .chain(std::iter::once(input_label))
            .collect();
        writer.write_record(&header)?;
        writer.flush()?;

        info!(path = %path.display(), "results file created");
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    /// Append one measurement.
    pub fn append(&mut self, axis_values: &[f64], measured: f64) -> AppResult<()> {
        let record: Vec<String> = axis_values
            .iter()
            .chain(std::iter::once(&measured))
            .map(f64::to_string)
            .collect();
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Number of data rows written.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file, returning its path.
    pub fn finish(mut self) -> AppResult<PathBuf> {
        self.writer.flush()?;
        info!(path = %self.path.display(), rows = self.rows, "results file closed");
        Ok(self.path)
    }
}

/// A results file read back into a matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedResults {
    /// Axis labels, in column order
    pub axis_labels: Vec<String>,
    /// Label of the measured input
    pub input_label: String,
    /// Sorted distinct values of every axis
    pub axis_values: Vec<Vec<f64>>,
    /// Measurements indexed by the sorted position of each axis value; unvisited cells are 0
    pub data: ArrayD<f64>,
    /// Number of data rows in the file
    pub rows: usize,
}

/// Read a results file.
pub fn load(path: &Path) -> AppResult<LoadedResults> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let Some((input_label, axis_labels)) = header.split_last() else {
        return Err(LabError::ResultsFormat(format!("{}: empty header", path.display())));
    };
    if axis_labels.is_empty() {
        return Err(LabError::ResultsFormat(format!(
            "{}: header names no sweep axes",
            path.display()
        )));
    }
    let columns = header.len();

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != columns {
            return Err(LabError::ResultsFormat(format!(
                "{}: row {} has {} fields, expected {}",
                path.display(),
                line + 1,
                record.len(),
                columns
            )));
        }
        let row = record
            .iter()
            .map(|field| field.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| {
                LabError::ResultsFormat(format!("{}: row {}: {}", path.display(), line + 1, e))
            })?;
        rows.push(row);
    }

    let axis_values: Vec<Vec<f64>> = (0..axis_labels.len())
        .map(|axis| {
            let mut values: Vec<f64> = rows.iter().map(|row| row[axis]).collect();
            values.sort_by(f64::total_cmp);
            values.dedup_by(|a, b| a.total_cmp(b).is_eq());
            values
        })
        .collect();

    let shape: Vec<usize> = axis_values.iter().map(Vec::len).collect();
    let mut data = ArrayD::<f64>::zeros(IxDyn(&shape));
    let mut index = vec![0usize; axis_labels.len()];
    for row in &rows {
        for (axis, values) in axis_values.iter().enumerate() {
            index[axis] = values
                .binary_search_by(|v| v.total_cmp(&row[axis]))
                .map_err(|_| LabError::ResultsFormat("inconsistent axis value".to_string()))?;
        }
        data[IxDyn(&index)] = row[axis_labels.len()];
    }

    debug!(path = %path.display(), rows = rows.len(), ?shape, "results loaded");
    Ok(LoadedResults {
        axis_labels: axis_labels.to_vec(),
        input_label: input_label.clone(),
        axis_values,
        data,
        rows: rows.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(12, 5, 0)
            .unwrap()
    }

    #[test]
    fn generated_names_are_stamped_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let settings = FileSettings::new("grid").in_dir(dir.path().join("nested"));

        let first = settings.generate_path_at(noon()).unwrap();
        assert_eq!(first.file_name().unwrap(), "240307T1205_grid.csv");
        assert!(dir.path().join("nested").is_dir());

        File::create(&first).unwrap();
        let second = settings.generate_path_at(noon()).unwrap();
        assert_eq!(second.file_name().unwrap(), "240307T1205_grid(1).csv");
    }

    #[test]
    fn untimestamped_names_use_plain_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = FileSettings::new("series").in_dir(dir.path());
        settings.timestamp = false;
        settings.extension = "txt".to_string();
        let path = settings.generate_path_at(noon()).unwrap();
        assert_eq!(path.file_name().unwrap(), "series.txt");
    }

    #[test]
    fn writer_refuses_existing_file_and_leaves_it_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.csv");
        fs::write(&path, "precious").unwrap();

        let result = ResultsWriter::create_new(&path, &["a"], "m");
        assert!(matches!(result, Err(LabError::ResultsFileExists(p)) if p == path));
        assert_eq!(fs::read_to_string(&path).unwrap(), "precious");
    }

    #[test]
    fn written_rows_load_back_into_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.csv");
        let mut writer = ResultsWriter::create_new(&path, &["x", "y"], "signal").unwrap();
        writer.append(&[0.0, 0.5], 1.25).unwrap();
        writer.append(&[0.0, 0.0], 2.0).unwrap();
        writer.append(&[10.0, 0.0], -3.5).unwrap();
        assert_eq!(writer.rows(), 3);
        writer.finish().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("x,y,signal\n0,0.5,1.25\n"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.axis_labels, vec!["x", "y"]);
        assert_eq!(loaded.input_label, "signal");
        assert_eq!(loaded.axis_values, vec![vec![0.0, 10.0], vec![0.0, 0.5]]);
        assert_eq!(loaded.rows, 3);
        assert_eq!(loaded.data[[0, 1]], 1.25);
        assert_eq!(loaded.data[[0, 0]], 2.0);
        assert_eq!(loaded.data[[1, 0]], -3.5);
        // Never visited
        assert_eq!(loaded.data[[1, 1]], 0.0);
    }

    #[test]
    fn negative_zero_is_its_own_axis_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeros.csv");
        fs::write(&path, "x,m\n-0,1\n0,2\n").unwrap();

        let loaded = load(&path).unwrap();
        let xs = &loaded.axis_values[0];
        assert_eq!(xs.len(), 2);
        assert!(xs[0].is_sign_negative());
        assert!(xs[1].is_sign_positive());
        assert_eq!(loaded.data[[0]], 1.0);
        assert_eq!(loaded.data[[1]], 2.0);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "x,signal\n1,oops\n").unwrap();
        assert!(matches!(load(&path), Err(LabError::ResultsFormat(_))));

        fs::write(&path, "signal\n1\n").unwrap();
        assert!(matches!(load(&path), Err(LabError::ResultsFormat(_))));
    }
}
