//! Per-iteration deviation tables and their on-disk audit trail.

use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::convergence::IterationObserver;
use crate::errors::ConfigError;
use crate::records::ElementId;

/// File name prefix shared by all snapshot files.
pub const SNAPSHOT_PREFIX: &str = "iteration-";
/// File extension of snapshot files.
pub const SNAPSHOT_EXTENSION: &str = "csv";

/// Comparison of the achieved force against the applied trial tension for one element.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviationRow {
    /// Host element number.
    pub element_id: ElementId,
    /// Target tension, fixed for the run.
    pub target_tension: f64,
    /// Trial tension applied in this iteration.
    pub trial_tension: f64,
    /// Force-I reported by the host at the terminal stage/step.
    pub achieved_force: f64,
    /// `achieved_force - trial_tension`.
    pub deviation: f64,
    /// Deviation as a percentage of the target tension.
    pub deviation_pct: f64,
}

impl DeviationRow {
    /// Derive the deviation columns from one element's numbers.
    ///
    /// # Examples
    /// ```
    /// use cabletune::DeviationRow;
    ///
    /// let row = DeviationRow::compute(2001, 100.0, 100.0, 105.0);
    /// assert_eq!(row.deviation, 5.0);
    /// assert_eq!(row.deviation_pct, 5.0);
    /// assert_eq!(row.next_tension(), 95.0);
    /// ```
    #[must_use]
    pub fn compute(
        element_id: ElementId,
        target_tension: f64,
        trial_tension: f64,
        achieved_force: f64,
    ) -> Self {
        let deviation = achieved_force - trial_tension;
        Self {
            element_id,
            target_tension,
            trial_tension,
            achieved_force,
            deviation,
            deviation_pct: 100.0 * deviation / target_tension,
        }
    }

    /// Trial tension for the next iteration, assuming a unit force response.
    #[must_use]
    pub fn next_tension(&self) -> f64 {
        self.trial_tension - self.deviation
    }
}

/// Frozen deviation table of one iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationSnapshot {
    /// One-based iteration index.
    pub iteration: usize,
    /// Rows in ascending element order.
    pub rows: Vec<DeviationRow>,
}

impl IterationSnapshot {
    /// Create a snapshot.
    #[must_use]
    pub fn new(iteration: usize, rows: Vec<DeviationRow>) -> Self {
        Self { iteration, rows }
    }

    /// Artifact name, e.g. `iteration-07`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{SNAPSHOT_PREFIX}{:02}", self.iteration)
    }

    /// Largest absolute deviation percentage, or zero for an empty table.
    #[must_use]
    pub fn max_abs_deviation_pct(&self) -> f64 {
        self.rows
            .iter()
            .map(|row| row.deviation_pct.abs())
            .fold(0.0, f64::max)
    }

    /// Row for an element.
    #[must_use]
    pub fn row(&self, element: ElementId) -> Option<&DeviationRow> {
        self.rows.iter().find(|row| row.element_id == element)
    }

    /// Render the snapshot as CSV with a header line.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut output = String::from(
            "element_id,target_tension,trial_tension,achieved_force,deviation,deviation_pct\n",
        );
        for row in &self.rows {
            writeln!(
                &mut output,
                "{},{},{},{},{},{}",
                row.element_id,
                row.target_tension,
                row.trial_tension,
                row.achieved_force,
                row.deviation,
                row.deviation_pct
            )
            .expect("writing to string cannot fail");
        }
        output
    }
}

/// Writes every snapshot of a run to `iteration-NN.csv` in a directory.
///
/// Used as an [`IterationObserver`]. A failed write cancels the run and is kept
/// for [`SnapshotWriter::take_error`].
#[derive(Debug)]
pub struct SnapshotWriter {
    /// Destination directory.
    directory: PathBuf,
    /// First write failure, if any.
    error: Option<ConfigError>,
}

impl SnapshotWriter {
    /// Create a writer targeting `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            error: None,
        }
    }

    /// Destination directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path the snapshot is written to.
    #[must_use]
    pub fn path_for(&self, snapshot: &IterationSnapshot) -> PathBuf {
        self.directory
            .join(format!("{}.{SNAPSHOT_EXTENSION}", snapshot.label()))
    }

    /// Remove snapshot files left by an earlier run, returning how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the directory cannot be listed or a file
    /// cannot be removed.
    pub fn clear_stale(&self) -> Result<usize, ConfigError> {
        let io_error = |path: &Path, source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        if !self.directory.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let entries =
            std::fs::read_dir(&self.directory).map_err(|err| io_error(&self.directory, err))?;
        for entry in entries {
            let path = entry.map_err(|err| io_error(&self.directory, err))?.path();
            let is_snapshot = path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(is_snapshot_file_name);
            if is_snapshot {
                std::fs::remove_file(&path).map_err(|err| io_error(&path, err))?;
                debug!(path = %path.display(), "removed stale snapshot");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Write one snapshot, creating the directory when needed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be written.
    pub fn write(&self, snapshot: &IterationSnapshot) -> Result<PathBuf, ConfigError> {
        std::fs::create_dir_all(&self.directory).map_err(|source| ConfigError::Io {
            path: self.directory.display().to_string(),
            source,
        })?;
        let path = self.path_for(snapshot);
        std::fs::write(&path, snapshot.to_csv()).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    /// Take the write failure that cancelled the run, if any.
    pub fn take_error(&mut self) -> Option<ConfigError> {
        self.error.take()
    }
}

impl IterationObserver for SnapshotWriter {
    fn on_iteration(&mut self, snapshot: &IterationSnapshot) -> ControlFlow<()> {
        match self.write(snapshot) {
            Ok(path) => {
                debug!(path = %path.display(), "wrote snapshot");
                ControlFlow::Continue(())
            }
            Err(err) => {
                warn!(error = %err, "cannot write snapshot, cancelling run");
                self.error = Some(err);
                ControlFlow::Break(())
            }
        }
    }
}

/// Whether a file name looks like `iteration-<digits>.csv`.
fn is_snapshot_file_name(name: &str) -> bool {
    name.strip_prefix(SNAPSHOT_PREFIX)
        .and_then(|rest| rest.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}")))
        .is_some_and(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
}
