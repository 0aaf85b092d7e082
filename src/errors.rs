//! Error types produced while configuring, running or talking to a tuning run.

use thiserror::Error;

use crate::records::ElementId;
use crate::snapshot::IterationSnapshot;

/// Error returned when a tuning run is configured with values it cannot use.
///
/// Every variant is detected before the first host call, so a run that fails
/// with a [`ConfigurationError`] has left the host model untouched.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
    /// Returned when a target tension is zero, which would make the deviation
    /// percentage undefined.
    #[error("element {element} has a zero target tension")]
    ZeroTarget {
        /// Element carrying the zero target.
        element: ElementId,
    },
    /// Returned when a target tension is NaN or infinite.
    #[error("element {element} has a non-finite target tension ({value})")]
    NonFiniteTarget {
        /// Element carrying the rejected target.
        element: ElementId,
        /// Rejected value.
        value: f64,
    },
    /// Returned when an initial trial tension is NaN or infinite.
    #[error("element {element} has a non-finite trial tension ({value})")]
    NonFiniteTension {
        /// Element carrying the rejected tension.
        element: ElementId,
        /// Rejected value.
        value: f64,
    },
    /// Returned when the initial and target tables do not cover the same elements.
    #[error(
        "initial and target tables disagree: elements without a target {without_target:?}, \
         elements without a trial tension {without_tension:?}"
    )]
    MismatchedElements {
        /// Elements present in the trial tensions but missing from the targets.
        without_target: Vec<ElementId>,
        /// Elements present in the targets but missing from the trial tensions.
        without_tension: Vec<ElementId>,
    },
    /// Returned when there is nothing to tune.
    #[error("no elements to tune")]
    NoElements,
    /// Returned when the tolerance is not a positive finite percentage.
    #[error("tolerance must be a positive percentage (received {0})")]
    InvalidTolerance(f64),
    /// Returned when the iteration ceiling is zero.
    #[error("maximum iteration count must be at least 1 (received {0})")]
    InvalidIterationCount(usize),
    /// Returned when the stage/step resolver is asked for a zero row offset.
    #[error("step offset from the end of the step sequence must be at least 1")]
    InvalidStepOffset,
}

/// Error returned by the tabular adapters when a payload is not well formed.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AdapterError {
    /// Returned when a required key is absent.
    #[error("missing required key `{key}`")]
    MissingKey {
        /// Name of the absent key.
        key: String,
    },
    /// Returned when a value has the wrong shape or cannot be converted.
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue {
        /// Key or column holding the value.
        key: String,
        /// Offending value rendered as text.
        value: String,
    },
    /// Returned when a column is not present in a flat table.
    #[error("table has no column named `{0}`")]
    MissingColumn(String),
    /// Returned when a row does not have one cell per column.
    #[error("row {row} has {found} cells but the table has {expected} columns")]
    RaggedRow {
        /// Zero based index of the offending row.
        row: usize,
        /// Number of columns in the header.
        expected: usize,
        /// Number of cells in the row.
        found: usize,
    },
    /// Returned when the same element appears twice in a tension table.
    #[error("element {0} appears more than once")]
    DuplicateElement(ElementId),
    /// Returned when a tension is NaN or infinite.
    #[error("element {element} has a non-finite tension ({value})")]
    NonFiniteTension {
        /// Element carrying the rejected tension.
        element: ElementId,
        /// Rejected value.
        value: f64,
    },
}

/// Error returned when host data cannot be trusted for the current iteration.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DataIntegrityError {
    /// Returned when a force table lacks rows for tracked elements.
    #[error("force table is missing tracked elements {elements:?}")]
    MissingElements {
        /// Elements without a usable row.
        elements: Vec<ElementId>,
    },
    /// Returned when a force value is NaN or infinite.
    #[error("force for element {element} is not finite ({value})")]
    NonFiniteForce {
        /// Element with the unusable force.
        element: ElementId,
        /// Parsed value.
        value: f64,
    },
    /// Returned when several rows of the terminal stage/step report the same element.
    #[error("element {element} has {rows} rows at the terminal stage/step")]
    AmbiguousForce {
        /// Element reported more than once.
        element: ElementId,
        /// Number of matching rows.
        rows: usize,
    },
    /// Returned when an export cannot be repaired into a valid payload.
    #[error("malformed export payload: {0}")]
    MalformedExport(String),
    /// Returned when the host lists no construction stages.
    #[error("host model defines no construction stages")]
    NoStages,
    /// Returned when the calibration query has too few step rows for the offset.
    #[error("calibration table has {rows} step rows, need at least {offset}")]
    ShortStepSequence {
        /// Number of rows returned.
        rows: usize,
        /// Offset from the end that was requested.
        offset: usize,
    },
    /// Returned when an adapter rejects a host payload.
    #[error(transparent)]
    Table(#[from] AdapterError),
}

/// Error returned by an [`AnalysisHost`](crate::AnalysisHost) call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum HostError {
    /// Transport-level failure: timeout, refused connection or rejected key.
    #[error("host request failed: {0}")]
    Request(String),
    /// The host accepted the request but the analysis did not complete.
    #[error("host analysis failed: {0}")]
    Analysis(String),
    /// The host answered with data that cannot be parsed.
    #[error("host returned unusable data: {0}")]
    Data(#[from] DataIntegrityError),
}

impl From<AdapterError> for HostError {
    fn from(err: AdapterError) -> Self {
        HostError::Data(err.into())
    }
}

impl From<reqwest::Error> for HostError {
    fn from(err: reqwest::Error) -> Self {
        HostError::Request(err.to_string())
    }
}

/// Error returned when a tuning run aborts.
///
/// Abort variants carry the iteration they stopped in (`0` while the run is
/// still resolving its stage/step label) and the last completed snapshot so
/// the failure can be diagnosed without re-running.
#[derive(Debug, Error)]
pub enum TuningError {
    /// The run was rejected before any host call.
    #[error("invalid tuning configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    /// A host call failed.
    #[error("iteration {iteration} aborted: {source}")]
    Host {
        /// Iteration in which the failure happened.
        iteration: usize,
        /// Last snapshot completed before the failure.
        last_snapshot: Option<Box<IterationSnapshot>>,
        /// Underlying host failure.
        #[source]
        source: HostError,
    },
    /// Host data did not cover the tracked elements or could not be parsed.
    #[error("iteration {iteration} aborted: {source}")]
    DataIntegrity {
        /// Iteration in which the failure happened.
        iteration: usize,
        /// Last snapshot completed before the failure.
        last_snapshot: Option<Box<IterationSnapshot>>,
        /// Description of the inconsistency.
        #[source]
        source: DataIntegrityError,
    },
}

impl TuningError {
    /// Wrap a host failure, routing unusable host data to [`TuningError::DataIntegrity`].
    pub(crate) fn from_host(
        err: HostError,
        iteration: usize,
        last_snapshot: Option<&IterationSnapshot>,
    ) -> Self {
        let last_snapshot = last_snapshot.cloned().map(Box::new);
        match err {
            HostError::Data(source) => TuningError::DataIntegrity {
                iteration,
                last_snapshot,
                source,
            },
            source => TuningError::Host {
                iteration,
                last_snapshot,
                source,
            },
        }
    }

    /// Iteration at which the run aborted, if it got past configuration.
    #[must_use]
    pub fn iteration(&self) -> Option<usize> {
        match self {
            TuningError::Configuration(_) => None,
            TuningError::Host { iteration, .. } | TuningError::DataIntegrity { iteration, .. } => {
                Some(*iteration)
            }
        }
    }

    /// Last snapshot completed before the abort.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<&IterationSnapshot> {
        match self {
            TuningError::Configuration(_) => None,
            TuningError::Host { last_snapshot, .. }
            | TuningError::DataIntegrity { last_snapshot, .. } => last_snapshot.as_deref(),
        }
    }

    /// Elements named by the failure, when the failure is about specific elements.
    #[must_use]
    pub fn offending_elements(&self) -> Vec<ElementId> {
        match self {
            TuningError::Configuration(ConfigurationError::ZeroTarget { element })
            | TuningError::Configuration(ConfigurationError::NonFiniteTarget { element, .. })
            | TuningError::Configuration(ConfigurationError::NonFiniteTension { element, .. }) => {
                vec![*element]
            }
            TuningError::Configuration(ConfigurationError::MismatchedElements {
                without_target,
                without_tension,
            }) => without_target
                .iter()
                .chain(without_tension)
                .copied()
                .collect(),
            TuningError::DataIntegrity {
                source: DataIntegrityError::MissingElements { elements },
                ..
            } => elements.clone(),
            TuningError::DataIntegrity {
                source:
                    DataIntegrityError::NonFiniteForce { element, .. }
                    | DataIntegrityError::AmbiguousForce { element, .. },
                ..
            } => vec![*element],
            _ => Vec::new(),
        }
    }
}

/// Error returned when loading settings or tension files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when a file cannot be read or written.
    #[error("cannot access {path}: {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// Returned when a settings file is not valid TOML.
    #[error("cannot parse settings: {0}")]
    Toml(#[from] toml::de::Error),
    /// Returned when a tension file is not valid JSON.
    #[error("cannot parse tension file: {0}")]
    Json(#[from] serde_json::Error),
    /// Returned when a tension file parses but has the wrong shape.
    #[error(transparent)]
    Table(#[from] AdapterError),
    /// Returned when a host connection cannot be assembled.
    #[error("invalid host connection: {0}")]
    Connection(String),
}
