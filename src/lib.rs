#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_doc_code_examples)]
#![warn(clippy::missing_docs_in_private_items)]
#![doc = include_str!("../README.md")]

pub mod adapter;
pub mod civil;
pub mod config;
pub mod convergence;
pub mod errors;
pub mod host;
pub mod records;
pub mod snapshot;
pub mod stage;

pub use adapter::{
    force_response_to_table, host_format_to_table, read_tension_file, table_to_force_response,
    table_to_host_format, write_tension_file, FlatTable,
};
pub use civil::CivilClient;
pub use config::{discover_connection, HostConfig, Settings, TuningSettings};
pub use convergence::{
    converge, ConvergeOptions, IterationObserver, NoopObserver, Outcome, TuningReport,
};
pub use errors::{
    AdapterError, ConfigError, ConfigurationError, DataIntegrityError, HostError, TuningError,
};
pub use host::{AnalysisHost, ForceQuery, StageRecord};
pub use records::{ElementId, ElementRecord, TargetTable, TensionTable};
pub use snapshot::{DeviationRow, IterationSnapshot, SnapshotWriter};
pub use stage::{StageStep, StageStepResolver, DEFAULT_STEP_OFFSET_FROM_END};
